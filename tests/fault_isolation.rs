mod common;

use std::time::{Duration, Instant};

use common::{engine_with, engine_with_script, patient_config};
use pacengine::pac::{ParseError, ScriptError};
use pacengine::{EngineConfig, EvaluationError, SandboxLimits};

fn assert_direct_with<F>(result: &pacengine::EvaluationResult, check: F)
where
    F: FnOnce(&EvaluationError) -> bool,
{
    assert!(result.directive.is_direct());
    let diagnostics = result.diagnostics.as_ref().expect("diagnostics attached");
    assert!(check(diagnostics), "unexpected diagnostics: {diagnostics:?}");
}

#[test]
fn runaway_scripts_are_cut_off() {
    let config = EngineConfig {
        timeout_ms: 150,
        ..EngineConfig::default()
    };
    let engine = engine_with_script(
        config,
        "function FindProxyForURL(url, host) { while (true) {} }",
    );

    let started = Instant::now();
    let result = engine.evaluate("http://spin.example/", "spin.example");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_direct_with(&result, |e| {
        matches!(e, EvaluationError::Script(ScriptError::Timeout(_)))
    });
    assert_eq!(engine.cached_entries(), 0);
}

#[test]
fn regex_backtracking_is_cut_off_and_the_engine_recovers() {
    let config = EngineConfig {
        timeout_ms: 100,
        limits: SandboxLimits {
            max_workers: 1,
            ..SandboxLimits::default()
        },
        ..EngineConfig::default()
    };
    let engine = engine_with_script(
        config,
        r#"function FindProxyForURL(url, host) {
            if (host == "spin.example") {
                /^(a+)+$/.test("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab");
            }
            return "PROXY fine:3128";
        }"#,
    );

    let started = Instant::now();
    let stuck = engine.evaluate("http://spin.example/", "spin.example");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_direct_with(&stuck, |e| {
        matches!(e, EvaluationError::Script(ScriptError::Timeout(_)))
    });

    let fine = engine.evaluate("http://fine.example/", "fine.example");
    assert_eq!(fine.diagnostics, None);
    assert_eq!(fine.directive.to_string(), "PROXY fine:3128");
}

#[test]
fn allocation_bombs_fall_back_without_crashing() {
    let config = EngineConfig {
        limits: SandboxLimits {
            max_heap_bytes: 32 * 1024 * 1024,
            ..SandboxLimits::default()
        },
        ..patient_config()
    };
    let engine = engine_with_script(
        config,
        r#"function FindProxyForURL(url, host) {
            if (host == "bomb.example") {
                var s = "xxxxxxxxxxxxxxxx";
                for (var i = 0; i < 40; i++) { s = s + s; }
            }
            if (host == "hoard.example") {
                var chunks = [];
                for (;;) { chunks.push(new Array(1 << 20).join("x")); }
            }
            return "PROXY fine:3128";
        }"#,
    );

    for host in ["bomb.example", "hoard.example"] {
        let result = engine.evaluate(&format!("http://{host}/"), host);
        assert_direct_with(&result, |e| {
            matches!(e, EvaluationError::Script(ScriptError::Runtime(_)))
        });
    }
    let fine = engine.evaluate("http://fine.example/", "fine.example");
    assert_eq!(fine.directive.to_string(), "PROXY fine:3128");
}

#[test]
fn malformed_predicate_arguments_are_false() {
    let engine = engine_with_script(
        patient_config(),
        r#"function FindProxyForURL(url, host) {
            if (timeRange(0, 0, 4294967295, 0)) return "PROXY a:1";
            if (dateRange("2024", "2147483647")) return "PROXY a:2";
            if (isInNet(host, "10.0.0", "255.0.0.0")) return "PROXY a:3";
            return "PROXY b:2";
        }"#,
    );
    let result = engine.evaluate("http://x.example/", "x.example");
    assert_eq!(result.diagnostics, None);
    assert_eq!(result.directive.to_string(), "PROXY b:2");
}

#[test]
fn thrown_errors_fall_back() {
    let engine = engine_with_script(
        patient_config(),
        r#"function FindProxyForURL(url, host) { throw new Error("boom"); }"#,
    );
    let result = engine.evaluate("http://a.example/", "a.example");
    assert_direct_with(&result, |e| match e {
        EvaluationError::Script(ScriptError::Runtime(msg)) => msg.contains("boom"),
        _ => false,
    });
}

#[test]
fn contract_violations_fall_back() {
    let engine = engine_with_script(
        patient_config(),
        "function FindProxyForURL(url, host) { return 42; }",
    );
    let result = engine.evaluate("http://a.example/", "a.example");
    assert_direct_with(&result, |e| {
        matches!(e, EvaluationError::Script(ScriptError::Type(_)))
    });

    engine.load_script("var FindProxyForURL = 'not a function';").unwrap();
    let result = engine.evaluate("http://a.example/", "a.example");
    assert_direct_with(&result, |e| {
        matches!(e, EvaluationError::Script(ScriptError::Type(_)))
    });
}

#[test]
fn unusable_directives_fall_back() {
    let engine = engine_with_script(
        patient_config(),
        r#"function FindProxyForURL(url, host) {
            if (host == "bad-scheme") return "TELNET relay:23";
            if (host == "bad-port") return "PROXY relay:99999";
            return "";
        }"#,
    );

    let result = engine.evaluate("http://bad-scheme/", "bad-scheme");
    assert_direct_with(&result, |e| {
        matches!(e, EvaluationError::Directive(ParseError::UnknownScheme(_)))
    });
    let result = engine.evaluate("http://bad-port/", "bad-port");
    assert_direct_with(&result, |e| matches!(e, EvaluationError::Directive(_)));
    let result = engine.evaluate("http://empty/", "empty");
    assert_direct_with(&result, |e| {
        matches!(e, EvaluationError::Directive(ParseError::Empty))
    });
    assert_eq!(engine.cached_entries(), 0);
}

#[test]
fn failures_are_not_cached() {
    let engine = engine_with_script(
        patient_config(),
        r#"function FindProxyForURL(url, host) { throw "nope"; }"#,
    );
    engine.evaluate("http://a.example/", "a.example");
    engine.evaluate("http://a.example/", "a.example");
    assert_eq!(engine.execution_count(), 2);
    assert_eq!(engine.cached_entries(), 0);
}

#[test]
fn faulty_reload_keeps_the_working_script() {
    let engine = engine_with_script(
        patient_config(),
        r#"function FindProxyForURL(url, host) { return "PROXY good:8080"; }"#,
    );
    let err = engine
        .load_script("function FindProxyForURL(url, host) { return ")
        .unwrap_err();
    assert!(matches!(err, ScriptError::Compile(_)));

    let result = engine.evaluate("http://a.example/", "a.example");
    assert_eq!(result.diagnostics, None);
    assert_eq!(result.directive.to_string(), "PROXY good:8080");
}

#[test]
fn one_bad_host_does_not_poison_others() {
    let config = EngineConfig {
        timeout_ms: 150,
        ..EngineConfig::default()
    };
    let engine = engine_with_script(
        config,
        r#"function FindProxyForURL(url, host) {
            if (host == "hang.example") { while (true) {} }
            return "PROXY fine:3128";
        }"#,
    );

    let hung = engine.evaluate("http://hang.example/", "hang.example");
    assert!(hung.is_fallback());
    let fine = engine.evaluate("http://ok.example/", "ok.example");
    assert_eq!(fine.diagnostics, None);
    assert_eq!(fine.directive.to_string(), "PROXY fine:3128");
}

#[test]
fn helpers_see_injected_capabilities() {
    let engine = engine_with_script(
        patient_config(),
        r#"function FindProxyForURL(url, host) {
            if (!isResolvable(host)) return "DIRECT";
            if (isInNet(dnsResolve(host), "10.0.0.0", "255.0.0.0")
                && isInNet(myIpAddress(), "192.168.1.0", "255.255.255.0")
                && weekdayRange("MON", "FRI")
                && timeRange(9, 17)
                && shExpMatch(url, "http://*.corp/*")) {
                return "SOCKS5 gateway.corp:1080";
            }
            return "PROXY elsewhere:80";
        }"#,
    );

    let result = engine.evaluate("http://intranet.corp/wiki", "intranet.corp");
    assert_eq!(result.directive.to_string(), "SOCKS5 gateway.corp:1080");
    let result = engine.evaluate("http://unknown.corp/", "unknown.corp");
    assert!(result.directive.is_direct());
    assert_eq!(result.diagnostics, None);
}

#[test]
fn missing_scripts_fall_back() {
    let engine = engine_with(patient_config());
    let result = engine.evaluate("http://a.example/", "a.example");
    assert_direct_with(&result, |e| matches!(e, EvaluationError::NoScript));
    assert!(engine.script_digest().is_none());
}
