// src/lib.rs
pub mod config;
pub mod env_proxy;
pub mod log;
pub mod pac;

pub use config::{CacheKeyMode, EngineConfig, SandboxLimits};
pub use pac::{
    CancelToken, EvaluationError, EvaluationRequest, EvaluationResult, PacEngine, ProxyChoice,
    ProxyDirective, ProxyScheme, ProxyServer,
};

/// Picks the proxy route for `url`, following the usual priority order:
///
/// 1. Environment variables (`https_proxy`, `no_proxy`, ...)
/// 2. The PAC script loaded into `engine`
/// 3. DIRECT, when the script is missing or fails
///
/// # Examples
///
/// ```no_run
/// use pacengine::{find_proxy_for_url, PacEngine};
///
/// let engine = PacEngine::default();
/// engine.load_script(r#"function FindProxyForURL(url, host) { return "DIRECT"; }"#)?;
/// let result = find_proxy_for_url(&engine, "https://httpbin.org/ip");
/// println!("{}", result.directive); // DIRECT or PROXY host:port
/// # Ok::<(), pacengine::pac::ScriptError>(())
/// ```
pub fn find_proxy_for_url(engine: &PacEngine, url: &str) -> EvaluationResult {
    find_proxy_with_env(engine, url, |name| std::env::var(name).ok())
}

/// [`find_proxy_for_url`] with environment variables read through `lookup`.
pub fn find_proxy_with_env<F>(engine: &PacEngine, url: &str, lookup: F) -> EvaluationResult
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(directive) = env_proxy::env_proxy_with(url, lookup) {
        log_info!("Using environment proxy: {}", directive);
        return EvaluationResult {
            directive,
            diagnostics: None,
            from_cache: false,
        };
    }

    let result = engine.evaluate_url(url);
    if !result.is_fallback() {
        log_info!("PAC resolved proxy: {}", result.directive);
    }
    result
}
