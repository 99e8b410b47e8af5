#![allow(dead_code)]

use chrono::NaiveDateTime;
use pacengine::pac::{FixedClock, StaticResolver};
use pacengine::{EngineConfig, PacEngine, ProxyChoice, ProxyScheme, ProxyServer};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const FIXTURE: &str = include_str!("../fixtures/pac.js");

/// Generous execution bound so slow (debug, loaded CI) machines never time out by accident.
pub fn patient_config() -> EngineConfig {
    EngineConfig {
        timeout_ms: 10_000,
        ..EngineConfig::default()
    }
}

pub fn engine_with(config: EngineConfig) -> PacEngine {
    let now = NaiveDateTime::parse_from_str("2024-01-03 12:00:00", "%Y-%m-%d %H:%M:%S")
        .expect("valid timestamp");
    let resolver = StaticResolver::new()
        .with_host("intranet.corp", Ipv4Addr::new(10, 20, 30, 40))
        .with_local_address(Ipv4Addr::new(192, 168, 1, 10));
    PacEngine::new(config)
        .with_resolver(Arc::new(resolver))
        .with_clock(Arc::new(FixedClock::at(now)))
}

pub fn engine_with_script(config: EngineConfig, script: &str) -> PacEngine {
    let engine = engine_with(config);
    engine.load_script(script).expect("script compiles");
    engine
}

pub fn fixture_engine() -> PacEngine {
    engine_with_script(patient_config(), FIXTURE)
}

pub fn proxy(scheme: ProxyScheme, host: &str, port: u16) -> ProxyChoice {
    ProxyChoice::Proxy(ProxyServer::new(scheme, host, port).expect("valid proxy"))
}
