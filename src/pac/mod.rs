// src/pac/mod.rs
pub mod cache;
pub mod capabilities;
pub mod directive;
pub mod downloader;
pub mod engine;
pub mod predicates;
pub mod sandbox;

pub use capabilities::{Clock, FixedClock, HostResolver, Moment, StaticResolver, SystemClock, SystemResolver};
pub use directive::{ParseError, ProxyChoice, ProxyDirective, ProxyScheme, ProxyServer};
pub use downloader::FetchError;
pub use engine::{Cancelled, EvaluationError, EvaluationRequest, EvaluationResult, LoadError, PacEngine};
pub use sandbox::{CancelToken, ScriptError};

/// True when `s` looks like a PAC script location rather than a proxy address.
pub fn is_pac_url(s: &str) -> bool {
    let lower = s.to_lowercase();
    lower.ends_with(".pac") || lower.contains("proxy.pac") || lower.contains("wpad.dat")
}
