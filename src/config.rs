// src/config.rs
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::env_proxy::lookup_var;
use crate::log_warn;

/// Which parts of a request identify a cached directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyMode {
    #[default]
    UrlAndHost,
    /// Ignores the URL; only valid for scripts that never look at it.
    HostOnly,
}

impl FromStr for CacheKeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" | "url_and_host" => Ok(CacheKeyMode::UrlAndHost),
            "host" | "host_only" => Ok(CacheKeyMode::HostOnly),
            other => Err(format!("unknown cache key mode `{other}`")),
        }
    }
}

/// Resource bounds for a single script execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Script heap cap; allocations beyond it raise an out-of-memory error in the script.
    pub max_heap_bytes: usize,
    /// Native stack the interpreter may use before raising a stack overflow.
    /// Must stay well below `worker_stack_bytes`.
    pub max_stack_bytes: usize,
    pub max_script_bytes: usize,
    /// Concurrently running workers, including ones still winding down after a timeout.
    pub max_workers: usize,
    pub worker_stack_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_heap_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 1024 * 1024,
            max_script_bytes: 1024 * 1024,
            max_workers: 64,
            worker_stack_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timeout_ms: u64,
    /// Zero disables caching.
    pub cache_capacity: usize,
    pub cache_ttl_secs: Option<u64>,
    pub cache_key: CacheKeyMode,
    pub append_direct_fallback: bool,
    pub fetch_timeout_secs: u64,
    pub limits: SandboxLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            cache_capacity: 1024,
            cache_ttl_secs: None,
            cache_key: CacheKeyMode::UrlAndHost,
            append_direct_fallback: false,
            fetch_timeout_secs: 15,
            limits: SandboxLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Defaults overridden by `PAC_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `pac_*` / `PAC_*` overrides from `lookup`; bad values are logged and skipped.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "pac_timeout_ms", &mut self.timeout_ms);
        override_with(&lookup, "pac_cache_capacity", &mut self.cache_capacity);
        override_with(&lookup, "pac_cache_key", &mut self.cache_key);
        override_with(&lookup, "pac_direct_fallback", &mut self.append_direct_fallback);
        override_with(&lookup, "pac_fetch_timeout_secs", &mut self.fetch_timeout_secs);
        override_with(&lookup, "pac_max_script_bytes", &mut self.limits.max_script_bytes);
        override_with(&lookup, "pac_max_heap_bytes", &mut self.limits.max_heap_bytes);
        override_with(&lookup, "pac_max_workers", &mut self.limits.max_workers);

        let mut ttl = 0u64;
        if override_with(&lookup, "pac_cache_ttl_secs", &mut ttl) {
            self.cache_ttl_secs = (ttl > 0).then_some(ttl);
        }
        self
    }
}

fn override_with<F, T>(lookup: &F, name: &str, slot: &mut T) -> bool
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup_var(lookup, name, true) else {
        return false;
    };
    match raw.trim().parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => {
            log_warn!("Ignoring invalid value {:?} for {}", raw, name.to_uppercase());
            false
        }
    }
}
