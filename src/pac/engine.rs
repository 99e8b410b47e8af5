// src/pac/engine.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::cache::{CacheKey, ResultCache};
use super::capabilities::{Clock, HostResolver, SystemClock, SystemResolver};
use super::directive::{ParseError, ProxyDirective};
use super::downloader::{discover_wpad, download_pac, FetchError};
use super::sandbox::{CancelToken, ExecutionError, HostEnv, Sandbox, ScriptError, ScriptUnit};
use crate::config::EngineConfig;
use crate::{log_debug, log_info, log_warn};

const WAIT_POLL: Duration = Duration::from_millis(5);

/// Why an evaluation fell back to DIRECT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("script returned an unusable directive: {0}")]
    Directive(#[from] ParseError),
    #[error("no PAC script loaded")]
    NoScript,
    #[error("cannot derive a host from `{0}`")]
    InvalidUrl(String),
    #[error("evaluation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cannot read PAC script {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("evaluation cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub url: String,
    pub host: String,
}

impl EvaluationRequest {
    pub fn new(url: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host: host.into(),
        }
    }

    /// Builds a request whose host is taken from the URL authority.
    pub fn from_url(url: &str) -> Result<Self, EvaluationError> {
        let invalid = || EvaluationError::InvalidUrl(url.to_string());
        let parsed = url::Url::parse(url).map_err(|_| invalid())?;
        let host = parsed
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?;
        Ok(Self::new(url, host))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationResult {
    pub directive: ProxyDirective,
    /// Set when the directive is the DIRECT fallback for a failed evaluation.
    pub diagnostics: Option<EvaluationError>,
    pub from_cache: bool,
}

impl EvaluationResult {
    fn resolved(directive: ProxyDirective) -> Self {
        Self {
            directive,
            diagnostics: None,
            from_cache: false,
        }
    }

    fn cached(directive: ProxyDirective) -> Self {
        Self {
            directive,
            diagnostics: None,
            from_cache: true,
        }
    }

    fn fallback(error: EvaluationError) -> Self {
        Self {
            directive: ProxyDirective::direct(),
            diagnostics: Some(error),
            from_cache: false,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.diagnostics.is_some()
    }
}

type FlightKey = (u64, CacheKey);

#[derive(Debug, Default)]
enum FlightState {
    #[default]
    Pending,
    Done(EvaluationResult),
    Abandoned,
}

/// One script execution that identical concurrent requests share.
#[derive(Debug, Default)]
struct Flight {
    state: Mutex<FlightState>,
    ready: Condvar,
}

impl Flight {
    fn settle(&self, state: FlightState) {
        *lock(&self.state) = state;
        self.ready.notify_all();
    }

    /// `Ok(None)` means the leader gave up and the caller should retry.
    fn wait(&self, cancel: &CancelToken) -> Result<Option<EvaluationResult>, Cancelled> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                FlightState::Done(result) => return Ok(Some(result.clone())),
                FlightState::Abandoned => return Ok(None),
                FlightState::Pending => {}
            }
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            state = match self.ready.wait_timeout(state, WAIT_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Held by the leader of a flight; abandons the flight if dropped unsettled.
struct FlightLease<'a> {
    flights: &'a Mutex<HashMap<FlightKey, Arc<Flight>>>,
    key: FlightKey,
    flight: Arc<Flight>,
    settled: bool,
}

impl FlightLease<'_> {
    fn complete(mut self, result: &EvaluationResult) {
        self.flight.settle(FlightState::Done(result.clone()));
        self.settled = true;
    }
}

impl Drop for FlightLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.flight.settle(FlightState::Abandoned);
        }
        let mut flights = lock(self.flights);
        if flights
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.flight))
        {
            flights.remove(&self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the fragment and credentials; unparseable input is used verbatim.
fn normalize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.into()
        }
        Err(_) => url.to_string(),
    }
}

/// Evaluates requests against the currently loaded PAC script.
///
/// Script faults never surface as errors from `evaluate*`: they produce a
/// `[DIRECT]` directive with diagnostics attached.
pub struct PacEngine {
    config: EngineConfig,
    sandbox: Sandbox,
    resolver: Arc<dyn HostResolver>,
    clock: Arc<dyn Clock>,
    script: RwLock<Option<Arc<ScriptUnit>>>,
    cache: Mutex<ResultCache>,
    flights: Mutex<HashMap<FlightKey, Arc<Flight>>>,
    generations: AtomicU64,
}

impl Default for PacEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl PacEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config.limits.clone(), config.timeout()),
            cache: Mutex::new(ResultCache::new(config.cache_capacity, config.cache_ttl())),
            config,
            resolver: Arc::new(SystemResolver),
            clock: Arc::new(SystemClock),
            script: RwLock::new(None),
            flights: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles `source` and makes it the active script.
    ///
    /// On error the previous script stays active. A changed script also empties
    /// the cache; reloading identical source keeps it.
    pub fn load_script(&self, source: &str) -> Result<(), ScriptError> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let unit = self.sandbox.compile(source, generation).map_err(|e| {
            log_warn!("Rejected PAC script: {}", e);
            e
        })?;

        let mut active = self.script.write().unwrap_or_else(PoisonError::into_inner);
        if active
            .as_ref()
            .is_some_and(|current| current.digest() == unit.digest())
        {
            log_debug!("PAC script unchanged (sha256 {})", unit.digest());
            return Ok(());
        }
        lock(&self.cache).reset(unit.generation());
        log_info!(
            "Loaded PAC script ({} bytes, sha256 {})",
            source.len(),
            unit.digest()
        );
        *active = Some(Arc::new(unit));
        Ok(())
    }

    pub fn load_script_from_url(&self, pac_url: &str) -> Result<(), LoadError> {
        let script = download_pac(
            pac_url,
            self.config.fetch_timeout(),
            self.config.limits.max_script_bytes,
        )?;
        self.load_script(&script)?;
        Ok(())
    }

    pub fn load_script_from_file(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let script = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_script(&script)?;
        Ok(())
    }

    /// Loads the first WPAD script found for `fqdn` and returns where it came from.
    pub fn discover_script(&self, fqdn: &str) -> Result<String, LoadError> {
        let (location, script) = discover_wpad(
            fqdn,
            self.config.fetch_timeout(),
            self.config.limits.max_script_bytes,
        )?;
        self.load_script(&script)?;
        log_info!("Using WPAD script from {}", location);
        Ok(location)
    }

    pub fn invalidate_cache(&self) {
        lock(&self.cache).clear();
        log_debug!("PAC result cache invalidated");
    }

    pub fn script_digest(&self) -> Option<String> {
        self.current_script().map(|unit| unit.digest().to_string())
    }

    pub fn cached_entries(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Number of sandboxed script executions so far.
    pub fn execution_count(&self) -> u64 {
        self.sandbox.execution_count()
    }

    pub fn evaluate(&self, url: &str, host: &str) -> EvaluationResult {
        self.evaluate_with_cancel(url, host, &CancelToken::new())
            .unwrap_or_else(|Cancelled| EvaluationResult::fallback(EvaluationError::Cancelled))
    }

    pub fn evaluate_request(&self, request: &EvaluationRequest) -> EvaluationResult {
        self.evaluate(&request.url, &request.host)
    }

    pub fn evaluate_url(&self, url: &str) -> EvaluationResult {
        match EvaluationRequest::from_url(url) {
            Ok(request) => self.evaluate_request(&request),
            Err(err) => self.fail(url, "", err),
        }
    }

    /// Like [`PacEngine::evaluate`], but gives up as soon as `cancel` fires.
    /// A cancelled evaluation leaves the cache untouched.
    pub fn evaluate_with_cancel(
        &self,
        url: &str,
        host: &str,
        cancel: &CancelToken,
    ) -> Result<EvaluationResult, Cancelled> {
        let url = normalize_url(url);
        let Some(unit) = self.current_script() else {
            return Ok(self.fail(&url, host, EvaluationError::NoScript));
        };
        let key = CacheKey::new(self.config.cache_key, &url, host);
        let flight_key = (unit.generation(), key.clone());

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if let Some(directive) = lock(&self.cache).get(unit.generation(), &key, Instant::now()) {
                return Ok(EvaluationResult::cached(directive));
            }

            let (flight, leader) = self.join_flight(&flight_key);
            if !leader {
                match flight.wait(cancel)? {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            }
            let lease = FlightLease {
                flights: &self.flights,
                key: flight_key.clone(),
                flight,
                settled: false,
            };

            // A previous leader may have stored its result after our first lookup.
            let stamp = {
                let mut cache = lock(&self.cache);
                if let Some(directive) = cache.get(unit.generation(), &key, Instant::now()) {
                    let result = EvaluationResult::cached(directive);
                    lease.complete(&result);
                    return Ok(result);
                }
                cache.stamp()
            };

            let result = self.run_script(&unit, &url, host, cancel)?;
            if !result.is_fallback() && stamp.generation() == unit.generation() {
                lock(&self.cache).insert(stamp, key, result.directive.clone(), Instant::now());
            }
            lease.complete(&result);
            return Ok(result);
        }
    }

    fn current_script(&self) -> Option<Arc<ScriptUnit>> {
        self.script
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn join_flight(&self, key: &FlightKey) -> (Arc<Flight>, bool) {
        let mut flights = lock(&self.flights);
        if let Some(flight) = flights.get(key) {
            return (Arc::clone(flight), false);
        }
        let flight = Arc::new(Flight::default());
        flights.insert(key.clone(), Arc::clone(&flight));
        (flight, true)
    }

    fn run_script(
        &self,
        unit: &ScriptUnit,
        url: &str,
        host: &str,
        cancel: &CancelToken,
    ) -> Result<EvaluationResult, Cancelled> {
        let env = HostEnv::new(Arc::clone(&self.resolver), self.clock.now());
        let raw = match self.sandbox.execute(unit, url, host, env, cancel) {
            Ok(raw) => raw,
            Err(ExecutionError::Cancelled) => return Err(Cancelled),
            Err(ExecutionError::Failed(err)) => return Ok(self.fail(url, host, err.into())),
        };

        match raw.parse::<ProxyDirective>() {
            Ok(directive) => {
                let directive = if self.config.append_direct_fallback {
                    directive.with_direct_fallback()
                } else {
                    directive
                };
                log_debug!("PAC resolved {} (host {}) -> {}", url, host, directive);
                Ok(EvaluationResult::resolved(directive))
            }
            Err(err) => Ok(self.fail(url, host, err.into())),
        }
    }

    fn fail(&self, url: &str, host: &str, err: EvaluationError) -> EvaluationResult {
        log_warn!(
            "PAC evaluation failed for {} (host {}): {}. Falling back to DIRECT",
            url,
            host,
            err
        );
        EvaluationResult::fallback(err)
    }
}
