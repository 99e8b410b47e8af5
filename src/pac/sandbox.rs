// src/pac/sandbox.rs
//! Runs untrusted PAC scripts inside QuickJS (`rquickjs`).
//!
//! Every call gets a fresh runtime on its own worker thread. The only globals
//! added to the bare (I/O free) context are the PAC helpers. Each runtime carries
//! a heap cap, a native stack cap and an interrupt handler that stops the script
//! at the deadline or on cancellation, so a worker never outlives its evaluation
//! by more than the shutdown grace.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::convert::Coerced;
use rquickjs::function::{IntoJsFunc, Rest};
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, IntoJs, Runtime, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::capabilities::{HostResolver, Moment};
use super::predicates;
use crate::config::SandboxLimits;
use crate::{log_debug, log_warn};

pub const ENTRY_POINT: &str = "FindProxyForURL";

const CANCEL_POLL: Duration = Duration::from_millis(5);
/// How long a caller waits past the deadline for an interrupted worker to report.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("script failed to compile: {0}")]
    Compile(String),
    #[error("script raised an error: {0}")]
    Runtime(String),
    #[error("script did not finish within {0:?}")]
    Timeout(Duration),
    #[error("entry point contract violated: {0}")]
    Type(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Failed(#[from] ScriptError),
    #[error("execution cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a caller and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A PAC script whose syntax has been checked, immutable once built.
///
/// This holds validated source text, not bytecode: QuickJS bytecode is tied to the
/// runtime that produced it, and every execution gets a fresh runtime, so each run
/// compiles the source again.
#[derive(Debug)]
pub struct ScriptUnit {
    source: Arc<str>,
    digest: String,
    generation: u64,
}

impl ScriptUnit {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex SHA-256 of the source text.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What the PAC helpers can reach on the host side during one evaluation.
#[derive(Clone)]
pub struct HostEnv {
    resolver: Arc<dyn HostResolver>,
    moment: Moment,
}

impl HostEnv {
    pub fn new(resolver: Arc<dyn HostResolver>, moment: Moment) -> Self {
        Self { resolver, moment }
    }
}

/// Stop condition polled by the QuickJS interrupt handler.
#[derive(Clone)]
struct Interrupt {
    deadline: Instant,
    timeout: Duration,
    cancel: CancelToken,
    tripped: Arc<AtomicBool>,
}

impl Interrupt {
    fn new(timeout: Duration, cancel: &CancelToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            cancel: cancel.clone(),
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn should_stop(&self) -> bool {
        let stop = self.cancel.is_cancelled() || Instant::now() >= self.deadline;
        if stop {
            self.tripped.store(true, Ordering::SeqCst);
        }
        stop
    }

    /// Errors raised after the handler fired are reported as the reason it fired.
    fn classify(&self, err: ScriptError) -> ExecutionError {
        if !self.tripped.load(Ordering::SeqCst) {
            return err.into();
        }
        if self.cancel.is_cancelled() {
            ExecutionError::Cancelled
        } else {
            ScriptError::Timeout(self.timeout).into()
        }
    }
}

pub struct Sandbox {
    limits: SandboxLimits,
    timeout: Duration,
    executions: AtomicU64,
    live_workers: Arc<AtomicUsize>,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits, timeout: Duration) -> Self {
        Self {
            limits,
            timeout,
            executions: AtomicU64::new(0),
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of script executions started so far.
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Checks that `source` parses, without running any of it.
    pub fn compile(&self, source: &str, generation: u64) -> Result<ScriptUnit, ScriptError> {
        if source.len() > self.limits.max_script_bytes {
            return Err(ScriptError::Compile(format!(
                "script is {} bytes, limit is {}",
                source.len(),
                self.limits.max_script_bytes
            )));
        }
        if source.trim().is_empty() {
            return Err(ScriptError::Compile("script is empty".into()));
        }

        let source: Arc<str> = Arc::from(source);
        let slot = self.acquire_slot()?;
        let job_source = Arc::clone(&source);
        let limits = self.limits.clone();
        match self.run_worker(slot, &CancelToken::new(), move |interrupt| {
            check_syntax(&job_source, &limits, interrupt)
        }) {
            Ok(()) => {}
            Err(ExecutionError::Failed(err)) => return Err(err),
            Err(ExecutionError::Cancelled) => {
                return Err(ScriptError::Runtime("syntax check cancelled".into()))
            }
        }

        Ok(ScriptUnit {
            digest: format!("{:x}", Sha256::digest(source.as_bytes())),
            source,
            generation,
        })
    }

    /// Calls `FindProxyForURL(url, host)` and returns the raw directive string.
    pub fn execute(
        &self,
        unit: &ScriptUnit,
        url: &str,
        host: &str,
        env: HostEnv,
        cancel: &CancelToken,
    ) -> Result<String, ExecutionError> {
        let slot = self.acquire_slot()?;
        self.executions.fetch_add(1, Ordering::SeqCst);

        let source = Arc::clone(&unit.source);
        let limits = self.limits.clone();
        let url = url.to_string();
        let host = host.to_string();
        self.run_worker(slot, cancel, move |interrupt| {
            run_entry_point(&source, &limits, env, &url, &host, interrupt)
        })
    }

    fn acquire_slot(&self) -> Result<WorkerSlot, ScriptError> {
        WorkerSlot::acquire(&self.live_workers, self.limits.max_workers).ok_or_else(|| {
            ScriptError::Runtime("sandbox saturated: too many running scripts".into())
        })
    }

    /// Runs `job` on a fresh worker thread and waits for it.
    ///
    /// The worker frees its slot before reporting, so once a result arrives the slot
    /// is available again. After a timeout or cancellation the caller keeps waiting
    /// up to [`SHUTDOWN_GRACE`] for the interrupted worker to wind down.
    fn run_worker<T, F>(
        &self,
        slot: WorkerSlot,
        cancel: &CancelToken,
        job: F,
    ) -> Result<T, ExecutionError>
    where
        T: Send + 'static,
        F: FnOnce(&Interrupt) -> Result<T, ScriptError> + Send + 'static,
    {
        let interrupt = Interrupt::new(self.timeout, cancel);
        let worker_interrupt = interrupt.clone();
        let (tx, rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("pac-sandbox".into())
            .stack_size(self.limits.worker_stack_bytes)
            .spawn(move || {
                let outcome = job(&worker_interrupt).map_err(|e| worker_interrupt.classify(e));
                drop(slot);
                let _ = tx.send(outcome);
            })
            .map_err(|e| ScriptError::Runtime(format!("failed to start sandbox worker: {e}")))?;

        let mut stop_waiting = interrupt.deadline + SHUTDOWN_GRACE;
        let mut cancelled = false;
        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(_) if cancelled || cancel.is_cancelled() => {
                    return Err(ExecutionError::Cancelled)
                }
                Ok(outcome) => return outcome,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    if cancel.is_cancelled() && !cancelled {
                        log_debug!("PAC evaluation cancelled by caller");
                        cancelled = true;
                        stop_waiting = stop_waiting.min(now + SHUTDOWN_GRACE);
                    }
                    if now < stop_waiting {
                        continue;
                    }
                    if cancelled {
                        return Err(ExecutionError::Cancelled);
                    }
                    log_warn!(
                        "PAC worker ignored its {:?} deadline, abandoning it",
                        self.timeout
                    );
                    return Err(ScriptError::Timeout(self.timeout).into());
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(
                        ScriptError::Runtime("sandbox worker terminated abnormally".into()).into(),
                    );
                }
            }
        }
    }
}

/// Counts a running worker for as long as it lives.
struct WorkerSlot(Arc<AtomicUsize>);

impl WorkerSlot {
    fn acquire(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| WorkerSlot(Arc::clone(live)))
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bounded runtime: heap cap, native stack cap and the interrupt handler.
fn bounded_context(limits: &SandboxLimits, interrupt: &Interrupt) -> Result<(Runtime, Context), ScriptError> {
    let setup = |e: rquickjs::Error| ScriptError::Runtime(format!("failed to create script runtime: {e}"));
    let runtime = Runtime::new().map_err(setup)?;
    runtime.set_memory_limit(limits.max_heap_bytes);
    runtime.set_max_stack_size(limits.max_stack_bytes);
    let interrupt = interrupt.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_stop())));
    let context = Context::full(&runtime).map_err(setup)?;
    Ok((runtime, context))
}

fn runtime_error(err: CaughtError<'_>) -> ScriptError {
    ScriptError::Runtime(err.to_string())
}

/// Parses `source` as a function body through the `Function` constructor, which
/// compiles without evaluating anything.
fn check_syntax(source: &str, limits: &SandboxLimits, interrupt: &Interrupt) -> Result<(), ScriptError> {
    let (_runtime, context) = bounded_context(limits, interrupt)?;
    context.with(|ctx| {
        let constructor: Function = ctx.globals().get("Function").catch(&ctx).map_err(runtime_error)?;
        constructor
            .call::<_, Value>((source,))
            .catch(&ctx)
            .map(|_| ())
            .map_err(|e| ScriptError::Compile(e.to_string()))
    })
}

fn run_entry_point(
    source: &str,
    limits: &SandboxLimits,
    env: HostEnv,
    url: &str,
    host: &str,
    interrupt: &Interrupt,
) -> Result<String, ScriptError> {
    let (_runtime, context) = bounded_context(limits, interrupt)?;
    context.with(|ctx| {
        register_pac_functions(&ctx, &env)
            .map_err(|e| ScriptError::Runtime(format!("failed to install PAC helpers: {e}")))?;

        ctx.eval::<(), _>(source).catch(&ctx).map_err(runtime_error)?;

        let entry: Value = ctx.globals().get(ENTRY_POINT).catch(&ctx).map_err(runtime_error)?;
        let Some(entry) = entry.as_function() else {
            return Err(ScriptError::Type(format!("{ENTRY_POINT} is not a function")));
        };
        let result: Value = entry.call((url, host)).catch(&ctx).map_err(runtime_error)?;

        match result.as_string() {
            Some(text) => text
                .to_string()
                .map_err(|e| ScriptError::Type(format!("{ENTRY_POINT} returned an unreadable string: {e}"))),
            None => Err(ScriptError::Type(format!(
                "{ENTRY_POINT} returned a non-string value ({:?})",
                result.type_of()
            ))),
        }
    })
}

fn arg_string(args: &[Value<'_>], index: usize) -> rquickjs::Result<String> {
    match args.get(index) {
        None => Ok(String::new()),
        Some(value) if value.is_undefined() || value.is_null() => Ok(String::new()),
        Some(value) => Ok(value.get::<Coerced<String>>()?.0),
    }
}

fn all_arg_strings(args: &[Value<'_>]) -> rquickjs::Result<Vec<String>> {
    (0..args.len()).map(|index| arg_string(args, index)).collect()
}

fn define<'js, F, P>(ctx: &Ctx<'js>, name: &str, body: F) -> rquickjs::Result<()>
where
    F: IntoJsFunc<'js, P> + 'js,
{
    let function = Function::new(ctx.clone(), body)?.with_name(name)?;
    ctx.globals().set(name, function)
}

fn register_pac_functions<'js>(ctx: &Ctx<'js>, env: &HostEnv) -> rquickjs::Result<()> {
    // isPlainHostName(host)
    define(ctx, "isPlainHostName", |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        Ok(predicates::is_plain_host_name(&arg_string(&args.0, 0)?))
    })?;

    // dnsDomainIs(host, domain)
    define(ctx, "dnsDomainIs", |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        let host = arg_string(&args.0, 0)?;
        let domain = arg_string(&args.0, 1)?;
        Ok(predicates::dns_domain_is(&host, &domain))
    })?;

    // localHostOrDomainIs(host, hostdom)
    define(ctx, "localHostOrDomainIs", |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        let host = arg_string(&args.0, 0)?;
        let hostdom = arg_string(&args.0, 1)?;
        Ok(predicates::local_host_or_domain_is(&host, &hostdom))
    })?;

    // dnsDomainLevels(host)
    define(ctx, "dnsDomainLevels", |args: Rest<Value<'js>>| -> rquickjs::Result<u32> {
        let host = arg_string(&args.0, 0)?;
        Ok(predicates::dns_domain_levels(&host) as u32)
    })?;

    // shExpMatch(str, glob)
    define(ctx, "shExpMatch", |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        let text = arg_string(&args.0, 0)?;
        let pattern = arg_string(&args.0, 1)?;
        Ok(predicates::sh_exp_match(&text, &pattern))
    })?;

    // convert_addr(ip)
    define(ctx, "convert_addr", |args: Rest<Value<'js>>| -> rquickjs::Result<f64> {
        let ip = arg_string(&args.0, 0)?;
        Ok(predicates::convert_addr(&ip).map_or(f64::NAN, f64::from))
    })?;

    // isResolvable(host)
    let resolver = Arc::clone(&env.resolver);
    define(ctx, "isResolvable", move |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        let host = arg_string(&args.0, 0)?;
        Ok(predicates::is_resolvable(&host, resolver.as_ref()))
    })?;

    // dnsResolve(host)
    let resolver = Arc::clone(&env.resolver);
    define(
        ctx,
        "dnsResolve",
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let host = arg_string(&args.0, 0)?;
            match predicates::dns_resolve(&host, resolver.as_ref()) {
                Some(ip) => ip.into_js(&ctx),
                None => Ok(Value::new_null(ctx)),
            }
        },
    )?;

    // isInNet(host, pattern, mask)
    let resolver = Arc::clone(&env.resolver);
    define(ctx, "isInNet", move |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        let host = arg_string(&args.0, 0)?;
        let pattern = arg_string(&args.0, 1)?;
        let mask = arg_string(&args.0, 2)?;
        Ok(predicates::is_in_net(&host, &pattern, &mask, resolver.as_ref()))
    })?;

    // myIpAddress()
    let resolver = Arc::clone(&env.resolver);
    define(ctx, "myIpAddress", move || -> String {
        predicates::my_ip_address(resolver.as_ref())
    })?;

    // weekdayRange(wd1, [wd2], [gmt])
    let moment = env.moment;
    define(ctx, "weekdayRange", move |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        Ok(predicates::weekday_range(&all_arg_strings(&args.0)?, &moment))
    })?;

    // dateRange(...)
    define(ctx, "dateRange", move |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        Ok(predicates::date_range(&all_arg_strings(&args.0)?, &moment))
    })?;

    // timeRange(...)
    define(ctx, "timeRange", move |args: Rest<Value<'js>>| -> rquickjs::Result<bool> {
        Ok(predicates::time_range(&all_arg_strings(&args.0)?, &moment))
    })?;

    Ok(())
}
