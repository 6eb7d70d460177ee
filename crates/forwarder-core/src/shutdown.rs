//! Shutdown orchestration.
//!
//! Every fatal condition (pipeline error, background task failure, panic,
//! termination signal) ends up in [`Shutdown::trigger`]. The first trigger
//! wins and decides the exit code; later ones are ignored. [`Shutdown::drain`]
//! then tears resources down in a fixed order:
//!
//!   1. health flag → not ready
//!   2. source subscription
//!   3. source connection
//!   4. sink connection
//!   5. health endpoint listener
//!
//! Each step is bounded by a timeout and its failure is logged, never fatal.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ForwardError;
use crate::health::HealthState;
use crate::transport::{HealthEndpoint, Sink, Source};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATED: u8 = 2;

/// Termination signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Quit,
    Terminate,
}

impl Signal {
    pub fn number(self) -> i32 {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Terminate => libc::SIGTERM,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

/// Why the process is exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Fatal { cause: Option<String> },
    Signal(Signal),
}

impl ExitReason {
    pub fn fatal(cause: impl fmt::Display) -> Self {
        ExitReason::Fatal {
            cause: Some(cause.to_string()),
        }
    }

    /// 1 for fatal errors, 128 + signal number for signals.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Fatal { .. } => 1,
            ExitReason::Signal(signal) => 128 + signal.number(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Fatal { cause: Some(cause) } => write!(f, "fatal: {cause}"),
            ExitReason::Fatal { cause: None } => write!(f, "fatal"),
            ExitReason::Signal(signal) => write!(f, "{}", signal.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Draining,
    Terminated,
}

/// Resources torn down by [`Shutdown::drain`]. Any subset may be absent.
pub struct Resources<S, P, H> {
    pub source: Option<S>,
    pub sink: Option<P>,
    pub endpoint: Option<H>,
}

impl<S, P, H> Default for Resources<S, P, H> {
    fn default() -> Self {
        Self {
            source: None,
            sink: None,
            endpoint: None,
        }
    }
}

struct Inner {
    state: AtomicU8,
    reason: watch::Sender<Option<ExitReason>>,
    step_timeout: Duration,
}

/// Process-wide shutdown coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::with_step_timeout(DEFAULT_STEP_TIMEOUT)
    }

    pub fn with_step_timeout(step_timeout: Duration) -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(RUNNING),
                reason,
                step_timeout,
            }),
        }
    }

    /// Request shutdown. Returns false if shutdown was already requested.
    pub fn trigger(&self, reason: ExitReason) -> bool {
        let logged = reason.clone();
        let accepted = self.inner.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });

        if !accepted {
            tracing::debug!(reason = %logged, "shutdown already requested, ignoring");
            return false;
        }
        match &logged {
            ExitReason::Fatal { cause: Some(cause) } => {
                tracing::error!(cause = %cause, "fatal error, shutting down")
            }
            ExitReason::Fatal { cause: None } => tracing::error!("fatal error, shutting down"),
            ExitReason::Signal(signal) => {
                tracing::warn!(signal = signal.name(), "termination signal received")
            }
        }
        true
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&self) -> ExitReason {
        let mut rx = self.inner.reason.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(ExitReason::Fatal { cause: None })
    }

    pub fn reason(&self) -> Option<ExitReason> {
        self.inner.reason.borrow().clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.inner.state.load(Ordering::Acquire) {
            RUNNING => Lifecycle::Running,
            DRAINING => Lifecycle::Draining,
            _ => Lifecycle::Terminated,
        }
    }

    /// Tear everything down and return the exit code.
    ///
    /// Runs at most once per coordinator; every later call returns `None`
    /// without touching anything. If nothing triggered shutdown beforehand,
    /// the exit is treated as fatal.
    pub async fn drain<S, P, H>(
        &self,
        health: &HealthState,
        resources: &mut Resources<S, P, H>,
    ) -> Option<i32>
    where
        S: Source,
        P: Sink,
        H: HealthEndpoint,
    {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("teardown already running, ignoring");
            return None;
        }

        if self.reason().is_none() {
            self.trigger(ExitReason::Fatal { cause: None });
        }
        let reason = self.reason().unwrap_or(ExitReason::Fatal { cause: None });
        tracing::info!(%reason, "start exiting gracefully");

        tracing::info!("set health checks to fail");
        health.set_ready(false);

        if let Some(source) = resources.source.as_mut() {
            self.step("close source subscription", source.close_subscription())
                .await;
        }
        if let Some(mut source) = resources.source.take() {
            self.step("close source connection", source.close_connection())
                .await;
        }
        if let Some(mut sink) = resources.sink.take() {
            self.step("disconnect sink", sink.disconnect()).await;
        }
        if let Some(mut endpoint) = resources.endpoint.take() {
            self.step("close health check server", endpoint.close())
                .await;
        }

        self.inner.state.store(TERMINATED, Ordering::Release);
        let code = reason.exit_code();
        tracing::info!(code, "exit process");
        Some(code)
    }

    async fn step(
        &self,
        name: &'static str,
        action: impl Future<Output = Result<(), ForwardError>>,
    ) {
        tracing::info!(step = name, "teardown");
        match tokio::time::timeout(self.inner.step_timeout, action).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(step = name, error = %e, "teardown step failed"),
            Err(_) => tracing::error!(
                step = name,
                timeout_ms = self.inner.step_timeout.as_millis() as u64,
                "teardown step timed out"
            ),
        }
    }

    /// Route panics anywhere in the process into a fatal shutdown.
    pub fn install_panic_hook(&self) {
        let shutdown = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            shutdown.trigger(ExitReason::fatal(format!("panic: {info}")));
        }));
    }
}

/// Register handlers for SIGINT, SIGQUIT and SIGTERM and return the loop
/// that turns them into shutdown triggers. Handlers are active as soon as
/// this returns, before the loop is first polled.
#[cfg(unix)]
pub fn listen_for_signals(shutdown: Shutdown) -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        loop {
            let received = tokio::select! {
                _ = interrupt.recv() => Signal::Interrupt,
                _ = quit.recv()      => Signal::Quit,
                _ = terminate.recv() => Signal::Terminate,
            };
            shutdown.trigger(ExitReason::Signal(received));
        }
    })
}
