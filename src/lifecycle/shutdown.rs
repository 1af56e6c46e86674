//! Shutdown coordination.
//!
//! # Responsibilities
//! - Broadcast process shutdown to long-running tasks (`Shutdown`)
//! - Carry a cancellable interruption flag into drain sweeps (`Interrupt`)
//! - Signal asynchronous stop completion back to the caller (`StopCompletion`)
//! - Resolve the channel shutdown timeout from configuration

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};

use crate::channel::DrainReport;

/// Drain timeout used when nothing (or nothing valid) is configured.
pub const DEFAULT_CHANNEL_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Environment variable overriding the configured drain timeout.
pub const CHANNEL_SHUTDOWN_TIMEOUT_ENV: &str = "CHANNEL_SHUTDOWN_TIMEOUT";

/// Coordinator for process shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Sticky interruption flag shared between a stop caller and its sweep.
///
/// Once raised it stays raised; observers never clear it.
#[derive(Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn interrupted(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so this only ends on `true`
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Context handed to `stop` by the hosting runtime.
#[derive(Debug, Clone, Default)]
pub struct StopContext {
    pub interrupt: Interrupt,
}

impl StopContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interrupt(interrupt: Interrupt) -> Self {
        Self { interrupt }
    }
}

/// Completion of an asynchronous stop.
///
/// Resolves to the drain report. A stop whose sweep was dropped without
/// reporting resolves to an empty report.
pub struct StopCompletion {
    rx: oneshot::Receiver<DrainReport>,
}

impl StopCompletion {
    pub fn channel() -> (oneshot::Sender<DrainReport>, StopCompletion) {
        let (tx, rx) = oneshot::channel();
        (tx, StopCompletion { rx })
    }

    /// A completion that is already done.
    pub fn ready(report: DrainReport) -> StopCompletion {
        let (tx, completion) = Self::channel();
        let _ = tx.send(report);
        completion
    }
}

impl Future for StopCompletion {
    type Output = DrainReport;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or_default())
    }
}

/// Resolve the drain timeout from a raw millisecond value.
///
/// Unparsable or zero values are logged and replaced with the default.
pub fn channel_shutdown_timeout(raw: Option<&str>) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_CHANNEL_SHUTDOWN_TIMEOUT;
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Duration::from_millis(ms),
        _ => {
            tracing::warn!(
                value = %raw,
                default_ms = DEFAULT_CHANNEL_SHUTDOWN_TIMEOUT.as_millis() as u64,
                "Invalid channel shutdown timeout, using default"
            );
            DEFAULT_CHANNEL_SHUTDOWN_TIMEOUT
        }
    }
}

/// Drain timeout from the environment, falling back to `configured`.
pub fn resolve_channel_shutdown_timeout(configured: Option<&str>) -> Duration {
    let env = std::env::var(CHANNEL_SHUTDOWN_TIMEOUT_ENV).ok();
    channel_shutdown_timeout(env.as_deref().or(configured))
}
