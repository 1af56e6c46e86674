//! The graceful drain sweep.
//!
//! Every handle is asked to shut down first, then awaited in turn against one
//! absolute deadline. Whatever happens while waiting, each handle is forced
//! afterwards. An interruption ends all waiting but not the forcing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;

use super::handle::ChannelHandle;
use crate::lifecycle::Interrupt;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub drained: usize,
    pub timed_out: usize,
    pub failed: usize,
    /// Handles forced without waiting because the sweep was interrupted.
    pub skipped: usize,
    pub interrupted: bool,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.drained + self.timed_out + self.failed + self.skipped
    }
}

/// Forces every handle from `next` onwards if the sweep is abandoned.
struct ForceRemaining<'a> {
    handles: &'a [Arc<dyn ChannelHandle>],
    next: usize,
}

impl Drop for ForceRemaining<'_> {
    fn drop(&mut self) {
        for handle in &self.handles[self.next..] {
            force(handle.as_ref());
        }
    }
}

fn force(handle: &dyn ChannelHandle) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| handle.shutdown_now())).is_err() {
        tracing::warn!(channel_id = %handle.channel_id(), "Forced shutdown panicked");
    }
}

/// Drain `handles` within `timeout` in total.
pub async fn drain_handles(handles: &[Arc<dyn ChannelHandle>], timeout: Duration, interrupt: &Interrupt) -> DrainReport {
    let mut report = DrainReport::default();
    let deadline = Instant::now() + timeout;

    for handle in handles {
        let requested = std::panic::catch_unwind(AssertUnwindSafe(|| handle.shutdown()));
        if requested.is_err() {
            tracing::warn!(channel_id = %handle.channel_id(), "Graceful shutdown request panicked");
        }
    }

    let mut guard = ForceRemaining { handles, next: 0 };

    for (i, handle) in handles.iter().enumerate() {
        let channel_id = handle.channel_id();

        if report.interrupted {
            report.skipped += 1;
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = AssertUnwindSafe(handle.await_completion(remaining)).catch_unwind();

            tokio::select! {
                biased;
                _ = interrupt.interrupted() => {
                    tracing::warn!(channel_id = %channel_id, "Drain interrupted, forcing remaining channels");
                    report.interrupted = true;
                    report.failed += 1;
                }
                outcome = tokio::time::timeout_at(deadline, wait) => match outcome {
                    Ok(Ok(Ok(true))) => report.drained += 1,
                    Ok(Ok(Ok(false))) | Err(_) => {
                        tracing::warn!(channel_id = %channel_id, timeout_ms = timeout.as_millis() as u64, "Channel did not drain before deadline");
                        metrics::counter!("remoting_drain_timeouts_total").increment(1);
                        report.timed_out += 1;
                    }
                    Ok(Ok(Err(e))) => {
                        tracing::warn!(channel_id = %channel_id, error = %e, "Channel drain failed");
                        report.failed += 1;
                    }
                    Ok(Err(_)) => {
                        tracing::warn!(channel_id = %channel_id, "Channel drain panicked");
                        report.failed += 1;
                    }
                },
            }
        }

        force(handle.as_ref());
        guard.next = i + 1;
    }

    if report.interrupted {
        interrupt.interrupt();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{test_channel, ChannelId, HandleError, TrackedHandle};
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Never drains on its own.
    struct Stuck {
        id: ChannelId,
        forced: AtomicUsize,
    }

    impl Stuck {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ChannelId::new(),
                forced: AtomicUsize::new(0),
            })
        }
    }

    impl ChannelHandle for Stuck {
        fn channel_id(&self) -> ChannelId {
            self.id
        }

        fn shutdown(&self) {}

        fn shutdown_now(&self) {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }

        fn await_completion(&self, timeout: Duration) -> BoxFuture<'_, Result<bool, HandleError>> {
            Box::pin(async move {
                tokio::time::sleep(timeout).await;
                Ok(false)
            })
        }
    }

    struct Broken(ChannelId);

    impl ChannelHandle for Broken {
        fn channel_id(&self) -> ChannelId {
            self.0
        }

        fn shutdown(&self) {}

        fn shutdown_now(&self) {}

        fn await_completion(&self, _timeout: Duration) -> BoxFuture<'_, Result<bool, HandleError>> {
            Box::pin(explode())
        }
    }

    async fn explode() -> Result<bool, HandleError> {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn deadline_is_shared_across_handles() {
        let stuck: Vec<Arc<Stuck>> = (0..50).map(|_| Stuck::new()).collect();
        let handles: Vec<Arc<dyn ChannelHandle>> = stuck.iter().map(|s| s.clone() as Arc<dyn ChannelHandle>).collect();

        let started = std::time::Instant::now();
        let report = drain_handles(&handles, Duration::from_millis(100), &Interrupt::new()).await;

        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(report.timed_out, 50);
        assert!(stuck.iter().all(|s| s.forced.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn cooperative_handles_drain() {
        let tracked: Vec<Arc<TrackedHandle>> = (0..3).map(|_| Arc::new(TrackedHandle::new(test_channel("echo")))).collect();
        let handles: Vec<Arc<dyn ChannelHandle>> =
            tracked.iter().map(|h| h.clone() as Arc<dyn ChannelHandle>).collect();

        let report = drain_handles(&handles, Duration::from_secs(1), &Interrupt::new()).await;
        assert_eq!(report.drained, 3);
        assert!(tracked.iter().all(|h| h.channel().is_closed()));
    }

    #[tokio::test]
    async fn panicking_handle_does_not_abort_sweep() {
        let stuck = Stuck::new();
        let handles: Vec<Arc<dyn ChannelHandle>> = vec![Arc::new(Broken(ChannelId::new())), stuck.clone()];
        let report = drain_handles(&handles, Duration::from_millis(50), &Interrupt::new()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.timed_out, 1);
        assert_eq!(stuck.forced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interruption_stops_waiting_but_forces_all() {
        let stuck: Vec<Arc<Stuck>> = (0..5).map(|_| Stuck::new()).collect();
        let handles: Vec<Arc<dyn ChannelHandle>> = stuck.iter().map(|s| s.clone() as Arc<dyn ChannelHandle>).collect();
        let interrupt = Interrupt::new();

        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.interrupt();
        });

        let started = std::time::Instant::now();
        let report = drain_handles(&handles, Duration::from_secs(10), &interrupt).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.interrupted);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 4);
        assert!(interrupt.is_interrupted());
        assert!(stuck.iter().all(|s| s.forced.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn dropped_sweep_still_forces() {
        let stuck: Vec<Arc<Stuck>> = (0..3).map(|_| Stuck::new()).collect();
        let handles: Vec<Arc<dyn ChannelHandle>> = stuck.iter().map(|s| s.clone() as Arc<dyn ChannelHandle>).collect();

        let interrupt = Interrupt::new();
        let sweep = drain_handles(&handles, Duration::from_secs(10), &interrupt);
        let _ = tokio::time::timeout(Duration::from_millis(20), sweep).await;
        assert!(stuck.iter().all(|s| s.forced.load(Ordering::SeqCst) == 1));
    }
}
