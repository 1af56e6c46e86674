//! Per-channel shutdown handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;

use super::{Channel, ChannelId};

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("handle for {channel_id} failed: {reason}")]
    Failed { channel_id: ChannelId, reason: String },

    #[error("wait on {0} was interrupted")]
    Interrupted(ChannelId),
}

/// Cooperative and forced termination of one channel.
pub trait ChannelHandle: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    /// Stop taking new work; in-flight work may finish.
    fn shutdown(&self);

    /// Release everything now. Must be safe to call more than once.
    fn shutdown_now(&self);

    /// Wait up to `timeout` for in-flight work to finish.
    ///
    /// `Ok(true)` when drained, `Ok(false)` on timeout.
    fn await_completion(&self, timeout: Duration) -> BoxFuture<'_, Result<bool, HandleError>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DrainState {
    draining: bool,
    in_flight: usize,
}

impl DrainState {
    fn is_idle_draining(&self) -> bool {
        self.draining && self.in_flight == 0
    }
}

/// Handle that counts in-flight requests on a channel.
///
/// Services call [`TrackedHandle::begin`] around each request; the handle is
/// drained once it is shutting down and no request is outstanding.
pub struct TrackedHandle {
    channel: Channel,
    state: watch::Sender<DrainState>,
    forced: AtomicBool,
}

impl TrackedHandle {
    pub fn new(channel: Channel) -> Self {
        let (state, _) = watch::channel(DrainState::default());
        Self {
            channel,
            state,
            forced: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Start a request. `None` once the handle is shutting down.
    pub fn begin(&self) -> Option<RequestGuard<'_>> {
        let mut admitted = false;
        self.state.send_if_modified(|s| {
            if s.draining {
                return false;
            }
            s.in_flight += 1;
            admitted = true;
            true
        });
        admitted.then_some(RequestGuard { handle: self })
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }

    pub fn is_draining(&self) -> bool {
        self.state.borrow().draining
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// Resolves once the handle is draining with nothing in flight, or the
    /// channel closed.
    pub async fn drained(&self) {
        let mut rx = self.state.subscribe();
        tokio::select! {
            _ = rx.wait_for(DrainState::is_idle_draining) => {}
            _ = self.channel.closed() => {}
        }
    }

    fn finish_request(&self) {
        self.state.send_modify(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}

impl ChannelHandle for TrackedHandle {
    fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    fn shutdown(&self) {
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.draining, true));
    }

    fn shutdown_now(&self) {
        if self.forced.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.send_modify(|s| s.draining = true);
        if !self.channel.is_closed() {
            metrics::counter!("remoting_handles_forced_total").increment(1);
            tracing::debug!(channel_id = %self.channel.id(), in_flight = self.in_flight(), "Forcing channel shutdown");
        }
        self.channel.close();
    }

    fn await_completion(&self, timeout: Duration) -> BoxFuture<'_, Result<bool, HandleError>> {
        Box::pin(async move { Ok(tokio::time::timeout(timeout, self.drained()).await.is_ok()) })
    }
}

/// Marks one in-flight request; dropping it finishes the request.
pub struct RequestGuard<'a> {
    handle: &'a TrackedHandle,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.handle.finish_request();
    }
}
