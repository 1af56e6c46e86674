//! Channel lifecycle management.
//!
//! # Data Flow
//! ```text
//! Endpoint dispatch (OPEN <service> accepted)
//!     → listener.rs ChannelOpenListener::channel_opened
//!         closed?  → CLOSED frame, no handle
//!         else     → HandleFactory::create_handle → registry.rs HandleSet
//!     → channel close → handle removed + shutdown_now
//!
//! ChannelOpenListener::stop
//!     → seal + snapshot the HandleSet
//!     → drain.rs sweep (shared deadline, interruptible)
//!     → StopCompletion resolves with a DrainReport
//! ```
//!
//! # Design Decisions
//! - The handle set only hands out snapshots; nothing iterates it under
//!   concurrent mutation
//! - Force shutdown is idempotent so close callbacks and the drain sweep can
//!   both call it
//! - The drain deadline is absolute and shared by every handle in one stop

pub mod drain;
pub mod handle;
pub mod listener;
pub mod registry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use crate::sasl::AuthenticatedIdentity;

pub use drain::{drain_handles, DrainReport};
pub use handle::{ChannelHandle, HandleError, RequestGuard, TrackedHandle};
pub use listener::{ChannelOpenListener, HandleFactory, ListenerError, ListenerPhase};
pub use registry::HandleSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0.simple())
    }
}

type CloseHandler = Box<dyn FnOnce(&Channel) + Send>;

/// An authenticated logical connection bound to one service.
///
/// Cheap to clone; all clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    service: String,
    identity: AuthenticatedIdentity,
    peer: Option<SocketAddr>,
    closed: watch::Sender<bool>,
    // None once the close handlers have run
    close_handlers: Mutex<Option<Vec<CloseHandler>>>,
}

impl Channel {
    pub fn new(service: impl Into<String>, identity: AuthenticatedIdentity, peer: Option<SocketAddr>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                id: ChannelId::new(),
                service: service.into(),
                identity,
                peer,
                closed,
                close_handlers: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn identity(&self) -> &AuthenticatedIdentity {
        &self.inner.identity
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Run `handler` once when the channel closes.
    ///
    /// Runs immediately on the calling task if the channel is already closed.
    pub fn add_close_handler(&self, handler: impl FnOnce(&Channel) + Send + 'static) {
        let mut handlers = self
            .inner
            .close_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match handlers.as_mut() {
            Some(pending) => pending.push(Box::new(handler)),
            None => {
                drop(handlers);
                handler(self);
            }
        }
    }

    /// Close the channel. Only the first call has any effect.
    pub fn close(&self) {
        let handlers = self
            .inner
            .close_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handlers) = handlers else {
            return;
        };
        self.inner.closed.send_replace(true);
        tracing::debug!(channel_id = %self.id(), service = %self.service(), "Channel closed");
        for handler in handlers {
            handler(self);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service)
            .field("identity", &self.inner.identity.authorization_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_channel(service: &str) -> Channel {
    use crate::sasl::{Mechanism, ANONYMOUS_IDENTITY};
    Channel::new(
        service,
        AuthenticatedIdentity {
            mechanism: Mechanism::Anonymous,
            authentication_id: ANONYMOUS_IDENTITY.into(),
            authorization_id: ANONYMOUS_IDENTITY.into(),
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn close_runs_handlers_once() {
        let channel = test_channel("echo");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        channel.add_close_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        channel.close();
        channel.close();
        channel.closed().await;
        assert!(channel.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_handler_runs_immediately() {
        let channel = test_channel("echo");
        channel.close();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        channel.add_close_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_close_again() {
        let channel = test_channel("echo");
        channel.add_close_handler(|ch| ch.close());
        channel.close();
        assert!(channel.is_closed());
    }
}
