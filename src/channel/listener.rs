//! Channel open listener with graceful shutdown.
//!
//! # Responsibilities
//! - Register a named service with the endpoint
//! - Admit or reject channel opens depending on the `closed` flag
//! - Track one handle per admitted channel until it closes
//! - Drain all handles on stop, asynchronously, within one deadline
//!
//! # State Machine
//! ```text
//! Stopped --start()--> Listening --stop()--> Draining --sweep done--> Stopped
//! Listening --registration terminated (handles forced)--> Stopped
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

use super::drain::drain_handles;
use super::handle::ChannelHandle;
use super::registry::HandleSet;
use super::Channel;
use crate::lifecycle::{StopCompletion, StopContext};
use crate::net::endpoint::{Endpoint, EndpointError, OpenListener, Registration};
use crate::net::protocol::{Frame, FramedStream};
use crate::options::OptionMap;

/// Per-service hooks plugged into a [`ChannelOpenListener`].
pub trait HandleFactory: Send + Sync {
    /// Take ownership of an admitted channel's stream and return its handle.
    fn create_handle(&self, channel: &Channel, stream: FramedStream) -> Arc<dyn ChannelHandle>;

    /// Run listener background work (drain sweeps, rejections).
    fn execute_async(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    Stopped,
    Listening,
    Draining,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener for '{service}' cannot start while {phase:?}")]
    NotStopped { service: String, phase: ListenerPhase },

    #[error(transparent)]
    Registration(#[from] EndpointError),
}

struct Lifecycle {
    phase: ListenerPhase,
    registration: Option<Registration>,
}

pub struct ChannelOpenListener {
    me: Weak<ChannelOpenListener>,
    service: String,
    options: OptionMap,
    factory: Arc<dyn HandleFactory>,
    handles: HandleSet,
    // read lock-free on every open; written only under `lifecycle`
    closed: AtomicBool,
    shutdown_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    created: AtomicU64,
    rejected: AtomicU64,
}

impl ChannelOpenListener {
    pub fn new(
        service: impl Into<String>,
        options: OptionMap,
        factory: Arc<dyn HandleFactory>,
        shutdown_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            service: service.into(),
            options,
            factory,
            handles: HandleSet::new(),
            closed: AtomicBool::new(true),
            shutdown_timeout,
            lifecycle: Mutex::new(Lifecycle {
                phase: ListenerPhase::Stopped,
                registration: None,
            }),
            created: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn phase(&self) -> ListenerPhase {
        self.lifecycle().phase
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    /// Handles created since construction.
    pub fn handles_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Opens refused since construction.
    pub fn opens_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Register with `endpoint` and start admitting channels.
    pub fn start(&self, endpoint: &Arc<Endpoint>) -> Result<(), ListenerError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.phase != ListenerPhase::Stopped {
            return Err(ListenerError::NotStopped {
                service: self.service.clone(),
                phase: lifecycle.phase,
            });
        }
        let me: Weak<dyn OpenListener> = self.me.clone();
        let registration = endpoint.register_service(&self.service, self.options.clone(), me)?;

        self.handles.unseal();
        lifecycle.registration = Some(registration);
        lifecycle.phase = ListenerPhase::Listening;
        self.closed.store(false, Ordering::Release);

        tracing::info!(service = %self.service, endpoint = %endpoint.name(), "Channel service listening");
        Ok(())
    }

    /// Stop admitting channels and drain the live ones.
    ///
    /// Returns immediately; the sweep runs through
    /// [`HandleFactory::execute_async`] and the returned completion resolves
    /// with its report.
    pub fn stop(&self, context: StopContext) -> StopCompletion {
        let snapshot = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.phase != ListenerPhase::Listening {
                return StopCompletion::ready(Default::default());
            }
            self.closed.store(true, Ordering::Release);
            lifecycle.phase = ListenerPhase::Draining;
            if let Some(registration) = lifecycle.registration.take() {
                registration.close();
            }
            self.handles.seal_and_snapshot()
        };

        tracing::info!(
            service = %self.service,
            channels = snapshot.len(),
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Draining channel service"
        );

        let (done, completion) = StopCompletion::channel();
        let Some(this) = self.me.upgrade() else {
            return StopCompletion::ready(Default::default());
        };
        self.factory.execute_async(Box::pin(async move {
            let report = drain_handles(&snapshot, this.shutdown_timeout, &context.interrupt).await;
            for handle in &snapshot {
                this.handles.remove(handle.channel_id());
            }
            this.lifecycle().phase = ListenerPhase::Stopped;

            tracing::info!(
                service = %this.service,
                drained = report.drained,
                timed_out = report.timed_out,
                failed = report.failed,
                skipped = report.skipped,
                "Channel service stopped"
            );
            let _ = done.send(report);
        }));
        completion
    }

    fn reject(&self, channel: Channel, mut stream: FramedStream) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("remoting_channels_rejected_total").increment(1);
        tracing::debug!(service = %self.service, channel_id = %channel.id(), "Rejecting channel, service is closed");

        self.factory.execute_async(Box::pin(async move {
            let _ = stream.write_frame(&Frame::Closed("service is shutting down".into())).await;
            let _ = stream.shutdown().await;
            channel.close();
        }));
    }
}

impl OpenListener for ChannelOpenListener {
    fn channel_opened(&self, channel: Channel, stream: FramedStream) {
        if self.closed.load(Ordering::Acquire) {
            self.reject(channel, stream);
            return;
        }

        let handle = self.factory.create_handle(&channel, stream);
        self.created.fetch_add(1, Ordering::Relaxed);
        if !self.handles.insert(Arc::clone(&handle)) {
            // lost a race with stop(): the snapshot is already taken
            self.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("remoting_channels_rejected_total").increment(1);
            handle.shutdown_now();
            channel.close();
            return;
        }
        metrics::counter!("remoting_channels_opened_total").increment(1);
        metrics::gauge!("remoting_channels_active").increment(1.0);
        tracing::debug!(
            service = %self.service,
            channel_id = %channel.id(),
            identity = %channel.identity().authorization_id,
            "Channel opened"
        );

        let listener = self.me.clone();
        let id = channel.id();
        channel.add_close_handler(move |_| {
            metrics::gauge!("remoting_channels_active").decrement(1.0);
            if let Some(listener) = listener.upgrade() {
                if let Some(handle) = listener.handles.remove(id) {
                    handle.shutdown_now();
                }
            }
        });
    }

    fn registration_terminated(&self) {
        let handles = {
            let mut lifecycle = self.lifecycle();
            self.closed.store(true, Ordering::Release);
            // a running drain finishes the transition itself
            if lifecycle.phase == ListenerPhase::Listening {
                lifecycle.phase = ListenerPhase::Stopped;
            }
            lifecycle.registration = None;
            self.handles.seal_and_drain()
        };
        tracing::warn!(service = %self.service, channels = handles.len(), "Service registration terminated");
        for handle in handles {
            handle.shutdown_now();
        }
    }
}
