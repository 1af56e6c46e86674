//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → realms → negotiators → endpoint + services
//!     → outbound registry → stream servers (traffic last)
//!
//! Shutdown (shutdown.rs + startup.rs RunningEndpoint::shutdown):
//!     Signal received → stop accepting → drain channels → close endpoint
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown; a second one interrupts the drain
//!     SIGHUP → reload outbound connections
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Channel drains share one deadline per service

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{
    channel_shutdown_timeout, resolve_channel_shutdown_timeout, Interrupt, Shutdown, StopCompletion, StopContext,
    CHANNEL_SHUTDOWN_TIMEOUT_ENV, DEFAULT_CHANNEL_SHUTDOWN_TIMEOUT,
};
pub use signals::{SignalEvent, Signals};
pub use startup::{RunningEndpoint, StartupError};
