//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! BindingStrategy (binding.rs) → SocketAddr
//!     → listener.rs (accept loop, connection limits)
//!     → handshake.rs (HELLO, STARTTLS via tls.rs, SASL exchange)
//!     → server.rs reads OPEN <service>
//!     → endpoint.rs routes the channel to the service's OpenListener
//!
//! Connection States (connection.rs):
//!     Handshaking → Authenticated → Open → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Every handshake runs under a timeout
//! - Framing is a minimal line protocol (protocol.rs); TLS is delegated to rustls

pub mod binding;
pub mod connection;
pub mod endpoint;
pub mod handshake;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod tls;

pub use binding::{BindingStrategy, SocketBindingManager};
pub use endpoint::{Endpoint, OpenListener, Registration};
pub use protocol::{Frame, FramedStream};
pub use server::{StreamServer, StreamServerConfig};
