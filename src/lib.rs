//! Remoting endpoint: authenticated channel services over TCP.
//!
//! # Architecture Overview
//!
//! ```text
//!   peer ──TCP──▶ net::listener ─▶ net::handshake ─▶ net::server ─▶ net::endpoint
//!                 (bounded)        (STARTTLS, SASL)  (OPEN service)  (service registry)
//!                                        │                               │
//!                                        ▼                               ▼
//!                                  sasl::Negotiator              channel::ChannelOpenListener
//!                                  realm::SecurityRealm          (handles, graceful drain)
//!                                                                        │
//!                                                                        ▼
//!                                                                 service::EchoService
//!
//!   outbound::OutboundConnection ─▶ Endpoint::connect ─▶ ProviderRegistry ─▶ client handshake
//! ```

// Core subsystems
pub mod channel;
pub mod config;
pub mod net;
pub mod options;
pub mod outbound;
pub mod realm;
pub mod sasl;
pub mod service;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use channel::{Channel, ChannelHandle, ChannelOpenListener, HandleFactory};
pub use config::EndpointConfig;
pub use lifecycle::{RunningEndpoint, Shutdown};
pub use net::{Endpoint, StreamServer};
pub use outbound::{OutboundConnection, OutboundRegistry};
pub use sasl::Negotiator;
