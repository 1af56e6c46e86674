//! Bind-address strategies and the socket-binding manager.
//!
//! # Responsibilities
//! - Resolve a listen address from an interface + port, a named socket
//!   binding, or a literal address
//! - Keep the named socket bindings defined by configuration
//! - Track which sockets are currently bound, for reporting

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("socket binding '{0}' is not defined")]
    UnknownSocketBinding(String),

    #[error("socket binding '{name}' requires a binding manager")]
    NoManager { name: String },
}

/// Where a stream server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingStrategy {
    /// A network interface address plus a port.
    Interface { address: IpAddr, port: u16 },
    /// A named binding defined in the [`SocketBindingManager`].
    SocketBinding { name: String },
    /// A pre-resolved address.
    Address(SocketAddr),
}

impl BindingStrategy {
    /// The address to bind, looking named bindings up in `manager`.
    pub fn resolve(&self, manager: Option<&SocketBindingManager>) -> Result<SocketAddr, BindingError> {
        match self {
            BindingStrategy::Interface { address, port } => Ok(SocketAddr::new(*address, *port)),
            BindingStrategy::Address(addr) => Ok(*addr),
            BindingStrategy::SocketBinding { name } => {
                let manager = manager.ok_or_else(|| BindingError::NoManager { name: name.clone() })?;
                manager
                    .lookup(name)
                    .ok_or_else(|| BindingError::UnknownSocketBinding(name.clone()))
            }
        }
    }

    /// Name under which the bound socket is reported.
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            BindingStrategy::SocketBinding { name } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for BindingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingStrategy::Interface { address, port } => write!(f, "interface {address} port {port}"),
            BindingStrategy::SocketBinding { name } => write!(f, "socket-binding {name}"),
            BindingStrategy::Address(addr) => write!(f, "{addr}"),
        }
    }
}

/// A socket that is currently listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundSocket {
    pub name: String,
    pub configured: SocketAddr,
    pub bound: SocketAddr,
}

/// Registry of named socket bindings and their live sockets.
#[derive(Debug, Default)]
pub struct SocketBindingManager {
    defined: DashMap<String, SocketAddr>,
    bound: DashMap<String, BoundSocket>,
}

impl SocketBindingManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn define(&self, name: impl Into<String>, addr: SocketAddr) {
        self.defined.insert(name.into(), addr);
    }

    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.defined.get(name).map(|e| *e.value())
    }

    /// Record a listening socket. `configured` is the address that was asked
    /// for, `bound` the one obtained (they differ for port 0).
    pub fn register_bound(&self, name: &str, configured: SocketAddr, bound: SocketAddr) {
        tracing::debug!(binding = %name, address = %bound, "Socket bound");
        self.bound.insert(
            name.to_string(),
            BoundSocket {
                name: name.to_string(),
                configured,
                bound,
            },
        );
    }

    pub fn unregister_bound(&self, name: &str) -> Option<BoundSocket> {
        self.bound.remove(name).map(|(_, s)| s)
    }

    pub fn bound_sockets(&self) -> Vec<BoundSocket> {
        let mut sockets: Vec<BoundSocket> = self.bound.iter().map(|e| e.value().clone()).collect();
        sockets.sort_by(|a, b| a.name.cmp(&b.name));
        sockets
    }
}
