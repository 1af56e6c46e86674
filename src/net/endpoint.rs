//! The endpoint: named service registry, channel dispatch and outbound
//! provider lookup.
//!
//! # Responsibilities
//! - Register channel services under unique names with their option maps
//! - Route authenticated `OPEN <service>` requests to the service listener
//! - Terminate all registrations when the endpoint closes
//! - Resolve outbound connection providers by URI scheme

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::channel::Channel;
use crate::net::protocol::FramedStream;
use crate::options::OptionMap;
use crate::outbound::provider::{ConnectRequest, ProviderRegistry};
use crate::outbound::{Connection, OutboundError};

/// Receives channel lifecycle events for one registered service.
pub trait OpenListener: Send + Sync {
    /// A peer opened a channel to this service. The stream belongs to the
    /// listener from here on.
    fn channel_opened(&self, channel: Channel, stream: FramedStream);

    /// The endpoint dropped the registration on its own.
    fn registration_terminated(&self);
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("endpoint '{0}' is closed")]
    Closed(String),

    #[error("no service named '{0}'")]
    UnknownService(String),
}

struct ServiceEntry {
    id: u64,
    listener: Weak<dyn OpenListener>,
}

pub struct Endpoint {
    me: Weak<Endpoint>,
    name: String,
    services: DashMap<String, ServiceEntry>,
    next_id: AtomicU64,
    providers: ProviderRegistry,
    closed: AtomicBool,
}

impl Endpoint {
    /// Endpoint with the default `remote` and `local` providers.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_providers(name, ProviderRegistry::with_defaults())
    }

    pub fn with_providers(name: impl Into<String>, providers: ProviderRegistry) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.into(),
            services: DashMap::new(),
            next_id: AtomicU64::new(1),
            providers,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn register_service(
        &self,
        service: &str,
        options: OptionMap,
        listener: Weak<dyn OpenListener>,
    ) -> Result<Registration, EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed(self.name.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.services.entry(service.to_string()) {
            Entry::Occupied(_) => return Err(EndpointError::DuplicateService(service.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ServiceEntry { id, listener });
            }
        }
        tracing::debug!(endpoint = %self.name, service = %service, options = ?options, "Service registered");
        Ok(Registration {
            endpoint: self.me.clone(),
            service: service.to_string(),
            id,
            closed: AtomicBool::new(false),
        })
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Listener for `service`, if it is registered and still alive.
    pub fn service_listener(&self, service: &str) -> Result<Arc<dyn OpenListener>, EndpointError> {
        let listener = self
            .services
            .get(service)
            .map(|e| e.listener.clone())
            .ok_or_else(|| EndpointError::UnknownService(service.to_string()))?;
        listener
            .upgrade()
            .ok_or_else(|| EndpointError::UnknownService(service.to_string()))
    }

    /// Hand an opened channel to its service.
    pub fn dispatch(&self, channel: Channel, stream: FramedStream) -> Result<(), EndpointError> {
        let listener = self.service_listener(channel.service())?;
        listener.channel_opened(channel, stream);
        Ok(())
    }

    /// Open an outbound connection through the provider for the URI scheme.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Connection, OutboundError> {
        if self.is_closed() {
            return Err(OutboundError::IllegalState(format!("endpoint '{}' is closed", self.name)));
        }
        let provider = self.providers.get(request.uri.scheme())?;
        provider.connect(request).await
    }

    /// Close the endpoint, terminating every registration.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners: Vec<(String, Weak<dyn OpenListener>)> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), e.listener.clone()))
            .collect();
        self.services.clear();

        tracing::info!(endpoint = %self.name, services = listeners.len(), "Endpoint closed");
        for (service, listener) in listeners {
            match listener.upgrade() {
                Some(listener) => listener.registration_terminated(),
                None => tracing::debug!(service = %service, "Listener already gone"),
            }
        }
    }

    fn deregister(&self, service: &str, id: u64) {
        if self.services.remove_if(service, |_, e| e.id == id).is_some() {
            tracing::debug!(endpoint = %self.name, service = %service, "Service deregistered");
        }
    }
}

/// A live service registration. Closing or dropping it deregisters the
/// service without notifying the listener.
pub struct Registration {
    endpoint: Weak<Endpoint>,
    service: String,
    id: u64,
    closed: AtomicBool,
}

impl Registration {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.deregister(&self.service, self.id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.close();
    }
}
