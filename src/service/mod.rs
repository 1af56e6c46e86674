//! Built-in channel services.

pub mod echo;

use std::sync::Arc;

use crate::channel::HandleFactory;

pub use echo::EchoService;

/// Factory for a service named in configuration.
pub fn factory_for(name: &str) -> Option<Arc<dyn HandleFactory>> {
    match name {
        echo::SERVICE_NAME => Some(Arc::new(EchoService::new())),
        _ => None,
    }
}
