//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EndpointConfig (validated, immutable)
//!     → lifecycle::startup builds realms, connectors and outbound connections
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads and validates the new config
//!     → unchanged files are dropped (EndpointConfig::changed_sections)
//!     → outbound::OutboundRegistry::reload swaps changed descriptors
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Only outbound connections are reloaded live; connectors and realms
//!   need a restart
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ConnectorConfig, EndpointConfig, ObservabilityConfig, OutboundConnectionConfig, OutboundKind, RealmConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::{ConfigWatcher, Reloader};
