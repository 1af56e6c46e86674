//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout via the fmt layer
//!     → Prometheus scrape endpoint, when enabled
//! ```
//!
//! # Design Decisions
//! - Log level comes from RUST_LOG when set, otherwise from configuration
//! - Metrics are cheap (atomic increments) and recorded unconditionally;
//!   without an installed exporter they are no-ops

pub mod logging;
pub mod metrics;
