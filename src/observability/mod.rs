//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! net + http layers produce:
//!     → logging.rs (structured log events, one span per connection)
//!     → metrics.rs (connection counters, durations)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
