//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → server stops accepting → connections drain → serve returns
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown future resolves
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
