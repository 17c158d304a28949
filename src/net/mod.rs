//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, read one byte, classify)
//!     → peek.rs (replay the classification byte)
//!     → tls.rs (lazy TLS negotiator when the byte opens a handshake)
//!     → connection.rs (handshake completed, connection info)
//!     → deadline.rs (idle / write stall timeouts)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - One listening socket serves TLS and plaintext
//! - Classification never consumes bytes the HTTP engine needs
//! - TLS is optional: no credentials means plaintext only

pub mod connection;
pub mod deadline;
pub mod listener;
pub mod peek;
pub mod tls;

pub use connection::{ConnectionId, ConnectionInfo, SecuredStream};
pub use listener::{classify, AcceptError, Accepted, ClassifiedStream, SniffingListener};
pub use peek::PeekedStream;
pub use tls::{NegotiatedProtocol, TlsError, TLS_HANDSHAKE_RECORD};
