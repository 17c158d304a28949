//! TLS and plaintext HTTP on a single listening socket.
//!
//! Each accepted connection is classified by its first byte: a TLS
//! handshake record (22) starts a TLS 1.3 handshake when credentials are
//! configured; anything else is served as plaintext HTTP. Both paths end
//! at the same handler.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::ServerConfig;
pub use http::{multi_listen_and_serve, multi_serve, MultiplexingServer, ServerError};
pub use lifecycle::Shutdown;
pub use net::ConnectionInfo;
