//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Classified TCP/TLS connection (net layer)
//!     → server.rs (handshake, HTTP/1.1 or HTTP/2 via ALPN / auto-detection)
//!     → ConnectionInfo inserted into request extensions
//!     → external handler (any tower Service, e.g. axum::Router)
//!     → response written back on the same connection
//! ```

pub mod server;

pub use server::{multi_listen_and_serve, multi_serve, MultiplexingServer, ServerError};
