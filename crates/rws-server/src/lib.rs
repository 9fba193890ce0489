//! # rws-server
//!
//! Axum HTTP + `WebSocket` transport for the remote scripting core.
//!
//! - `WebSocket` gateway: one `rws_core::Session` per connection, fed through
//!   a bounded outbound queue with heartbeat liveness checks
//! - HTTP endpoints: health check, Prometheus metrics, registered object
//!   listing and generated client scripts
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::RwsServer;
