//! `WebSocket` connection management, heartbeat and session lifecycle.

pub mod connection;
pub mod heartbeat;
pub mod session;
