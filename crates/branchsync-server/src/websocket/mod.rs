//! WebSocket connection management, heartbeat, fan-out, and the per-client session loop.

pub mod clients;
pub mod connection;
pub mod cycle;
pub mod heartbeat;
pub mod session;
