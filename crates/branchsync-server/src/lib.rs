//! # branchsync-server
//!
//! Axum HTTP + `WebSocket` gateway for branch-scoped module sync.
//!
//! - HTTP endpoints: health check, Prometheus metrics
//! - `WebSocket` gateway: connection management, heartbeat, slow-consumer eviction
//! - Frame dispatch for the branch protocol (`client:*`) and the pub/sub protocol
//! - Fan-out through broadcast cycles that serialize each frame once
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use server::SyncServer;
