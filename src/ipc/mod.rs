//! IPC module for daemon-host communication
//!
//! The host application owns the actual recognizer, completion endpoint
//! and audio output. It talks to the daemon over a Unix socket, feeding
//! frames and transcripts in and fulfilling collaborator requests that
//! the daemon pushes out as notifications.

mod bridge;
mod protocol;
mod server;

pub use bridge::HostBridge;
pub use protocol::{DaemonStatus, Notification, Outbound, Request, Response};
pub use server::Server;
