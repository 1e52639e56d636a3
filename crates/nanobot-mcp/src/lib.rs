//! Outbound MCP client for nanobot.
//!
//! This crate owns the client side of the upstream relationship: the duplex
//! message [`transport`], and the [`client`] that performs the initialize
//! handshake, correlates requests with responses, routes progress
//! notifications, and fans other upstream messages out to a handler.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{
    CallOptions, ClientState, DEFAULT_REQUEST_TIMEOUT, HANDSHAKE_TIMEOUT, McpClient,
    NotificationHandler,
};
pub use error::{McpError, Result};
pub use transport::{DEFAULT_HTTP_TIMEOUT, HttpTransportConfig, Transport};
