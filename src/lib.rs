//! mcp-gateway: an observability and control plane for Model Context Protocol traffic.
//!
//! The gateway sits between MCP clients and any number of registered MCP
//! servers (HTTP Streamable or stdio subprocess), forwarding every request
//! and response while durably capturing the full exchange for inspection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   JSON-RPC   ┌────────────────────────────┐   JSON-RPC   ┌──────────────┐
//! │ MCP      │ ───────────▶ │ ProxyRouter                │ ───────────▶ │ HTTP or      │
//! │ client   │ ◀─────────── │  • RequestTracker          │ ◀─────────── │ stdio MCP    │
//! └──────────┘              │  • SessionInfoCache        │              │ server       │
//!                           │  • CapturePipeline         │              └──────────────┘
//!                           └────────────┬───────────────┘
//!                                        ▼
//!                           ┌────────────────────────────┐
//!                           │ StorageManager             │
//!                           │  • in-memory / sqlite       │
//!                           └────────────────────────────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod http_upstream;
pub mod management;
pub mod oauth;
pub mod proxy;
pub mod router;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod storage;
pub mod telemetry;

pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;

/// Version of mcp-gateway.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// MCP protocol version this gateway speaks on the wire.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
