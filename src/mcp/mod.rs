//! JSON-RPC 2.0 / MCP protocol engine.
//!
//! Both halves of the protocol live here: the client side that attaches to
//! remote servers, and a dispatcher that serves local resources and tools.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── client ─────────────────────────────┐
//! │                                                                 │
//! │   ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐    │
//! │   │ Pagination  │───▶│ Connection  │───▶│    Transport     │    │
//! │   │  (cursors)  │    │(retry/state)│    │ process│http│mem │    │
//! │   └─────────────┘    └─────────────┘    └──────────────────┘    │
//! │                             ▲                    ▲              │
//! │                     ConnectionRegistry   SecurityPolicy check   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │ wire (JSON-RPC lines / POST)
//! ┌──────────────────────────── server ─────────────────────────────┐
//! │   ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐    │
//! │   │ server-stdio│───▶│  McpServer  │───▶│ Resource / Tool  │    │
//! │   │  transport  │    │ (dispatch)  │    │   registries     │    │
//! │   └─────────────┘    └─────────────┘    └──────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod connection;
pub mod pagination;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod transport;
pub mod types;

pub use connection::{Connection, ConnectionRegistry, ConnectionState};
pub use pagination::{Page, Paginator};
pub use protocol::{ErrorCode, Message, RequestId, MCP_PROTOCOL_VERSION};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use server::{McpServer, ServerConfig, ServerStatus, Session};
pub use transport::{create_transport, Transport, TransportConfig, TransportKind};
