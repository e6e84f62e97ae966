//! mcp-link: a JSON-RPC engine for the Model Context Protocol.
//!
//! The crate attaches to MCP servers as a client and can also serve
//! resources and tools of its own.
//!
//! # Client side
//!
//! - **Transports**: a spawned child process over its stdin/stdout, HTTP
//!   (one `POST` per message), and an in-memory pair of queues for tests
//! - **Connections**: initialise handshake, retry with exponential backoff,
//!   reconnect after transport failures, health tracking
//! - **Pagination**: cursor-driven iteration over list endpoints
//!
//! # Server side
//!
//! - **Dispatcher**: routes requests to resource providers and tool handlers
//!   and always answers with a well-formed reply
//! - **Stdio serving** with graceful shutdown on SIGINT/SIGTERM
//!
//! Every child process and HTTP endpoint is checked against a
//! [`security::SecurityPolicy`] before anything is spawned or contacted.
//!
//! # Modules
//!
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`mcp`] — Protocol engine
//! - [`security`] — Allow-lists and argument checks

pub mod config;
pub mod error;
pub mod mcp;
pub mod security;
