//! Tool-calling bridge exposing a live evaluation backend.
//!
//! The binary speaks JSON-RPC 2.0 over newline-delimited stdio on one
//! side and the backend's bencode wire protocol over TCP on the other.
//! [`server::McpServer`] owns the request loop, [`tools::Bridge`] owns
//! the backend session, and [`config::Cli`] decides where the backend
//! lives.

pub mod config;
pub mod prompts;
pub mod protocol;
pub mod resources;
pub mod server;
pub mod telemetry;
pub mod tools;
