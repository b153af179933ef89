//! Backend client for a remote code-evaluation session.
//!
//! This crate owns everything that speaks the backend's bencode wire
//! protocol: the codec, the framed TCP transport, the session manager, the
//! reply-frame aggregator, and (for embedded mode) the in-process backend
//! itself with its lifecycle supervisor. The MCP-facing surface lives in
//! the `banter-mcp` binary crate and drives this one.

pub mod aggregate;
pub mod bencode;
pub mod embedded;
pub mod error;
pub mod session;
pub mod transport;

pub use aggregate::{Outcome, run_operation};
pub use embedded::{BackendError, EmbeddedBackend};
pub use error::ClientError;
pub use session::{Session, SessionManager};
pub use transport::{TransportError, WireTransport};
