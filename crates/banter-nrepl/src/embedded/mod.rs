//! Embedded-mode backend: supervisor, in-process listener, and engine.
//!
//! In embedded mode the bridge launches and owns the evaluation backend
//! itself instead of connecting to an externally managed server. The
//! supervisor can tear down and relaunch the listener to recover from a
//! wedged evaluation while the environment keeps its accumulated state.

mod engine;
mod listener;
mod supervisor;

pub use self::engine::{Environment, EvalFault};
pub use self::supervisor::{BackendError, EmbeddedBackend};
