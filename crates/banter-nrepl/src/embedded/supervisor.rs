//! Lifecycle supervision for the embedded backend.
//!
//! The supervisor owns two independently lifecycled resources: the network
//! listener (plus any thread wedged evaluating on one of its connections)
//! and the evaluation environment. `restart` tears down only the former,
//! recovering from a stuck or infinite evaluation without losing defined
//! vars or namespaces.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use super::engine::Environment;
use super::listener::{ListenerControl, spawn_listener};

/// Log target for supervisor operations.
const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::embedded");

/// Errors raised by backend lifecycle operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Binding the loopback listener failed; fatal to startup.
    #[error("failed to bind embedded backend listener: {0}")]
    Bind(#[from] io::Error),

    /// A lifecycle operation that requires a running backend.
    #[error("embedded backend is not running")]
    NotRunning,
}

/// The embedded evaluation backend: one listener generation at a time
/// around one long-lived environment.
#[derive(Debug)]
pub struct EmbeddedBackend {
    env: Arc<Mutex<Environment>>,
    listener: Option<ListenerControl>,
}

impl Default for EmbeddedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedBackend {
    /// Creates a backend with a fresh environment and no listener.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: Arc::new(Mutex::new(Environment::new())),
            listener: None,
        }
    }

    /// Starts the listener and returns its discovered port.
    ///
    /// Launching an already-running backend returns the current port
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Bind`] when the loopback bind fails.
    pub fn launch(&mut self) -> Result<u16, BackendError> {
        if let Some(listener) = &self.listener {
            return Ok(listener.port);
        }
        let listener = spawn_listener(Arc::clone(&self.env))?;
        let port = listener.port;
        self.listener = Some(listener);
        info!(target: SUPERVISOR_TARGET, port, "embedded backend launched");
        Ok(port)
    }

    /// Returns the current listener port, if running.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.listener.as_ref().map(|listener| listener.port)
    }

    /// Replaces the listener with a fresh one on a new ephemeral port.
    ///
    /// The old generation's interrupt flag is raised first so an evaluation
    /// wedged in a loop unwinds and releases the environment, then the
    /// accept loop is stopped and joined. The environment itself is never
    /// touched: definitions accumulated before the restart remain visible
    /// after it. Callers must invalidate any session bound to the old port.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotRunning`] when no listener was launched,
    /// and [`BackendError::Bind`] when the replacement bind fails.
    pub fn restart(&mut self) -> Result<u16, BackendError> {
        let Some(old) = self.listener.take() else {
            return Err(BackendError::NotRunning);
        };
        let old_port = old.port;
        stop_listener(old);

        let listener = spawn_listener(Arc::clone(&self.env))?;
        let port = listener.port;
        self.listener = Some(listener);
        info!(
            target: SUPERVISOR_TARGET,
            old_port,
            port,
            "embedded backend restarted"
        );
        Ok(port)
    }
}

impl Drop for EmbeddedBackend {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            stop_listener(listener);
        }
    }
}

/// Interrupts in-flight evaluations, stops the accept loop, and joins it.
fn stop_listener(listener: ListenerControl) {
    listener.interrupt.store(true, Ordering::SeqCst);
    listener.shutdown.store(true, Ordering::SeqCst);
    if listener.handle.join().is_err() {
        warn!(target: SUPERVISOR_TARGET, "listener thread panicked during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use crate::aggregate::run_operation;
    use crate::error::ClientError;
    use crate::session::SessionManager;

    use super::*;

    const EVAL_TIMEOUT: Duration = Duration::from_secs(5);

    fn evaluate(
        manager: &mut SessionManager,
        port: u16,
        code: &str,
    ) -> Result<crate::aggregate::Outcome, ClientError> {
        let session = manager.ensure_session(port)?;
        let request = session.eval_request(code);
        run_operation(session, &request, EVAL_TIMEOUT)
    }

    #[rstest]
    fn serves_evaluation_over_the_wire() {
        let mut backend = EmbeddedBackend::new();
        let port = backend.launch().expect("launch backend");
        let mut manager = SessionManager::new();

        let outcome = evaluate(&mut manager, port, "(+ 1 2 3)").expect("evaluate");
        assert_eq!(outcome.values, vec!["6".to_owned()]);

        let faulted = evaluate(&mut manager, port, "(/ 1 0)").expect("evaluate fault");
        assert!(faulted.error_text.contains("Divide by zero"));
        assert!(faulted.values.is_empty());
    }

    #[rstest]
    fn launched_backend_renders_debug_state() {
        let mut backend = EmbeddedBackend::new();
        backend.launch().expect("launch backend");
        let rendered = format!("{backend:?}");
        assert!(rendered.contains("EmbeddedBackend"));
        assert!(rendered.contains("ListenerControl"));
    }

    #[rstest]
    fn listener_reassembles_request_split_across_writes() {
        use std::io::Write;

        let mut backend = EmbeddedBackend::new();
        let port = backend.launch().expect("launch backend");

        let mut stream =
            std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect to listener");
        let request = crate::bencode::Value::request(&[("op", "clone"), ("id", "1")]).to_bytes();
        let (head, tail) = request.split_at(4);
        stream.write_all(head).expect("write request head");
        // Long enough to expire the listener's read poll mid-frame.
        std::thread::sleep(Duration::from_millis(250));
        stream.write_all(tail).expect("write request tail");

        let reply = crate::bencode::Decoder::new(stream)
            .read_value()
            .expect("clone reply");
        assert!(reply.get_text("new-session").is_some());
    }

    #[rstest]
    fn launch_is_idempotent() {
        let mut backend = EmbeddedBackend::new();
        let first = backend.launch().expect("launch");
        let second = backend.launch().expect("relaunch");
        assert_eq!(first, second);
    }

    #[rstest]
    fn restart_before_launch_fails() {
        let mut backend = EmbeddedBackend::new();
        assert!(matches!(backend.restart(), Err(BackendError::NotRunning)));
    }

    #[rstest]
    fn restart_moves_port_and_preserves_definitions() {
        let mut backend = EmbeddedBackend::new();
        let old_port = backend.launch().expect("launch backend");
        let mut manager = SessionManager::new();

        drop(evaluate(&mut manager, old_port, "(def keeper 7)").expect("define"));

        let new_port = backend.restart().expect("restart backend");
        assert_ne!(old_port, new_port);
        manager.invalidate();

        let outcome = evaluate(&mut manager, new_port, "keeper").expect("evaluate after restart");
        assert_eq!(outcome.values, vec!["7".to_owned()]);
    }

    #[rstest]
    fn restart_interrupts_wedged_evaluation() {
        let mut backend = EmbeddedBackend::new();
        let port = backend.launch().expect("launch backend");

        // Wedge the backend from a throwaway session on its own thread.
        let wedger = std::thread::spawn(move || {
            let mut manager = SessionManager::new();
            evaluate(&mut manager, port, "(while true 1)")
        });
        std::thread::sleep(Duration::from_millis(200));

        let new_port = backend.restart().expect("restart backend");
        let result = wedger.join().expect("join wedger");
        // The wedged exchange must end cleanly, not hang: either the
        // interrupt fault surfaced as error text or the connection died.
        match result {
            Ok(outcome) => assert!(outcome.error_text.contains("interrupted")),
            Err(_) => {}
        }

        let mut manager = SessionManager::new();
        let outcome = evaluate(&mut manager, new_port, "(+ 2 2)").expect("evaluate after restart");
        assert_eq!(outcome.values, vec!["4".to_owned()]);
    }
}
