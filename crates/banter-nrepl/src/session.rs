//! Session lifecycle against the evaluation backend.
//!
//! Exactly one session is live at a time. A session pairs the framed
//! connection with the backend-issued token identifying its evaluation
//! context; the two are installed together and torn down together. The
//! handshake itself is not atomic across the network: when the socket opens
//! but the `clone` reply never arrives, no session is installed and the
//! half-open socket is dropped rather than leaked.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bencode::Value;
use crate::error::ClientError;
use crate::transport::{TransportError, WireTransport};

/// Log target for session operations.
const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

/// Frames tolerated before giving up on finding the handshake reply.
const MAX_HANDSHAKE_FRAMES: usize = 16;

/// Wall-clock bound on the `clone` handshake.
///
/// Read polls expiring within this window are retried; a slow reply is not
/// a failed handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe request ID generator shared by all outbound frames.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generates a unique outbound request id.
#[must_use]
pub fn next_request_id() -> String {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst).to_string()
}

/// One live connection plus the token naming its evaluation context.
#[derive(Debug)]
pub struct Session {
    pub(crate) transport: WireTransport,
    token: String,
    port: u16,
}

impl Session {
    /// Returns the backend-issued session token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the backend port this session is bound to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Builds an `eval` request frame carrying `code` in this session.
    #[must_use]
    pub fn eval_request(&self, code: &str) -> Value {
        Value::request(&[
            ("op", "eval"),
            ("code", code),
            ("id", &next_request_id()),
            ("session", &self.token),
        ])
    }
}

/// Owner of the single live [`Session`].
///
/// The manager is the one writer of session state; everything else receives
/// the session by reference for the duration of one operation.
#[derive(Debug, Default)]
pub struct SessionManager {
    current: Option<Session>,
}

impl SessionManager {
    /// Creates a manager with no live session.
    #[must_use]
    pub const fn new() -> Self {
        Self { current: None }
    }

    /// Returns the port of the live session, if any.
    #[must_use]
    pub fn current_port(&self) -> Option<u16> {
        self.current.as_ref().map(Session::port)
    }

    /// Returns a live session against `port`, reusing or creating one.
    ///
    /// A live session on the same port is reused unchanged. Otherwise a new
    /// connection is opened and the `clone` handshake performed; the
    /// previous session (if any) is replaced and its connection closed only
    /// once the new one is fully established.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when the connection fails and
    /// [`ClientError::Handshake`] when no session token arrives.
    pub fn ensure_session(&mut self, port: u16) -> Result<&mut Session, ClientError> {
        let reusable = self
            .current
            .as_ref()
            .is_some_and(|session| session.port() == port);
        if !reusable {
            let session = open_session(port)?;
            debug!(
                target: SESSION_TARGET,
                port,
                token = session.token(),
                "session established"
            );
            self.current = Some(session);
        }
        self.current.as_mut().ok_or(ClientError::NoSession)
    }

    /// Tears down the live session, if any.
    ///
    /// Used after a backend restart: the old listener is gone, so the next
    /// `ensure_session` call must rebuild against the new port.
    pub fn invalidate(&mut self) {
        if let Some(session) = self.current.take() {
            debug!(
                target: SESSION_TARGET,
                port = session.port(),
                "session invalidated"
            );
        }
    }
}

/// Connects and performs the session-creation handshake.
///
/// On any failure past the connect, the socket is dropped here; the caller
/// never observes a half-established session.
fn open_session(port: u16) -> Result<Session, ClientError> {
    let mut transport = WireTransport::connect(port)?;
    let request = Value::request(&[("op", "clone"), ("id", &next_request_id())]);
    transport.send(&request)?;

    let started = Instant::now();
    let mut frames = 0;
    while frames < MAX_HANDSHAKE_FRAMES {
        match transport.receive() {
            Ok(frame) => {
                frames += 1;
                if let Some(token) = frame.get_text("new-session") {
                    return Ok(Session {
                        token: token.into_owned(),
                        port,
                        transport,
                    });
                }
                if frame.status_contains("done") {
                    break;
                }
            }
            Err(TransportError::ReadTimeout) => {
                if started.elapsed() >= HANDSHAKE_TIMEOUT {
                    warn!(target: SESSION_TARGET, port, "clone reply missed the handshake deadline");
                    return Err(ClientError::handshake(
                        "no clone reply within the handshake deadline",
                    ));
                }
            }
            Err(error) => return Err(error.into()),
        }
    }

    warn!(target: SESSION_TARGET, port, "clone reply carried no session token");
    Err(ClientError::handshake(
        "backend reply carried no new-session token",
    ))
}
