//! In-process backend listener speaking the bencode wire protocol.
//!
//! The listener accepts loopback connections in a background thread and
//! serves `clone` and `eval` operations against a shared [`Environment`].
//! Sessions (token to current-namespace bindings) are owned here and die
//! with the listener; the environment is shared and deliberately survives.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::engine::{self, Environment};
use crate::bencode::{BencodeError, FrameReader, Value};

/// Log target for embedded listener operations.
const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::embedded");

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const READ_POLL: Duration = Duration::from_millis(100);

/// Monotonic source of session tokens across listener generations.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle to one running listener generation.
#[derive(Debug)]
pub(super) struct ListenerControl {
    pub(super) port: u16,
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) interrupt: Arc<AtomicBool>,
    pub(super) handle: thread::JoinHandle<()>,
}

/// Binds an ephemeral loopback port and starts the accept loop.
///
/// The bound port is known before this function returns, which is the
/// embedded mode's port-discovery step: a bind failure here is fatal to
/// whoever is launching the backend.
pub(super) fn spawn_listener(env: Arc<Mutex<Environment>>) -> io::Result<ListenerControl> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let interrupt = Arc::new(AtomicBool::new(false));
    let loop_shutdown = Arc::clone(&shutdown);
    let loop_interrupt = Arc::clone(&interrupt);
    let handle =
        thread::spawn(move || accept_loop(&listener, &env, &loop_shutdown, &loop_interrupt));

    debug!(target: LISTENER_TARGET, port, "embedded backend listening");
    Ok(ListenerControl {
        port,
        shutdown,
        interrupt,
        handle,
    })
}

fn accept_loop(
    listener: &TcpListener,
    env: &Arc<Mutex<Environment>>,
    shutdown: &Arc<AtomicBool>,
    interrupt: &Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let env = Arc::clone(env);
                let shutdown = Arc::clone(shutdown);
                let interrupt = Arc::clone(interrupt);
                thread::spawn(move || {
                    if let Err(error) = serve_connection(stream, &env, &shutdown, &interrupt) {
                        debug!(target: LISTENER_TARGET, %error, "connection closed");
                    }
                });
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(error) => {
                warn!(target: LISTENER_TARGET, %error, "accept error");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    env: &Arc<Mutex<Environment>>,
    shutdown: &Arc<AtomicBool>,
    interrupt: &Arc<AtomicBool>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut writer = stream.try_clone()?;
    let mut reader = FrameReader::new(stream);
    let mut sessions: HashMap<String, String> = HashMap::new();

    loop {
        match reader.read_frame() {
            Ok(frame) => handle_frame(&frame, &mut sessions, &mut writer, env, interrupt)?,
            Err(BencodeError::Io(error))
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                if shutdown.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
            Err(BencodeError::Io(error)) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(error) => {
                warn!(target: LISTENER_TARGET, %error, "dropping connection on malformed frame");
                return Ok(());
            }
        }
    }
}

fn handle_frame(
    frame: &Value,
    sessions: &mut HashMap<String, String>,
    writer: &mut TcpStream,
    env: &Arc<Mutex<Environment>>,
    interrupt: &Arc<AtomicBool>,
) -> io::Result<()> {
    let id = frame.get_text("id").map(|text| text.into_owned());
    let op = frame.get_text("op").map(|text| text.into_owned());
    match op.as_deref() {
        Some("clone") => handle_clone(sessions, writer, id.as_deref()),
        Some("eval") => handle_eval(frame, sessions, writer, env, interrupt, id.as_deref()),
        _ => send_frame(
            writer,
            &[],
            id.as_deref(),
            None,
            &["done", "error", "unknown-op"],
        ),
    }
}

fn handle_clone(
    sessions: &mut HashMap<String, String>,
    writer: &mut TcpStream,
    id: Option<&str>,
) -> io::Result<()> {
    let token = format!("session-{}", SESSION_COUNTER.fetch_add(1, Ordering::SeqCst));
    sessions.insert(token.clone(), "user".to_owned());
    send_frame(
        writer,
        &[("new-session", &token)],
        id,
        Some(&token),
        &["done"],
    )
}

fn handle_eval(
    frame: &Value,
    sessions: &mut HashMap<String, String>,
    writer: &mut TcpStream,
    env: &Arc<Mutex<Environment>>,
    interrupt: &Arc<AtomicBool>,
    id: Option<&str>,
) -> io::Result<()> {
    let token = frame
        .get_text("session")
        .map(|text| text.into_owned())
        .unwrap_or_default();
    let Some(code) = frame.get_text("code").map(|text| text.into_owned()) else {
        return send_frame(writer, &[], id, Some(&token), &["done", "error", "no-code"]);
    };

    let ns = sessions
        .get(&token)
        .cloned()
        .unwrap_or_else(|| "user".to_owned());

    let output = {
        let mut guard = env.lock().unwrap_or_else(|poison| poison.into_inner());
        engine::eval_source(&mut guard, &ns, interrupt, &code)
    };
    sessions.insert(token.clone(), output.ns.clone());

    for line in &output.printed {
        let text = format!("{line}\n");
        send_frame(writer, &[("out", &text)], id, Some(&token), &[])?;
    }
    for value in &output.values {
        send_frame(
            writer,
            &[("value", value), ("ns", &output.ns)],
            id,
            Some(&token),
            &[],
        )?;
    }
    if let Some(fault) = &output.fault {
        let text = format!("{fault}\n");
        send_frame(writer, &[("err", &text)], id, Some(&token), &[])?;
        send_frame(writer, &[], id, Some(&token), &["eval-error"])?;
    }
    send_frame(writer, &[], id, Some(&token), &["done"])
}

/// Writes one reply frame echoing `id` and `session`, with `status` markers.
fn send_frame(
    writer: &mut TcpStream,
    fields: &[(&str, &str)],
    id: Option<&str>,
    session: Option<&str>,
    status: &[&str],
) -> io::Result<()> {
    let mut entries = std::collections::BTreeMap::new();
    for (key, value) in fields {
        entries.insert((*key).to_owned(), Value::string(*value));
    }
    if let Some(id) = id {
        entries.insert("id".to_owned(), Value::string(id));
    }
    if let Some(session) = session {
        entries.insert("session".to_owned(), Value::string(session));
    }
    if !status.is_empty() {
        let markers = status.iter().map(|marker| Value::string(*marker)).collect();
        entries.insert("status".to_owned(), Value::List(markers));
    }
    writer.write_all(&Value::Dict(entries).to_bytes())?;
    writer.flush()
}
