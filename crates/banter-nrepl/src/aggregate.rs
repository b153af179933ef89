//! Accumulates streamed reply frames into one structured result.
//!
//! One logical request yields many reply frames; the sequence is terminal
//! when a frame's status carries `done`. The loop here makes that explicit:
//! it accumulates frames until the terminal marker or a wall-clock deadline,
//! and only a completed sequence is partitioned into channels. Partial
//! frames from a timed-out exchange are discarded, because the operation
//! they belong to never completed.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::bencode::Value;
use crate::error::ClientError;
use crate::session::Session;
use crate::transport::TransportError;

/// Log target for aggregation.
const AGGREGATE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::aggregate");

/// Channel-partitioned summary of one completed backend operation.
///
/// Channels absent from every frame default to empty. An evaluation fault
/// reported by the backend is a normally-completed outcome with non-empty
/// [`error_text`](Self::error_text), not a transport failure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Printed output (`out` channel), newline-joined in arrival order.
    pub output: String,
    /// Printed errors (`err` channel), newline-joined in arrival order.
    pub error_text: String,
    /// Return values (`value` channel) in arrival order.
    pub values: Vec<String>,
}

impl Outcome {
    /// Reports whether every channel is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.error_text.is_empty() && self.values.is_empty()
    }
}

/// Sends one request frame and drives the reply loop to completion.
///
/// # Errors
///
/// Returns [`ClientError::Timeout`] when no terminal frame arrives within
/// `timeout` (accumulated frames are discarded), and
/// [`ClientError::Transport`] when the exchange fails outright, for
/// example when the listener behind the session is torn down mid-flight.
pub fn run_operation(
    session: &mut Session,
    request: &Value,
    timeout: Duration,
) -> Result<Outcome, ClientError> {
    session.transport.send(request)?;

    let started = Instant::now();
    let mut frames = Vec::new();
    loop {
        match session.transport.receive() {
            Ok(frame) => {
                trace!(target: AGGREGATE_TARGET, ?frame, "reply frame");
                let terminal = frame.status_contains("done");
                frames.push(frame);
                if terminal {
                    break;
                }
            }
            Err(TransportError::ReadTimeout) => {}
            Err(error) => return Err(error.into()),
        }

        let waited = started.elapsed();
        if waited >= timeout {
            debug!(
                target: AGGREGATE_TARGET,
                ?waited,
                discarded = frames.len(),
                "operation timed out before terminal frame"
            );
            return Err(ClientError::Timeout { waited });
        }
    }

    Ok(partition(&frames))
}

/// Groups a completed frame sequence by channel.
fn partition(frames: &[Value]) -> Outcome {
    let mut output = Vec::new();
    let mut errors = Vec::new();
    let mut values = Vec::new();

    for frame in frames {
        if let Some(text) = frame.get_text("out") {
            output.push(text.trim_end_matches('\n').to_owned());
        }
        if let Some(text) = frame.get_text("err") {
            errors.push(text.trim_end_matches('\n').to_owned());
        }
        if let Some(text) = frame.get_text("value") {
            values.push(text.into_owned());
        }
    }

    Outcome {
        output: output.join("\n"),
        error_text: errors.join("\n"),
        values,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use rstest::rstest;

    use crate::session::SessionManager;

    use super::*;

    const CLONE_REPLY: &[u8] = b"d11:new-session8:tok-00016:statusl4:doneee";

    /// Stub backend: one connection, clone handshake, then one scripted
    /// reply burst for the next request.
    fn eval_backend(reply_frames: Vec<u8>) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind stub backend");
        let port = listener.local_addr().expect("stub address").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buffer = vec![0_u8; 4096];
            let _ = stream.read(&mut buffer).expect("read clone");
            stream.write_all(CLONE_REPLY).expect("write clone reply");
            let _ = stream.read(&mut buffer).expect("read eval");
            stream.write_all(&reply_frames).expect("write eval reply");
            // Hold the connection open until the client hangs up, so a
            // missing terminal frame manifests as a timeout rather than a
            // closed connection.
            let _ = stream.read(&mut buffer);
        });
        (port, handle)
    }

    fn run(port: u16, timeout: Duration) -> Result<Outcome, ClientError> {
        let mut manager = SessionManager::new();
        let session = manager.ensure_session(port)?;
        let request = session.eval_request("(ignored)");
        run_operation(session, &request, timeout)
    }

    #[rstest]
    fn aggregates_value_reply() {
        let (port, backend) = eval_backend(
            [
                b"d2:ns4:user5:value1:6e".as_slice(),
                b"d6:statusl4:doneee".as_slice(),
            ]
            .concat(),
        );

        let outcome = run(port, Duration::from_secs(5)).expect("run operation");

        assert_eq!(outcome.values, vec!["6".to_owned()]);
        assert!(outcome.output.is_empty());
        assert!(outcome.error_text.is_empty());
        backend.join().expect("join stub");
    }

    #[rstest]
    fn joins_streamed_output_in_arrival_order() {
        let (port, backend) = eval_backend(
            [
                b"d3:out6:first\ne".as_slice(),
                b"d3:out7:second\ne".as_slice(),
                b"d5:value3:nile".as_slice(),
                b"d6:statusl4:doneee".as_slice(),
            ]
            .concat(),
        );

        let outcome = run(port, Duration::from_secs(5)).expect("run operation");

        assert_eq!(outcome.output, "first\nsecond");
        assert_eq!(outcome.values, vec!["nil".to_owned()]);
        backend.join().expect("join stub");
    }

    #[rstest]
    fn evaluation_fault_completes_with_error_text() {
        let (port, backend) = eval_backend(
            [
                b"d3:err16:Divide by zero\n\ne".as_slice(),
                b"d6:statusl10:eval-erroree".as_slice(),
                b"d6:statusl4:doneee".as_slice(),
            ]
            .concat(),
        );

        let outcome = run(port, Duration::from_secs(5)).expect("run operation");

        assert!(outcome.error_text.contains("Divide by zero"));
        assert!(outcome.values.is_empty());
        backend.join().expect("join stub");
    }

    #[rstest]
    fn missing_terminal_frame_times_out_and_discards_partials() {
        // Output frame arrives but `done` never does.
        let (port, backend) = eval_backend(b"d3:out8:partial\ne".to_vec());

        let result = run(port, Duration::from_millis(300));

        assert!(matches!(result, Err(ClientError::Timeout { .. })));
        backend.join().expect("join stub");
    }

    #[rstest]
    fn empty_channels_default_to_empty_text() {
        let (port, backend) = eval_backend(b"d6:statusl4:doneee".to_vec());

        let outcome = run(port, Duration::from_secs(5)).expect("run operation");

        assert!(outcome.is_empty());
        backend.join().expect("join stub");
    }
}
