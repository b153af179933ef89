//! Framed TCP transport for backend request/reply frames.
//!
//! The transport owns one loopback socket to the evaluation backend and
//! exchanges exactly one bencode dictionary per call. Failures surface as
//! [`TransportError`] values; nothing here panics past its own boundary.

use std::io::{self, Write};
use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::bencode::{BencodeError, FrameReader, Value};

/// Log target for transport operations.
const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Poll interval used as the socket read timeout.
///
/// Short enough that the aggregator's wall-clock deadline is honoured
/// promptly, long enough to avoid a busy loop.
const READ_POLL: Duration = Duration::from_millis(100);

/// Errors raised by the wire transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connecting to the backend port failed.
    #[error("failed to connect to backend at 127.0.0.1:{port}: {source}")]
    Connect {
        /// The refused port.
        port: u16,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// I/O failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No frame arrived within the socket read timeout.
    #[error("read timed out waiting for a reply frame")]
    ReadTimeout,

    /// The inbound bytes were not a well-formed frame.
    #[error("malformed frame: {0}")]
    Frame(BencodeError),
}

/// One bidirectional framed connection to the backend.
///
/// Reads are polled with a short socket timeout so callers can interleave
/// deadline checks between frames. Partial frames survive a poll expiry:
/// the reader buffers consumed bytes and resumes decoding on the next call.
#[derive(Debug)]
pub struct WireTransport {
    reader: FrameReader<TcpStream>,
    writer: TcpStream,
}

impl WireTransport {
    /// Connects to a backend listening on the loopback interface.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the port refuses, and
    /// [`TransportError::Io`] if socket configuration fails.
    pub fn connect(port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .map_err(|source| TransportError::Connect { port, source })?;
        stream.set_read_timeout(Some(READ_POLL))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        debug!(target: TRANSPORT_TARGET, port, "connected to backend");
        Ok(Self {
            reader: FrameReader::new(stream),
            writer,
        })
    }

    /// Writes one request frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the write fails.
    pub fn send(&mut self, request: &Value) -> Result<(), TransportError> {
        self.writer.write_all(&request.to_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads one reply frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReadTimeout`] when no complete frame
    /// arrives within the poll interval (any partial frame stays buffered),
    /// and [`TransportError::Frame`] for malformed input.
    pub fn receive(&mut self) -> Result<Value, TransportError> {
        match self.reader.read_frame() {
            Ok(frame) => Ok(frame),
            Err(BencodeError::Io(error)) if is_timeout(&error) => Err(TransportError::ReadTimeout),
            Err(BencodeError::Io(error)) => Err(TransportError::Io(error)),
            Err(error) => Err(TransportError::Frame(error)),
        }
    }
}

/// Reports whether an I/O error is a socket read-timeout expiry.
///
/// Unix surfaces expiry as `WouldBlock`; Windows as `TimedOut`.
fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    use rstest::rstest;

    use super::*;

    /// Stub backend that reads one frame and replies with a scripted frame.
    fn scripted_backend(reply: Vec<u8>) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind stub backend");
        let port = listener.local_addr().expect("stub address").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut received = vec![0_u8; 1024];
            let count = stream.read(&mut received).expect("read request");
            received.truncate(count);
            stream.write_all(&reply).expect("write reply");
            received
        });
        (port, handle)
    }

    #[rstest]
    fn sends_request_and_receives_reply() {
        let (port, backend) = scripted_backend(b"d11:new-session4:s-016:statusl4:doneee".to_vec());
        let mut transport = WireTransport::connect(port).expect("connect");

        transport
            .send(&Value::request(&[("op", "clone")]))
            .expect("send");
        let reply = transport.receive().expect("receive");

        assert_eq!(reply.get_text("new-session").as_deref(), Some("s-01"));
        assert!(reply.status_contains("done"));
        assert_eq!(backend.join().expect("join stub"), b"d2:op5:clonee");
    }

    #[rstest]
    fn connection_refused_is_a_connect_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let result = WireTransport::connect(port);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[rstest]
    fn silent_backend_yields_read_timeout() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind stub backend");
        let port = listener.local_addr().expect("stub address").port();
        let mut transport = WireTransport::connect(port).expect("connect");

        let result = transport.receive();
        assert!(matches!(result, Err(TransportError::ReadTimeout)));
        drop(listener);
    }

    #[rstest]
    fn frame_split_across_poll_expiries_is_reassembled() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind stub backend");
        let port = listener.local_addr().expect("stub address").port();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream.write_all(b"d3:ou").expect("write frame head");
            thread::sleep(Duration::from_millis(300));
            stream.write_all(b"t5:helloe").expect("write frame tail");
        });

        let mut transport = WireTransport::connect(port).expect("connect");
        let mut expiries = 0;
        let frame = loop {
            match transport.receive() {
                Ok(frame) => break frame,
                Err(TransportError::ReadTimeout) => {
                    expiries += 1;
                    assert!(expiries < 50, "frame never completed");
                }
                Err(error) => panic!("unexpected transport error: {error}"),
            }
        };

        assert_eq!(frame.get_text("out").as_deref(), Some("hello"));
        assert!(expiries >= 1, "stub pause should expire at least one poll");
        stub.join().expect("join stub");
    }

    #[rstest]
    fn malformed_reply_is_a_frame_error() {
        let (port, backend) = scripted_backend(b"x-not-bencode".to_vec());
        let mut transport = WireTransport::connect(port).expect("connect");

        transport
            .send(&Value::request(&[("op", "clone")]))
            .expect("send");
        let result = transport.receive();

        assert!(matches!(result, Err(TransportError::Frame(_))));
        drop(backend.join());
    }
}
