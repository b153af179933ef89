//! The request loop: newline-delimited JSON-RPC over arbitrary streams.
//!
//! One request per line in, one response per line out. The loop owns the
//! initialisation handshake and routes everything else to the tool,
//! prompt, and resource surfaces.

use std::io::{self, BufRead, Write};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::protocol::{
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, NOT_INITIALISED, PARSE_ERROR,
    PROTOCOL_VERSION, Request, Response,
};
use crate::tools::{Bridge, ToolError};
use crate::{prompts, resources};

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// Largest accepted request line in bytes. Anything longer is rejected
/// before parsing so a runaway client cannot balloon memory.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Serves the tool-calling protocol over a pair of byte streams.
pub struct McpServer {
    bridge: Bridge,
    initialised: bool,
}

enum LineRead {
    Eof,
    Line,
    Oversized,
}

impl McpServer {
    /// Creates a server around a backend bridge.
    #[must_use]
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            initialised: false,
        }
    }

    /// Runs the request loop until the input stream closes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when reading a request or writing
    /// a response fails.
    pub fn run<R: BufRead, W: Write>(&mut self, mut reader: R, mut writer: W) -> io::Result<()> {
        info!(target: TARGET, "request loop started");
        let mut line = String::new();
        loop {
            line.clear();
            match read_bounded_line(&mut reader, &mut line)? {
                LineRead::Eof => {
                    info!(target: TARGET, "input closed; shutting down");
                    return Ok(());
                }
                LineRead::Oversized => {
                    warn!(target: TARGET, "rejected oversized request line");
                    write_response(&mut writer, &oversize_response())?;
                }
                LineRead::Line => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Some(response) = self.handle_line(trimmed) {
                        write_response(&mut writer, &response)?;
                    }
                }
            }
        }
    }

    /// Processes one request line, returning the response if one is owed.
    fn handle_line(&mut self, line: &str) -> Option<Response> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(error) => {
                warn!(target: TARGET, error = %error, "unparseable request");
                return Some(Response::failure(
                    Value::Null,
                    PARSE_ERROR,
                    format!("invalid JSON: {error}"),
                ));
            }
        };
        if request.is_notification() {
            debug!(target: TARGET, method = %request.method, "notification acknowledged");
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        Some(self.dispatch(id, &request))
    }

    fn dispatch(&mut self, id: Value, request: &Request) -> Response {
        debug!(target: TARGET, method = %request.method, "handling request");
        if !self.initialised && request.method != "initialize" {
            return Response::failure(
                id,
                NOT_INITIALISED,
                "server has not been initialised; send initialize first",
            );
        }
        match request.method.as_str() {
            "initialize" => {
                self.initialised = true;
                info!(target: TARGET, "session initialised");
                Response::success(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {
                            "tools": {},
                            "prompts": {},
                            "resources": {},
                        },
                        "serverInfo": {
                            "name": env!("CARGO_PKG_NAME"),
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )
            }
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success(id, json!({"tools": crate::tools::definitions()})),
            "tools/call" => self.call_tool(id, request),
            "prompts/list" => Response::success(id, json!({"prompts": prompts::list()})),
            "prompts/get" => match request.param("name").and_then(Value::as_str) {
                Some(name) => match prompts::get(name) {
                    Ok(prompt) => Response::success(id, prompt),
                    Err(message) => Response::failure(id, INVALID_PARAMS, message),
                },
                None => Response::failure(id, INVALID_PARAMS, "prompts/get requires a name"),
            },
            "resources/list" => {
                Response::success(id, json!({"resources": resources::list()}))
            }
            "resources/read" => match request.param("uri").and_then(Value::as_str) {
                Some(uri) => match resources::read(uri, &self.bridge) {
                    Ok(resource) => Response::success(id, resource),
                    Err(message) => Response::failure(id, INVALID_PARAMS, message),
                },
                None => Response::failure(id, INVALID_PARAMS, "resources/read requires a uri"),
            },
            other => Response::failure(
                id,
                METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            ),
        }
    }

    fn call_tool(&mut self, id: Value, request: &Request) -> Response {
        let Some(name) = request.param("name").and_then(Value::as_str) else {
            return Response::failure(id, INVALID_PARAMS, "tools/call requires a tool name");
        };
        let arguments = request
            .param("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        match self.bridge.call(name, &arguments) {
            Ok(result) => Response::success(id, result.into_json()),
            Err(error @ ToolError::UnknownTool { .. }) => {
                Response::failure(id, INVALID_PARAMS, error.to_string())
            }
            Err(error @ ToolError::InvalidArgument { .. }) => {
                Response::failure(id, INVALID_PARAMS, error.to_string())
            }
        }
    }
}

fn oversize_response() -> Response {
    Response::failure(
        Value::Null,
        INVALID_REQUEST,
        format!(
            "request exceeds {MAX_REQUEST_BYTES} bytes; write the code to a file \
             and use the load-file tool instead"
        ),
    )
}

fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    let encoded = serde_json::to_string(response).map_err(io::Error::other)?;
    writer.write_all(encoded.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Reads one line, refusing to buffer more than [`MAX_REQUEST_BYTES`].
///
/// On an oversized line the remainder is drained up to and including its
/// newline so the loop resynchronises on the next request.
fn read_bounded_line<R: BufRead>(reader: &mut R, line: &mut String) -> io::Result<LineRead> {
    let consumed = io::Read::take(&mut *reader, MAX_REQUEST_BYTES + 1).read_line(line)?;
    if consumed == 0 {
        return Ok(LineRead::Eof);
    }
    if line.len() as u64 <= MAX_REQUEST_BYTES {
        return Ok(LineRead::Line);
    }
    if !line.ends_with('\n') {
        drain_to_newline(reader)?;
    }
    Ok(LineRead::Oversized)
}

fn drain_to_newline<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let buffer = reader.fill_buf()?;
        if buffer.is_empty() {
            return Ok(());
        }
        if let Some(position) = buffer.iter().position(|&byte| byte == b'\n') {
            reader.consume(position + 1);
            return Ok(());
        }
        let length = buffer.len();
        reader.consume(length);
    }
}
