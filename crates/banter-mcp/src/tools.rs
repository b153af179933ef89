//! Tool surface bridging tool calls onto backend evaluations.
//!
//! Every tool renders its arguments into a code form, runs it through the
//! session layer, and folds the reply channels into text content. Evaluation
//! faults are reported as tool results flagged `isError`, not as protocol
//! errors, so the calling agent can read the diagnostic and try again.

use std::time::Duration;

use banter_nrepl::{ClientError, EmbeddedBackend, Outcome, SessionManager, run_operation};
use serde_json::{Value, json};
use tracing::{debug, warn};

const TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::tools");

/// Smallest accepted per-call timeout in milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 200;
/// Largest accepted per-call timeout in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 600_000;
/// Default timeout for evaluation and file loading.
pub const EVAL_TIMEOUT_MS: u64 = 30_000;
/// Default timeout for introspection calls.
pub const QUERY_TIMEOUT_MS: u64 = 10_000;

/// How the bridge reaches its backend.
pub enum Mode {
    /// A backend that is already listening on a known port.
    External { port: u16 },
    /// A backend hosted inside this process.
    Embedded { backend: EmbeddedBackend },
}

/// A tool invocation that could not be dispatched at all.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ToolError {
    /// The requested tool does not exist.
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
    /// A required argument was absent or malformed.
    #[error("{message}")]
    InvalidArgument { message: String },
}

impl ToolError {
    fn argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Rendered outcome of a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Text segments, in reply order.
    pub segments: Vec<String>,
    /// Whether the call surfaced an evaluation or transport failure.
    pub is_error: bool,
}

impl ToolResult {
    fn text(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
            is_error: false,
        }
    }

    fn fault(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
            is_error: true,
        }
    }

    /// Serialises this result into the `tools/call` response shape.
    #[must_use]
    pub fn into_json(self) -> Value {
        let content: Vec<Value> = self
            .segments
            .iter()
            .map(|text| json!({"type": "text", "text": text}))
            .collect();
        json!({"content": content, "isError": self.is_error})
    }
}

/// Connects tool calls to a backend session.
pub struct Bridge {
    sessions: SessionManager,
    mode: Mode,
}

impl Bridge {
    /// Creates a bridge targeting an already-running backend.
    #[must_use]
    pub fn external(port: u16) -> Self {
        Self {
            sessions: SessionManager::new(),
            mode: Mode::External { port },
        }
    }

    /// Creates a bridge around an embedded backend.
    #[must_use]
    pub fn embedded(backend: EmbeddedBackend) -> Self {
        Self {
            sessions: SessionManager::new(),
            mode: Mode::Embedded { backend },
        }
    }

    /// Dispatches a named tool call.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] when the tool is unknown or an argument fails
    /// validation. Backend failures are folded into the [`ToolResult`]
    /// instead so the caller sees them as tool output.
    pub fn call(&mut self, name: &str, arguments: &Value) -> Result<ToolResult, ToolError> {
        debug!(target: TARGET, tool = name, "dispatching tool call");
        match name {
            "evaluate-code" => {
                let code = required_str(arguments, "code")?;
                let timeout = timeout_from(arguments, EVAL_TIMEOUT_MS)?;
                Ok(self.evaluate(code, timeout))
            }
            "load-file" => {
                let path = required_str(arguments, "file-path")?;
                let timeout = timeout_from(arguments, EVAL_TIMEOUT_MS)?;
                let form = format!("(load-file {})", quote_string(path));
                Ok(self.evaluate(&form, timeout))
            }
            "set-namespace" => {
                let namespace = required_symbol(arguments, "namespace")?;
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(in-ns '{namespace})");
                Ok(self.evaluate(&form, timeout))
            }
            "search-symbols" => {
                let query = required_str(arguments, "query")?;
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(clojure.repl/apropos {})", quote_string(query));
                Ok(self.evaluate(&form, timeout))
            }
            "get-doc" => {
                let symbol = required_symbol(arguments, "symbol")?;
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(clojure.repl/doc {symbol})");
                Ok(self.evaluate(&form, timeout))
            }
            "get-source" => {
                let symbol = required_symbol(arguments, "symbol")?;
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(clojure.repl/source {symbol})");
                Ok(self.evaluate(&form, timeout))
            }
            "list-vars" => {
                let namespace = match arguments.get("namespace") {
                    Some(value) => as_symbol(value, "namespace")?.to_owned(),
                    None => "user".to_owned(),
                };
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(clojure.repl/dir {namespace})");
                Ok(self.evaluate(&form, timeout))
            }
            "list-namespaces" => {
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                Ok(self.evaluate("(sort (map str (all-ns)))", timeout))
            }
            "current-namespace" => {
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                Ok(self.evaluate("(str *ns*)", timeout))
            }
            "expand-macro-full" => {
                let code = required_str(arguments, "code")?;
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(macroexpand '{code})");
                Ok(self.evaluate(&form, timeout))
            }
            "expand-macro-once" => {
                let code = required_str(arguments, "code")?;
                let timeout = timeout_from(arguments, QUERY_TIMEOUT_MS)?;
                let form = format!("(macroexpand-1 '{code})");
                Ok(self.evaluate(&form, timeout))
            }
            "restart-backend" => Ok(self.restart()),
            other => Err(ToolError::UnknownTool {
                name: other.to_owned(),
            }),
        }
    }

    fn backend_port(&self) -> Option<u16> {
        match &self.mode {
            Mode::External { port } => Some(*port),
            Mode::Embedded { backend } => backend.port(),
        }
    }

    fn evaluate(&mut self, code: &str, timeout: Duration) -> ToolResult {
        let Some(port) = self.backend_port() else {
            return ToolResult::fault("embedded backend is not running; call restart-backend");
        };
        match self.exchange(port, code, timeout) {
            Ok(outcome) => render_outcome(&outcome),
            Err(error) => {
                // A broken transport or timed-out evaluation may leave stray
                // frames queued on the socket, so force a fresh handshake on
                // the next call.
                self.sessions.invalidate();
                warn!(target: TARGET, error = %error, "backend exchange failed");
                ToolResult::fault(describe_failure(&error))
            }
        }
    }

    fn exchange(
        &mut self,
        port: u16,
        code: &str,
        timeout: Duration,
    ) -> Result<Outcome, ClientError> {
        let session = self.sessions.ensure_session(port)?;
        let request = session.eval_request(code);
        run_operation(session, &request, timeout)
    }

    fn restart(&mut self) -> ToolResult {
        match &mut self.mode {
            Mode::External { .. } => ToolResult::fault(
                "restart-backend is only available when the backend is embedded; \
                 restart the external process manually and call evaluate-code again",
            ),
            Mode::Embedded { backend } => match backend.restart() {
                Ok(port) => {
                    self.sessions.invalidate();
                    ToolResult::text(format!("backend restarted; listening on port {port}"))
                }
                Err(error) => ToolResult::fault(format!("restart failed: {error}")),
            },
        }
    }

    /// Port the bridge currently targets, for diagnostics.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.backend_port()
    }

    /// Reports whether the backend runs inside this process.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        matches!(self.mode, Mode::Embedded { .. })
    }
}

fn describe_failure(error: &ClientError) -> String {
    match error {
        ClientError::Timeout { waited } => format!(
            "evaluation timed out after {} ms; the form may still be running. \
             Consider restart-backend if the session is wedged",
            waited.as_millis()
        ),
        other => format!("backend exchange failed: {other}"),
    }
}

/// Folds reply channels into ordered text segments.
///
/// Empty channels are omitted; a reply with no content at all renders the
/// placeholder `nil` so the caller always receives one segment.
fn render_outcome(outcome: &Outcome) -> ToolResult {
    let mut segments = Vec::new();
    if !outcome.output.is_empty() {
        segments.push(outcome.output.clone());
    }
    if !outcome.error_text.is_empty() {
        segments.push(outcome.error_text.clone());
    }
    if !outcome.values.is_empty() {
        segments.push(outcome.values.join("\n"));
    }
    if segments.is_empty() {
        segments.push("nil".to_owned());
    }
    ToolResult {
        segments,
        is_error: !outcome.error_text.is_empty(),
    }
}

fn required_str<'a>(arguments: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    match arguments.get(name).and_then(Value::as_str) {
        Some(text) if !text.is_empty() => Ok(text),
        Some(_) => Err(ToolError::argument(format!(
            "argument {name} must not be empty"
        ))),
        None => Err(ToolError::argument(format!(
            "missing required string argument: {name}"
        ))),
    }
}

fn required_symbol<'a>(arguments: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    let value = arguments
        .get(name)
        .ok_or_else(|| ToolError::argument(format!("missing required argument: {name}")))?;
    as_symbol(value, name)
}

fn as_symbol<'a>(value: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    let text = value
        .as_str()
        .ok_or_else(|| ToolError::argument(format!("argument {name} must be a string")))?;
    validate_symbol(text)
        .map_err(|reason| ToolError::argument(format!("argument {name} {reason}")))
}

fn timeout_from(arguments: &Value, default_ms: u64) -> Result<Duration, ToolError> {
    let millis = match arguments.get("timeout-ms") {
        None | Some(Value::Null) => default_ms,
        Some(value) => value.as_u64().ok_or_else(|| {
            ToolError::argument("timeout-ms must be a positive integer of milliseconds")
        })?,
    };
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&millis) {
        return Err(ToolError::argument(format!(
            "timeout-ms must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}, got {millis}"
        )));
    }
    Ok(Duration::from_millis(millis))
}

/// Renders `text` as a code string literal, escaping quotes and backslashes.
#[must_use]
pub fn quote_string(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// Checks that `text` is safe to splice into a form as a bare symbol.
///
/// # Errors
///
/// Returns a short reason when `text` is empty or contains characters that
/// would change the shape of the surrounding form.
pub fn validate_symbol(text: &str) -> Result<&str, &'static str> {
    if text.is_empty() {
        return Err("must not be empty");
    }
    let acceptable = |ch: char| {
        ch.is_alphanumeric() || matches!(ch, '*' | '+' | '!' | '-' | '_' | '?' | '<' | '>' | '=' | '.' | '/' | '\'')
    };
    if text.chars().all(acceptable) {
        Ok(text)
    } else {
        Err("must be a plain symbol without whitespace, quotes, or brackets")
    }
}

/// Tool descriptors for `tools/list`.
#[must_use]
pub fn definitions() -> Vec<Value> {
    fn schema(properties: Value, required: &[&str]) -> Value {
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
    let timeout = json!({
        "type": "integer",
        "description": "Timeout in milliseconds (200 to 600000)",
    });

    vec![
        json!({
            "name": "evaluate-code",
            "description": "Evaluate a code form in the current session and return printed \
                            output and result values",
            "inputSchema": schema(
                json!({
                    "code": {"type": "string", "description": "Code to evaluate"},
                    "timeout-ms": timeout,
                }),
                &["code"],
            ),
        }),
        json!({
            "name": "load-file",
            "description": "Load and evaluate a source file by path on the backend host. \
                            Use this instead of evaluate-code for large sources",
            "inputSchema": schema(
                json!({
                    "file-path": {"type": "string", "description": "Path to the source file"},
                    "timeout-ms": timeout,
                }),
                &["file-path"],
            ),
        }),
        json!({
            "name": "set-namespace",
            "description": "Switch the session to the named namespace, creating it if needed",
            "inputSchema": schema(
                json!({
                    "namespace": {"type": "string", "description": "Namespace name"},
                    "timeout-ms": timeout,
                }),
                &["namespace"],
            ),
        }),
        json!({
            "name": "search-symbols",
            "description": "Find public vars whose names contain the query string",
            "inputSchema": schema(
                json!({
                    "query": {"type": "string", "description": "Substring to search for"},
                    "timeout-ms": timeout,
                }),
                &["query"],
            ),
        }),
        json!({
            "name": "get-doc",
            "description": "Show the documentation for a var",
            "inputSchema": schema(
                json!({
                    "symbol": {"type": "string", "description": "Fully qualified or bare symbol"},
                    "timeout-ms": timeout,
                }),
                &["symbol"],
            ),
        }),
        json!({
            "name": "get-source",
            "description": "Show the source text of a var",
            "inputSchema": schema(
                json!({
                    "symbol": {"type": "string", "description": "Fully qualified or bare symbol"},
                    "timeout-ms": timeout,
                }),
                &["symbol"],
            ),
        }),
        json!({
            "name": "list-vars",
            "description": "List the public vars in a namespace (defaults to user)",
            "inputSchema": schema(
                json!({
                    "namespace": {"type": "string", "description": "Namespace to list"},
                    "timeout-ms": timeout,
                }),
                &[],
            ),
        }),
        json!({
            "name": "list-namespaces",
            "description": "List all loaded namespaces",
            "inputSchema": schema(json!({"timeout-ms": timeout}), &[]),
        }),
        json!({
            "name": "current-namespace",
            "description": "Report the namespace the session is currently in",
            "inputSchema": schema(json!({"timeout-ms": timeout}), &[]),
        }),
        json!({
            "name": "expand-macro-full",
            "description": "Repeatedly macroexpand a form until it stops changing",
            "inputSchema": schema(
                json!({
                    "code": {"type": "string", "description": "Form to expand"},
                    "timeout-ms": timeout,
                }),
                &["code"],
            ),
        }),
        json!({
            "name": "expand-macro-once",
            "description": "Macroexpand a form a single step",
            "inputSchema": schema(
                json!({
                    "code": {"type": "string", "description": "Form to expand"},
                    "timeout-ms": timeout,
                }),
                &["code"],
            ),
        }),
        json!({
            "name": "restart-backend",
            "description": "Restart the embedded backend, discarding the wedged listener \
                            while keeping defined vars",
            "inputSchema": schema(json!({}), &[]),
        }),
    ]
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("hello", "\"hello\"")]
    #[case("say \"hi\"", "\"say \\\"hi\\\"\"")]
    #[case("a\\b", "\"a\\\\b\"")]
    #[case("line\nbreak", "\"line\\nbreak\"")]
    fn quoting_escapes_metacharacters(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(quote_string(input), expected);
    }

    #[rstest]
    #[case("map")]
    #[case("clojure.core/map")]
    #[case("my-ns.core")]
    #[case("conj!")]
    #[case("<=")]
    fn plain_symbols_pass_validation(#[case] symbol: &str) {
        assert!(validate_symbol(symbol).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("two words")]
    #[case("(rm -rf)")]
    #[case("a\"b")]
    fn unsafe_symbols_are_rejected(#[case] symbol: &str) {
        assert!(validate_symbol(symbol).is_err());
    }

    #[rstest]
    fn timeout_below_floor_is_rejected_without_backend_contact() {
        // Port 1 is never dialled; an out-of-range timeout fails first.
        let mut bridge = Bridge::external(1);
        let result = bridge.call("evaluate-code", &json!({"code": "(+ 1 2)", "timeout-ms": 5}));
        assert!(matches!(result, Err(ToolError::InvalidArgument { .. })));
    }

    #[rstest]
    fn timeout_above_ceiling_is_rejected() {
        let mut bridge = Bridge::external(1);
        let result = bridge.call(
            "evaluate-code",
            &json!({"code": "(+ 1 2)", "timeout-ms": 600_001}),
        );
        assert!(matches!(result, Err(ToolError::InvalidArgument { .. })));
    }

    #[rstest]
    fn unknown_tool_is_reported_by_name() {
        let mut bridge = Bridge::external(1);
        let error = bridge
            .call("frobnicate", &json!({}))
            .expect_err("tool should be unknown");
        assert_eq!(
            error,
            ToolError::UnknownTool {
                name: "frobnicate".to_owned()
            }
        );
    }

    #[rstest]
    fn missing_code_argument_is_invalid() {
        let mut bridge = Bridge::external(1);
        let error = bridge
            .call("evaluate-code", &json!({}))
            .expect_err("missing argument");
        assert!(matches!(error, ToolError::InvalidArgument { .. }));
    }

    #[rstest]
    #[case("evaluate-code", "code")]
    #[case("load-file", "file-path")]
    #[case("search-symbols", "query")]
    fn empty_required_string_is_rejected_without_backend_contact(
        #[case] tool: &str,
        #[case] argument: &str,
    ) {
        // Port 1 is never dialled; the empty argument fails first.
        let mut bridge = Bridge::external(1);
        let error = bridge
            .call(tool, &json!({argument: ""}))
            .expect_err("empty argument");
        assert!(matches!(error, ToolError::InvalidArgument { .. }));
        assert!(error.to_string().contains(argument));
    }

    #[rstest]
    fn restart_on_external_backend_is_a_tool_fault() {
        let mut bridge = Bridge::external(1);
        let result = bridge
            .call("restart-backend", &json!({}))
            .expect("dispatch succeeds");
        assert!(result.is_error);
        assert!(result.segments[0].contains("embedded"));
    }

    #[rstest]
    fn render_folds_channels_in_order() {
        let outcome = Outcome {
            output: "printed".to_owned(),
            error_text: String::new(),
            values: vec!["6".to_owned(), "7".to_owned()],
        };
        let result = render_outcome(&outcome);
        assert_eq!(result.segments, vec!["printed".to_owned(), "6\n7".to_owned()]);
        assert!(!result.is_error);
    }

    #[rstest]
    fn render_flags_eval_faults() {
        let outcome = Outcome {
            output: String::new(),
            error_text: "Divide by zero".to_owned(),
            values: Vec::new(),
        };
        let result = render_outcome(&outcome);
        assert!(result.is_error);
        assert_eq!(result.segments, vec!["Divide by zero".to_owned()]);
    }

    #[rstest]
    fn render_substitutes_nil_for_silence() {
        let outcome = Outcome {
            output: String::new(),
            error_text: String::new(),
            values: Vec::new(),
        };
        let result = render_outcome(&outcome);
        assert_eq!(result.segments, vec!["nil".to_owned()]);
        assert!(!result.is_error);
    }

    #[rstest]
    fn tool_result_serialises_to_content_blocks() {
        let result = ToolResult {
            segments: vec!["6".to_owned()],
            is_error: false,
        };
        assert_eq!(
            result.into_json(),
            json!({"content": [{"type": "text", "text": "6"}], "isError": false})
        );
    }

    #[rstest]
    fn definitions_cover_the_full_surface() {
        let names: Vec<String> = definitions()
            .iter()
            .map(|tool| tool["name"].as_str().expect("name").to_owned())
            .collect();
        assert_eq!(names.len(), 12);
        for expected in [
            "evaluate-code",
            "load-file",
            "set-namespace",
            "search-symbols",
            "get-doc",
            "get-source",
            "list-vars",
            "list-namespaces",
            "current-namespace",
            "expand-macro-full",
            "expand-macro-once",
            "restart-backend",
        ] {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
    }

    /// A backend that accepts a handshake then answers one eval with a value.
    fn scripted_backend() -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut scratch = [0_u8; 512];
            let _ = stream.read(&mut scratch).expect("clone request");
            stream
                .write_all(
                    b"d2:id1:111:new-session8:tok-00017:session8:tok-00016:statusl4:doneee",
                )
                .expect("handshake reply");
            let _ = stream.read(&mut scratch).expect("eval request");
            stream
                .write_all(
                    b"d2:ns4:user7:session8:tok-00015:value1:6ed7:session8:tok-00016:statusl4:doneee",
                )
                .expect("eval reply");
            // Hold the socket so the client sees clean frames, not EOF.
            let _ = stream.read(&mut scratch);
        });
        (port, handle)
    }

    #[rstest]
    fn evaluate_code_returns_the_value_channel() {
        let (port, handle) = scripted_backend();
        let mut bridge = Bridge::external(port);
        let result = bridge
            .call("evaluate-code", &json!({"code": "(+ 1 2 3)"}))
            .expect("dispatch succeeds");
        assert!(!result.is_error);
        assert_eq!(result.segments, vec!["6".to_owned()]);
        drop(bridge);
        handle.join().expect("stub exits");
    }

    #[rstest]
    fn unreachable_backend_is_a_tool_fault_not_a_protocol_error() {
        // Port 1 refuses connections immediately on loopback.
        let mut bridge = Bridge::external(1);
        let result = bridge
            .call("evaluate-code", &json!({"code": "(+ 1 2)"}))
            .expect("dispatch succeeds");
        assert!(result.is_error);
        assert!(result.segments[0].contains("backend exchange failed"));
    }
}
