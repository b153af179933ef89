//! Prompt catalogue for `prompts/list` and `prompts/get`.

use serde_json::{Value, json};

const REPL_SESSION: &str = "repl-session";

const REPL_SESSION_TEXT: &str = "\
You are connected to a live evaluation session. Work incrementally: \
evaluate small forms with evaluate-code and inspect the results before \
building on them. Use load-file for sources too large to inline, get-doc \
and get-source to inspect unfamiliar vars, and set-namespace to move \
between namespaces. Definitions persist across calls within the session. \
If an evaluation wedges the session, call restart-backend; defined vars \
survive the restart.";

/// Describes the available prompts.
#[must_use]
pub fn list() -> Value {
    json!([{
        "name": REPL_SESSION,
        "description": "Guidance for working against the live evaluation session",
    }])
}

/// Expands a named prompt into its message list.
///
/// # Errors
///
/// Returns the unknown name when no such prompt exists.
pub fn get(name: &str) -> Result<Value, String> {
    if name == REPL_SESSION {
        Ok(json!({
            "description": "Guidance for working against the live evaluation session",
            "messages": [{
                "role": "user",
                "content": {"type": "text", "text": REPL_SESSION_TEXT},
            }],
        }))
    } else {
        Err(format!("unknown prompt: {name}"))
    }
}
