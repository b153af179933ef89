//! Resource catalogue for `resources/list` and `resources/read`.

use serde_json::{Value, json};

use crate::tools::Bridge;

const BACKEND_INFO: &str = "banter://backend-info";

/// Describes the available resources.
#[must_use]
pub fn list() -> Value {
    json!([{
        "uri": BACKEND_INFO,
        "name": "Backend connection info",
        "description": "Current backend mode and port",
        "mimeType": "application/json",
    }])
}

/// Reads a resource by URI.
///
/// # Errors
///
/// Returns the unknown URI when no such resource exists.
pub fn read(uri: &str, bridge: &Bridge) -> Result<Value, String> {
    if uri == BACKEND_INFO {
        let info = json!({
            "mode": if bridge.is_embedded() { "embedded" } else { "external" },
            "port": bridge.port(),
        });
        Ok(json!({
            "contents": [{
                "uri": BACKEND_INFO,
                "mimeType": "application/json",
                "text": info.to_string(),
            }],
        }))
    } else {
        Err(format!("unknown resource: {uri}"))
    }
}
