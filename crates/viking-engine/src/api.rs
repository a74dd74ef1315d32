//! Response envelope shared with the HTTP collaborator.
//!
//! Every public operation maps onto `{status: "ok", result, time_ms}` or
//! `{status: "error", error: {code, message}}`.

use serde_json::{json, Value};
use viking_core::VikingError;

/// Success envelope.
pub fn ok_envelope(result: Value, time_ms: f64) -> Value {
    json!({
        "status": "ok",
        "result": result,
        "time_ms": (time_ms * 1_000.0).round() / 1_000.0,
    })
}

/// Error envelope carrying the stable taxonomy code.
pub fn error_envelope(error: &VikingError) -> Value {
    json!({
        "status": "error",
        "error": {
            "code": error.code.as_str(),
            "message": error.message,
        },
    })
}

#[cfg(test)]
mod tests {
    use viking_core::VikingError;

    use super::{error_envelope, ok_envelope};

    #[test]
    fn envelopes_have_the_stable_shape() {
        let ok = ok_envelope(serde_json::json!({"target_uri": "viking://resources/doc"}), 12.3456);
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["time_ms"], 12.346);
        assert_eq!(ok["result"]["target_uri"], "viking://resources/doc");

        let error = error_envelope(&VikingError::not_found("viking://resources/nope"));
        assert_eq!(error["status"], "error");
        assert_eq!(error["error"]["code"], "NOT_FOUND");
        assert_eq!(error["error"]["message"], "viking://resources/nope");
    }
}
