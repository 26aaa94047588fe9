//! The JSON-compatible document carried as `serializedInput`/`serializedOutput`
//! inside a [`crate::protocol`] envelope.
//!
//! Three shapes share one `method` field: a request carries `args`, a
//! successful reply carries `data`, a failed reply carries `status`. The
//! codec is otherwise transparent to whatever JSON the caller puts inside
//! `args`/`data` — including nested localized-string objects, which this
//! module models as [`LocalizedString`] but never has to interpret.

use flotilla_core::error::ReplyStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `{code, template, params}` shaped value used for i18n-able error and
/// progress text. Opaque to the broker and worker runtime; it just has to
/// round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedString {
    pub code: String,
    pub template: String,
    #[serde(default)]
    pub params: Value,
}

/// `{code, message}` payload attached to a failed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub code: ReplyStatus,
    pub message: String,
}

impl StatusPayload {
    #[must_use]
    pub fn new(code: ReplyStatus, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The body of a client -> worker request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// The body of a worker -> broker -> client reply.
///
/// `#[serde(untagged)]` lets a single wire shape carry either a
/// successful `data` payload or a failed `status` payload, matching the
/// specification's `{method, data}` / `{method, status}` union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Ok { method: String, data: Value },
    Err { method: String, status: StatusPayload },
}

impl ReplyBody {
    #[must_use]
    pub fn ok(method: impl Into<String>, data: Value) -> Self {
        Self::Ok {
            method: method.into(),
            data,
        }
    }

    #[must_use]
    pub fn err(method: impl Into<String>, status: StatusPayload) -> Self {
        Self::Err {
            method: method.into(),
            status,
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Ok { method, .. } | Self::Err { method, .. } => method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let body = RequestBody {
            method: "echo.echoSync".into(),
            args: serde_json::json!({"str": "blahblah"}),
        };
        let encoded = serde_json::to_vec(&body).unwrap();
        let decoded: RequestBody = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.method, body.method);
        assert_eq!(decoded.args, body.args);
    }

    #[test]
    fn reply_ok_round_trips() {
        let body = ReplyBody::ok("echo.echoSync", serde_json::json!("blahblah"));
        let encoded = serde_json::to_vec(&body).unwrap();
        let decoded: ReplyBody = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.method(), "echo.echoSync");
        assert!(matches!(decoded, ReplyBody::Ok { .. }));
    }

    #[test]
    fn reply_err_preserves_localized_payload() {
        let localized = LocalizedString {
            code: "BADARG".into(),
            template: "field {field} is invalid".into(),
            params: serde_json::json!({"field": "str"}),
        };
        let body = ReplyBody::err(
            "echo.echoSync",
            StatusPayload::new(
                ReplyStatus::BadArg,
                serde_json::to_string(&localized).unwrap(),
            ),
        );
        let encoded = serde_json::to_vec(&body).unwrap();
        let decoded: ReplyBody = serde_json::from_slice(&encoded).unwrap();
        let ReplyBody::Err { status, .. } = decoded else {
            panic!("expected Err variant");
        };
        let round_tripped: LocalizedString = serde_json::from_str(&status.message).unwrap();
        assert_eq!(round_tripped, localized);
    }
}
