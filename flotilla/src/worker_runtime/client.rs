//! Cross-worker calls (spec §4.5 "Cross-worker calls"): a worker may
//! originate an ordinary client request of its own against the broker.
//!
//! From the broker's point of view this is indistinguishable from any
//! other client connection. The risk this module documents rather than
//! solves: a handler that holds a key-set lock and blocks on a nested
//! cross-call to a worker that itself needs those keys will deadlock. The
//! runtime does not detect this; it is a documented hazard, matching the
//! specification's own framing ("implementers must document that...").

use bytes::Bytes;
use flotilla_wire::payload::{ReplyBody, RequestBody};
use serde_json::Value;

use flotilla_core::error::{FlotillaError, ReplyStatus};

/// A pending outbound call this worker made to another worker via the
/// broker, keyed by the request id the broker assigned.
pub struct OutboundCall {
    pub method: String,
    pub reply_tx: flume::Sender<Result<Value, FlotillaError>>,
}

/// Encode an outbound cross-worker request body.
#[must_use]
pub fn encode_call(method: &str, args: Value) -> Bytes {
    let body = RequestBody {
        method: method.to_string(),
        args,
    };
    Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
}

/// Decode a reply to an outbound cross-worker call, resolving it to the
/// sink the caller is awaiting on.
pub fn resolve_call(output: &[u8], reply_tx: &flume::Sender<Result<Value, FlotillaError>>) {
    let result = match serde_json::from_slice::<ReplyBody>(output) {
        Ok(ReplyBody::Ok { data, .. }) => Ok(data),
        Ok(ReplyBody::Err { status, .. }) => Err(FlotillaError::reply(status.code, status.message)),
        Err(e) => Err(FlotillaError::reply(ReplyStatus::Internal, e.to_string())),
    };
    let _ = reply_tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_call_round_trips_through_request_body() {
        let body = encode_call("otherWorker.method", serde_json::json!({"x": 1}));
        let decoded: RequestBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded.method, "otherWorker.method");
        assert_eq!(decoded.args, serde_json::json!({"x": 1}));
    }

    #[test]
    fn resolve_call_delivers_ok() {
        let (tx, rx) = flume::unbounded();
        let reply = ReplyBody::ok("m", serde_json::json!(42));
        resolve_call(&serde_json::to_vec(&reply).unwrap(), &tx);
        assert_eq!(rx.try_recv().unwrap().unwrap(), serde_json::json!(42));
    }

    #[test]
    fn resolve_call_delivers_err() {
        use flotilla_core::error::ReplyStatus;
        use flotilla_wire::payload::StatusPayload;

        let (tx, rx) = flume::unbounded();
        let reply = ReplyBody::err("m", StatusPayload::new(ReplyStatus::NoSuch, "gone".into()));
        resolve_call(&serde_json::to_vec(&reply).unwrap(), &tx);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.reply_status(), Some(ReplyStatus::NoSuch));
    }
}
