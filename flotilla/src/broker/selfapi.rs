//! Broker self-API (C4): a synthetic worker named `broker` exposing
//! introspection methods over the same protocol as any other worker.

use super::worker::{WorkerConnection, WorkerStats};
use flotilla_core::error::{FlotillaError, ReplyStatus};
use serde::Serialize;
use serde_json::Value;

/// `getProto`'s self-description payload.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerProto {
    pub name: &'static str,
    pub version: &'static str,
    /// Wire protocol command bytes, so a client library can self-check
    /// compatibility without a side-channel.
    pub protocol: ProtocolDescription,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolDescription {
    pub c_client: u8,
    pub w_worker: u8,
    pub w_ready: u8,
    pub w_request: u8,
    pub w_reply: u8,
    pub w_heartbeat: u8,
    pub w_disconnect: u8,
}

impl Default for BrokerProto {
    fn default() -> Self {
        Self {
            name: "flotilla-broker",
            version: env!("CARGO_PKG_VERSION"),
            protocol: ProtocolDescription {
                c_client: flotilla_wire::protocol::C_CLIENT,
                w_worker: flotilla_wire::protocol::W_WORKER,
                w_ready: flotilla_wire::protocol::W_READY,
                w_request: flotilla_wire::protocol::W_REQUEST,
                w_reply: flotilla_wire::protocol::W_REPLY,
                w_heartbeat: flotilla_wire::protocol::W_HEARTBEAT,
                w_disconnect: flotilla_wire::protocol::W_DISCONNECT,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatSnapshot {
    pub name: String,
    pub connected: bool,
    pub liveness: i32,
    pub requests: u64,
    pub replies: u64,
    pub protocol_errors: u64,
}

impl WorkerStatSnapshot {
    #[must_use]
    pub fn of(name: &str, w: &WorkerConnection) -> Self {
        let WorkerStats {
            requests,
            replies,
            protocol_errors,
            ..
        } = w.stats;
        Self {
            name: name.to_string(),
            connected: w.is_connected(),
            liveness: w.liveness,
            requests,
            replies,
            protocol_errors,
        }
    }
}

/// Dispatch one self-API method by name.
///
/// `workers` is the broker's current worker table, used to serve
/// `getWorkers`/`getStats`. `updateWorkers` is handled by the caller
/// (broker core), since it mutates the worker table rather than reading
/// it.
///
/// # Errors
///
/// Returns [`FlotillaError::Reply`] with [`ReplyStatus::Unimpl`] for an
/// unrecognized method name.
pub fn dispatch(
    method: &str,
    _args: &Value,
    workers: &hashbrown::HashMap<String, WorkerConnection>,
) -> Result<Value, FlotillaError> {
    match method {
        "getTime" => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            Ok(serde_json::json!(now.as_millis() as u64))
        }
        "getWorkers" => {
            let names: Vec<&str> = workers.keys().map(String::as_str).collect();
            Ok(serde_json::json!(names))
        }
        "getStats" => {
            let stats: Vec<WorkerStatSnapshot> = workers
                .iter()
                .map(|(name, w)| WorkerStatSnapshot::of(name, w))
                .collect();
            Ok(serde_json::to_value(stats)?)
        }
        "getProto" => Ok(serde_json::to_value(BrokerProto::default())?),
        "ping" => Ok(Value::Bool(true)),
        other => Err(FlotillaError::reply(
            ReplyStatus::Unimpl,
            format!("broker has no self-API method {other:?}"),
        )),
    }
}
