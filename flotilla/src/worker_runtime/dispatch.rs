//! Dispatch contract (C5, the five numbered steps of spec §4.5): decode,
//! validate, acquire locks (or queue), run with timeout and cooperative
//! cancellation, validate output, release locks and wake waiters.

use bytes::Bytes;
use hashbrown::HashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

use flotilla_core::error::{FlotillaError, ReplyStatus};
use flotilla_wire::payload::{ReplyBody, RequestBody, StatusPayload};

use super::locks::{AcquireOutcome, LockTable, RequestToken};
use super::methods::{CancelToken, HandlerContext, MethodTable, Progress};

/// A queued request waiting on its lock-set.
struct Waiting {
    request_id: Bytes,
    method: String,
    args: Value,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

/// Per-worker dispatcher: owns the lock table and the set of in-flight
/// requests. Transport-agnostic — the caller feeds it decoded
/// `(requestId, input)` pairs and receives encoded reply bytes back.
pub struct Dispatcher {
    methods: MethodTable,
    locks: LockTable,
    next_token: RequestToken,
    waiting: HashMap<RequestToken, Waiting>,
    /// request id -> cancel token, so a timeout sweep can flag the right
    /// in-flight (running or still-queued) request.
    in_flight_cancel: HashMap<Bytes, CancelToken>,
    /// request id -> (dispatch time, timeout, method name), for the
    /// timeout sweep's `TIMEDOUT` reply.
    deadlines: HashMap<Bytes, (Instant, Duration, String)>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(methods: MethodTable) -> Self {
        Self {
            methods,
            locks: LockTable::new(),
            next_token: 0,
            waiting: HashMap::new(),
            in_flight_cancel: HashMap::new(),
            deadlines: HashMap::new(),
        }
    }

    fn alloc_token(&mut self) -> RequestToken {
        let t = self.next_token;
        self.next_token += 1;
        t
    }

    /// Step 1-2: decode and validate the request, then attempt to acquire
    /// its lock-set. Returns `Some(ready)` with everything needed to run
    /// the handler now, or `None` if the request was queued (it will be
    /// returned later by [`Self::release`]).
    pub fn accept(
        &mut self,
        request_id: Bytes,
        input: &[u8],
    ) -> Result<Option<ReadyRequest>, Bytes> {
        let request: RequestBody = match serde_json::from_slice(input) {
            Ok(r) => r,
            Err(e) => return Err(encode_error("", ReplyStatus::BadArg, e.to_string())),
        };

        let Some(spec) = self.methods.get(&request.method) else {
            return Err(encode_error(&request.method, ReplyStatus::Unimpl, "no such method".into()));
        };

        if let Err(e) = spec.validate_args(&request.args) {
            let status = e.reply_status().unwrap_or(ReplyStatus::BadArg);
            return Err(encode_error(&request.method, status, e.to_string()));
        }

        let timeout = request
            .args
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .or(spec.default_timeout);

        let cancel = CancelToken::new();
        let dispatched_at = Instant::now();
        self.in_flight_cancel.insert(request_id.clone(), cancel.clone());
        if let Some(d) = timeout {
            self.deadlines.insert(request_id.clone(), (dispatched_at, d, request.method.clone()));
        }

        let token = self.alloc_token();
        let outcome = self.locks.acquire(token, spec.lock_keys.clone());

        match outcome {
            AcquireOutcome::Acquired => Ok(Some(ReadyRequest {
                token,
                request_id,
                method: request.method,
                args: request.args,
                cancel,
                dispatched_at,
            })),
            AcquireOutcome::Queued => {
                self.waiting.insert(
                    token,
                    Waiting {
                        request_id,
                        method: request.method,
                        args: request.args,
                        timeout,
                        cancel,
                    },
                );
                Ok(None)
            }
        }
    }

    /// Step 5: a running request finished (or was timed out/cancelled
    /// before running). Release its locks and return whichever queued
    /// requests are now ready to run.
    pub fn release(&mut self, token: RequestToken, request_id: &Bytes) -> Vec<ReadyRequest> {
        self.in_flight_cancel.remove(request_id);
        self.deadlines.remove(request_id);
        let woken = self.locks.release(token);
        woken
            .into_iter()
            .filter_map(|t| {
                let w = self.waiting.remove(&t)?;
                let dispatched_at = Instant::now();
                self.in_flight_cancel.insert(w.request_id.clone(), w.cancel.clone());
                if let Some(d) = w.timeout {
                    self.deadlines
                        .insert(w.request_id.clone(), (dispatched_at, d, w.method.clone()));
                }
                Some(ReadyRequest {
                    token: t,
                    request_id: w.request_id,
                    method: w.method,
                    args: w.args,
                    cancel: w.cancel,
                    dispatched_at,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&super::methods::MethodSpec> {
        self.methods.get(name)
    }

    /// Timeout sweep: cancel (and report) any request whose deadline has
    /// passed, whether it is currently running or still queued on a lock.
    /// Returns the `(request id, method)` pairs so the caller can encode
    /// each one's `TIMEDOUT` reply.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<(Bytes, String)> {
        let expired: Vec<(Bytes, String)> = self
            .deadlines
            .iter()
            .filter_map(|(id, (start, d, method))| {
                (now.duration_since(*start) >= *d).then(|| (id.clone(), method.clone()))
            })
            .collect();
        for (id, _) in &expired {
            if let Some(cancel) = self.in_flight_cancel.get(id) {
                cancel.cancel();
            }
            self.deadlines.remove(id);
        }
        expired
    }
}

/// A request cleared to run: locks held, ready for the executor to invoke
/// its handler.
pub struct ReadyRequest {
    pub token: RequestToken,
    pub request_id: Bytes,
    pub method: String,
    pub args: Value,
    pub cancel: CancelToken,
    pub dispatched_at: Instant,
}

impl ReadyRequest {
    #[must_use]
    pub fn context(&self, progress_tx: flume::Sender<Progress>) -> HandlerContext {
        HandlerContext {
            args: self.args.clone(),
            progress_tx,
            cancel: self.cancel.clone(),
            dispatched_at: self.dispatched_at,
        }
    }
}

/// Step 3-4 finalization: turn a handler's result (or a timeout/cancel) into
/// wire bytes, honoring output-validation-enabled vs disabled per spec
/// step 4.
#[must_use]
pub fn finalize_reply(
    method: &str,
    result: Result<Value, FlotillaError>,
    cancelled: bool,
    validate_output: Option<&(dyn Fn(&Value) -> bool + Send + Sync)>,
    output_validation_enabled: bool,
) -> Option<Bytes> {
    if cancelled {
        // The client already received TIMEDOUT from the dispatch sweep;
        // the late output is discarded per spec §4.5 step 3.
        return None;
    }

    match result {
        Ok(data) => {
            if let Some(validate) = validate_output {
                if !validate(&data) {
                    let status = if output_validation_enabled {
                        ReplyStatus::Invalid
                    } else {
                        ReplyStatus::Internal
                    };
                    return Some(encode_error(method, status, "output failed schema validation".into()));
                }
            }
            Some(encode_ok(method, data))
        }
        Err(e) => {
            let status = e.reply_status().unwrap_or(ReplyStatus::Internal);
            Some(encode_error(method, status, e.to_string()))
        }
    }
}

#[must_use]
pub fn encode_timeout(method: &str) -> Bytes {
    encode_error(method, ReplyStatus::TimedOut, format!("{method} timed out"))
}

fn encode_ok(method: &str, data: Value) -> Bytes {
    Bytes::from(serde_json::to_vec(&ReplyBody::ok(method, data)).unwrap_or_default())
}

fn encode_error(method: &str, status: ReplyStatus, message: String) -> Bytes {
    let reply = ReplyBody::err(method, StatusPayload::new(status, message));
    Bytes::from(serde_json::to_vec(&reply).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_runtime::methods::{accept_any, MethodSpec};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl super::super::methods::Handler for Echo {
        async fn call(&self, ctx: HandlerContext) -> Result<Value, FlotillaError> {
            Ok(ctx.args)
        }
    }

    fn table_with_echo(lock_keys: &[&str]) -> MethodTable {
        let mut t = MethodTable::new();
        t.register(MethodSpec {
            name: "echoSync".into(),
            lock_keys: lock_keys.iter().map(|s| s.to_string()).collect(),
            is_async: false,
            default_timeout: None,
            validate_input: Box::new(accept_any),
            validate_output: Box::new(accept_any),
            handler: std::sync::Arc::new(Echo),
        });
        t
    }

    #[test]
    fn bad_json_input_is_badarg() {
        let mut d = Dispatcher::new(table_with_echo(&[]));
        let err = d.accept(Bytes::from_static(b"rid-1"), b"not json").unwrap_err();
        let reply: ReplyBody = serde_json::from_slice(&err).unwrap();
        match reply {
            ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::BadArg),
            ReplyBody::Ok { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn unknown_method_is_unimpl() {
        let mut d = Dispatcher::new(table_with_echo(&[]));
        let body = serde_json::to_vec(&RequestBody {
            method: "nope".into(),
            args: Value::Null,
        })
        .unwrap();
        let err = d.accept(Bytes::from_static(b"rid-1"), &body).unwrap_err();
        let reply: ReplyBody = serde_json::from_slice(&err).unwrap();
        match reply {
            ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::Unimpl),
            ReplyBody::Ok { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn lock_conflict_queues_then_release_wakes() {
        let mut d = Dispatcher::new(table_with_echo(&["a"]));
        let body = serde_json::to_vec(&RequestBody {
            method: "echoSync".into(),
            args: Value::Null,
        })
        .unwrap();

        let r1 = d.accept(Bytes::from_static(b"rid-1"), &body).unwrap();
        assert!(r1.is_some());
        let r2 = d.accept(Bytes::from_static(b"rid-2"), &body).unwrap();
        assert!(r2.is_none()); // queued behind rid-1 on key "a"

        let token1 = r1.unwrap().token;
        let woken = d.release(token1, &Bytes::from_static(b"rid-1"));
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].request_id, Bytes::from_static(b"rid-2"));
    }

    #[test]
    fn finalize_reply_discards_cancelled_output() {
        // A request that was cancelled by the timeout sweep must produce no
        // reply at all: the client already got TIMEDOUT, and a late
        // success must not overwrite it on the wire.
        let reply = finalize_reply("echoAsync", Ok(Value::String("late".into())), true, None, true);
        assert!(reply.is_none());
    }

    #[test]
    fn finalize_reply_rejects_bad_output_as_invalid_when_enforced() {
        let validate: Box<dyn Fn(&Value) -> bool + Send + Sync> = Box::new(|v: &Value| v.is_string());
        let reply = finalize_reply("echoSync", Ok(Value::Bool(true)), false, Some(&*validate), true).unwrap();
        let decoded: ReplyBody = serde_json::from_slice(&reply).unwrap();
        match decoded {
            ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::Invalid),
            ReplyBody::Ok { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn finalize_reply_downgrades_bad_output_to_internal_when_not_enforced() {
        let validate: Box<dyn Fn(&Value) -> bool + Send + Sync> = Box::new(|v: &Value| v.is_string());
        let reply = finalize_reply("echoSync", Ok(Value::Bool(true)), false, Some(&*validate), false).unwrap();
        let decoded: ReplyBody = serde_json::from_slice(&reply).unwrap();
        match decoded {
            ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::Internal),
            ReplyBody::Ok { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn sweep_timeouts_cancels_expired() {
        let mut d = Dispatcher::new(table_with_echo(&[]));
        let body = serde_json::to_vec(&RequestBody {
            method: "echoSync".into(),
            args: serde_json::json!({"timeout": 0}),
        })
        .unwrap();
        let ready = d.accept(Bytes::from_static(b"rid-1"), &body).unwrap().unwrap();
        assert!(!ready.cancel.is_cancelled());
        std::thread::sleep(Duration::from_millis(5));
        let expired = d.sweep_timeouts(Instant::now());
        assert_eq!(expired, vec![(Bytes::from_static(b"rid-1"), "echoSync".to_string())]);
        assert!(ready.cancel.is_cancelled());
    }
}
