//! Broker core (C3): owns the worker table and dispatches every decoded
//! envelope to the right place. Transport-agnostic — `bin/broker.rs` wires
//! this onto `flotilla_core::router::RouterHub` for both the TCP and IPC
//! listeners.

use bytes::Bytes;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

use flotilla_core::error::ReplyStatus;
use flotilla_core::events::{Event, EventsCmd};
use flotilla_wire::payload::{ReplyBody, RequestBody, StatusPayload};
use flotilla_wire::protocol::Frame;

use super::selfapi;
use super::worker::{availability_status, HeartbeatOutcome, PendingRequest, WorkerConnection};

/// One envelope to deliver to a routing id, in the shape `RouterHub`'s
/// Standard mode expects: `(target_routing_id, frame)`.
pub type Outbound = (Bytes, Frame);

/// The broker's in-memory state: the worker table and a handle to the
/// event bus used to publish `worker_connected`/`worker_disconnected`/
/// `worker_failedHb`.
pub struct BrokerCore {
    workers: HashMap<String, WorkerConnection>,
    events_tx: flume::Sender<EventsCmd>,
    liveness_max: i32,
    protect_time: Duration,
}

impl BrokerCore {
    #[must_use]
    pub fn new(events_tx: flume::Sender<EventsCmd>, liveness_max: i32, protect_time: Duration) -> Self {
        let mut workers = HashMap::new();
        workers.insert("broker".to_string(), WorkerConnection::new_self(liveness_max));
        Self {
            workers,
            events_tx,
            liveness_max,
            protect_time,
        }
    }

    fn publish(&self, event: Event) {
        let _ = self.events_tx.send(EventsCmd::Publish(event));
    }

    /// Dispatch one decoded frame arriving from `from`, returning whatever
    /// needs to go back out over the wire.
    ///
    /// `from` is the routing id `RouterHub` observed for this peer — a
    /// client's connection id, or (once READY has been seen) the worker's
    /// connection id.
    pub fn handle_frame(&mut self, from: Bytes, frame: Frame) -> Vec<Outbound> {
        match frame {
            Frame::ClientRequest { worker_name, input } => {
                self.handle_client_request(from, &worker_name, input)
            }
            Frame::WorkerReady { worker_name, .. } => {
                self.handle_worker_ready(from, worker_name);
                Vec::new()
            }
            Frame::WorkerReply { request_id, output } => {
                self.handle_worker_reply(&from, &request_id, output)
            }
            Frame::WorkerProgress { request_id, item } => {
                self.handle_worker_progress(&from, &request_id, item)
            }
            Frame::Heartbeat => {
                self.handle_worker_heartbeat(&from);
                Vec::new()
            }
            Frame::Disconnect => {
                self.handle_worker_disconnect(&from);
                Vec::new()
            }
            Frame::ClientReply { .. } | Frame::ClientProgress { .. } | Frame::WorkerRequest { .. } => {
                // These shapes only ever flow broker -> peer; receiving one
                // is a protocol violation from a conforming client/worker.
                tracing::warn!(?from, "dropping inbound frame broker never expects to receive");
                Vec::new()
            }
        }
    }

    fn find_worker_by_name(&self, name: &str) -> Option<&WorkerConnection> {
        self.workers.get(name)
    }

    /// Sentinel request id `"abort"` requests are sent under — never
    /// recorded in `pending`, since the client is replied to immediately
    /// and any eventual worker reply bearing this id is just dropped by
    /// [`Self::handle_worker_reply`]'s unknown-request path.
    const ABORT_SENTINEL_ID: &'static [u8] = b"__abort__";

    fn handle_client_request(&mut self, client_id: Bytes, worker_name: &str, input: Bytes) -> Vec<Outbound> {
        if worker_name == "broker" {
            return self.handle_self_api_request(client_id, input);
        }

        let (method, _) = parse_method_and_timeout(&input);
        if method == "abort" {
            return self.handle_abort(client_id, worker_name, input);
        }

        match availability_status(self.find_worker_by_name(worker_name)) {
            Some(status) => vec![(
                client_id,
                reply_error_frame(worker_name, status, format!("worker {worker_name:?} unavailable")),
            )],
            None => {
                let timeout = parse_timeout(&input);
                let worker = self
                    .workers
                    .get_mut(worker_name)
                    .expect("availability_status returned None only when worker exists");
                let request_id = worker.next_request_id();
                worker.pending.insert(
                    request_id.clone(),
                    PendingRequest {
                        client_routing_id: client_id,
                        method,
                        dispatched_at: Instant::now(),
                        timeout,
                    },
                );
                worker.stats.requests += 1;
                let routing_id = worker
                    .routing_id
                    .clone()
                    .expect("availability_status guarantees is_alive, which implies a routing id");
                vec![(routing_id, Frame::WorkerRequest { request_id, input })]
            }
        }
    }

    /// `"abort"`: forwarded to the worker under the shared sentinel id if
    /// the worker happens to be connected, but the client is always
    /// replied to immediately with a null success — it never waits on
    /// whatever the worker eventually does with it (spec §4.2).
    fn handle_abort(&mut self, client_id: Bytes, worker_name: &str, input: Bytes) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let Some(worker) = self.workers.get(worker_name) {
            if let Some(routing_id) = worker.routing_id.clone() {
                out.push((
                    routing_id,
                    Frame::WorkerRequest {
                        request_id: Bytes::from_static(Self::ABORT_SENTINEL_ID),
                        input,
                    },
                ));
            }
        }
        let reply = ReplyBody::ok("abort", serde_json::Value::Null);
        out.push((client_id, client_reply_frame(worker_name, &reply)));
        out
    }

    fn handle_self_api_request(&mut self, client_id: Bytes, input: Bytes) -> Vec<Outbound> {
        let parsed: Result<RequestBody, _> = serde_json::from_slice(&input);
        let request = match parsed {
            Ok(r) => r,
            Err(e) => {
                return vec![(
                    client_id,
                    reply_error_frame("broker", ReplyStatus::BadArg, e.to_string()),
                )]
            }
        };

        if request.method == "updateWorkers" {
            self.apply_update_workers(&request.args);
            let reply = ReplyBody::ok("updateWorkers", serde_json::Value::Bool(true));
            return vec![(client_id, client_reply_frame("broker", &reply))];
        }

        match selfapi::dispatch(&request.method, &request.args, &self.workers) {
            Ok(data) => {
                let reply = ReplyBody::ok(&request.method, data);
                vec![(client_id, client_reply_frame("broker", &reply))]
            }
            Err(e) => {
                let status = e.reply_status().unwrap_or(ReplyStatus::Internal);
                vec![(client_id, reply_error_frame(&request.method, status, e.to_string()))]
            }
        }
    }

    /// `updateWorkers`: register stub connections for names the broker has
    /// not seen a READY from yet (spec §4.4), so `getWorkers` can report
    /// procman-declared workers before their first heartbeat, and mirror
    /// each descriptor's persistent `disabled` flag onto the worker table
    /// so a disabled worker is reported `NOSUCH` regardless of connection
    /// state (spec §4.3).
    ///
    /// Each element is either a bare name (`enabled` defaults to `true`)
    /// or `{"name": ..., "disabled": bool}`, matching what
    /// `procman::client::call` pushes for `"updateWorkers"`.
    fn apply_update_workers(&mut self, args: &serde_json::Value) {
        let Some(entries) = args.as_array() else { return };
        for entry in entries {
            let (name, disabled) = match entry {
                serde_json::Value::String(s) => (s.as_str(), false),
                serde_json::Value::Object(_) => {
                    let Some(name) = entry.get("name").and_then(serde_json::Value::as_str) else { continue };
                    let disabled = entry.get("disabled").and_then(serde_json::Value::as_bool).unwrap_or(false);
                    (name, disabled)
                }
                _ => continue,
            };
            let worker = self
                .workers
                .entry(name.to_string())
                .or_insert_with(|| WorkerConnection::new(name, self.liveness_max));
            worker.enabled = !disabled;
        }
    }

    fn handle_worker_ready(&mut self, routing_id: Bytes, worker_name: String) {
        let worker = self
            .workers
            .entry(worker_name.clone())
            .or_insert_with(|| WorkerConnection::new(&worker_name, self.liveness_max));
        // Pending requests from a displaced prior connection are dropped
        // here: the client that issued them already saw its own connection
        // drop or will time out and retry (spec §4.2 "connect" semantics).
        let _drained = worker.connect(routing_id);

        self.publish(Event::joint(
            "worker_connected",
            serde_json::json!({ "name": worker_name }),
        ));
    }

    fn handle_worker_reply(&mut self, routing_id: &Bytes, request_id: &Bytes, output: Bytes) -> Vec<Outbound> {
        let Some((name, worker)) = self
            .workers
            .iter_mut()
            .find(|(_, w)| w.routing_id.as_ref() == Some(routing_id))
        else {
            tracing::warn!("reply from unknown routing id, dropping");
            return Vec::new();
        };

        worker.mark_alive();
        worker.stats.replies += 1;
        let Some(pending) = worker.pending.remove(request_id) else {
            tracing::warn!(worker = %name, "reply for unknown or already-resolved request, dropping");
            return Vec::new();
        };

        vec![(
            pending.client_routing_id,
            Frame::ClientReply {
                worker_name: name.clone(),
                output,
            },
        )]
    }

    /// Forward a progress item to the client still waiting on
    /// `request_id`, without touching the pending entry — the request is
    /// still in flight and its eventual reply is handled separately
    /// (spec §4.5 "Progress notifications": delivered on the same
    /// connection, not acknowledged).
    ///
    /// Dropped silently if the request already timed out and its pending
    /// entry was removed (spec §5: late output/progress is discarded).
    fn handle_worker_progress(&mut self, routing_id: &Bytes, request_id: &Bytes, item: Bytes) -> Vec<Outbound> {
        let Some((name, worker)) = self
            .workers
            .iter()
            .find(|(_, w)| w.routing_id.as_ref() == Some(routing_id))
        else {
            return Vec::new();
        };
        let Some(pending) = worker.pending.get(request_id) else {
            return Vec::new();
        };
        vec![(
            pending.client_routing_id.clone(),
            Frame::ClientProgress {
                worker_name: name.clone(),
                item,
            },
        )]
    }

    fn handle_worker_heartbeat(&mut self, routing_id: &Bytes) {
        if let Some((_, worker)) = self
            .workers
            .iter_mut()
            .find(|(_, w)| w.routing_id.as_ref() == Some(routing_id))
        {
            worker.mark_alive();
        }
    }

    fn handle_worker_disconnect(&mut self, routing_id: &Bytes) {
        let Some((name, worker)) = self
            .workers
            .iter_mut()
            .find(|(_, w)| w.routing_id.as_ref() == Some(routing_id))
        else {
            return;
        };
        let worker_name = name.clone();
        worker.disconnect(self.protect_time, Instant::now());
        self.publish(Event::joint(
            "worker_disconnected",
            serde_json::json!({ "name": worker_name }),
        ));
    }

    /// Protect-time sweep: once a disconnected worker's grace window has
    /// elapsed without a reconnect, fail whatever was still pending with
    /// `RECOVERING` (spec §9 "protect-time").
    pub fn sweep_protect_time(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        for (name, worker) in &mut self.workers {
            for (_, pending) in worker.sweep_protect_time(now) {
                out.push((
                    pending.client_routing_id,
                    reply_error_frame(name, ReplyStatus::Recovering, format!("{} worker disconnected", pending.method)),
                ));
            }
        }
        out
    }

    /// Called once per `HB_INTERVAL` tick for every connected worker
    /// (spec §4.2). Returns the set of workers whose liveness just crossed
    /// zero this tick, for the caller to act on (publish `worker_failedHb`,
    /// which procman's supervisor subscribes to).
    pub fn heartbeat_tick(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, worker) in &mut self.workers {
            if worker.heartbeat_tick() == HeartbeatOutcome::JustFailed {
                failed.push(name.clone());
            }
        }
        for name in &failed {
            self.publish(Event::joint(
                "worker_failedHb",
                serde_json::json!({ "name": name }),
            ));
        }
        failed
    }

    #[must_use]
    pub fn workers(&self) -> &HashMap<String, WorkerConnection> {
        &self.workers
    }

    /// Timeout sweep: drop pending requests older than their deadline,
    /// replying `TIMEDOUT` to the waiting client (spec end-to-end scenario
    /// 3).
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        for (name, worker) in &mut self.workers {
            let expired: Vec<Bytes> = worker
                .pending
                .iter()
                .filter_map(|(id, p)| match p.timeout {
                    Some(d) if now.duration_since(p.dispatched_at) >= d => Some(id.clone()),
                    _ => None,
                })
                .collect();
            for id in expired {
                if let Some(p) = worker.pending.remove(&id) {
                    out.push((
                        p.client_routing_id,
                        reply_error_frame(name, ReplyStatus::TimedOut, format!("{} timed out", p.method)),
                    ));
                }
            }
        }
        out
    }
}

/// Pull the method name and the caller-supplied `timeout` (milliseconds,
/// under `args.timeout`) out of a still-encoded client request, mirroring
/// the worker-side parsing in `worker_runtime::dispatch::Dispatcher::accept`
/// so the broker's own timeout sweep (spec end-to-end scenario 3) can fire
/// even if the worker never sees the request at all.
fn parse_method_and_timeout(input: &Bytes) -> (String, Option<Duration>) {
    let Ok(request) = serde_json::from_slice::<RequestBody>(input) else {
        return (String::new(), None);
    };
    (request.method, timeout_from_args(&request.args))
}

fn parse_timeout(input: &Bytes) -> Option<Duration> {
    let request: RequestBody = serde_json::from_slice(input).ok()?;
    timeout_from_args(&request.args)
}

fn timeout_from_args(args: &serde_json::Value) -> Option<Duration> {
    args.get("timeout").and_then(serde_json::Value::as_u64).map(Duration::from_millis)
}

fn reply_error_frame(worker_name: &str, status: ReplyStatus, message: String) -> Frame {
    let reply = ReplyBody::err(worker_name, StatusPayload::new(status, message));
    client_reply_frame(worker_name, &reply)
}

fn client_reply_frame(worker_name: &str, reply: &ReplyBody) -> Frame {
    let output = serde_json::to_vec(reply).unwrap_or_default();
    Frame::ClientReply {
        worker_name: worker_name.to_string(),
        output: Bytes::from(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> BrokerCore {
        let (tx, _rx) = flume::unbounded();
        BrokerCore::new(tx, 5, Duration::from_secs(10))
    }

    #[test]
    fn request_to_unknown_worker_is_nosuch() {
        let mut c = core();
        let req = RequestBody {
            method: "echoSync".into(),
            args: serde_json::json!([]),
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::NoSuch),
                    ReplyBody::Ok { .. } => panic!("expected error reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
    }

    #[test]
    fn ready_then_request_dispatches_to_worker() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        assert!(c.workers().get("echo").unwrap().is_alive());

        let req = RequestBody {
            method: "echoSync".into(),
            args: serde_json::json!(["hi"]),
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Bytes::from_static(b"worker-conn-1"));
        match &out[0].1 {
            Frame::WorkerRequest { .. } => {}
            _ => panic!("expected WorkerRequest"),
        }
    }

    #[test]
    fn caller_supplied_timeout_fires_the_broker_timeout_sweep() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        let req = RequestBody {
            method: "echoAsync".into(),
            args: serde_json::json!({"str": "hi", "timeout": 500}),
        };
        c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        assert_eq!(c.workers().get("echo").unwrap().pending.len(), 1);

        // Not yet expired.
        assert!(c.sweep_timeouts(Instant::now()).is_empty());
        assert_eq!(c.workers().get("echo").unwrap().pending.len(), 1);

        // Past the 500ms deadline, TIMEDOUT is sent and the entry cleared.
        let out = c.sweep_timeouts(Instant::now() + Duration::from_millis(600));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Bytes::from_static(b"client-1"));
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::TimedOut),
                    ReplyBody::Ok { .. } => panic!("expected error reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
        assert!(c.workers().get("echo").unwrap().pending.is_empty());
    }

    #[test]
    fn disabled_worker_is_nosuch_even_while_connected() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        c.apply_update_workers(&serde_json::json!([{ "name": "echo", "disabled": true }]));

        let req = RequestBody {
            method: "echoSync".into(),
            args: serde_json::json!({"str": "hi"}),
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::NoSuch),
                    ReplyBody::Ok { .. } => panic!("expected error reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
    }

    #[test]
    fn abort_replies_immediately_and_still_forwards_to_a_connected_worker() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        let req = RequestBody {
            method: "abort".into(),
            args: serde_json::Value::Null,
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, Bytes::from_static(b"worker-conn-1"));
        match &out[0].1 {
            Frame::WorkerRequest { .. } => {}
            _ => panic!("expected WorkerRequest forwarded to the worker"),
        }
        assert_eq!(out[1].0, Bytes::from_static(b"client-1"));
        match &out[1].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Ok { data, .. } => assert_eq!(data, serde_json::Value::Null),
                    ReplyBody::Err { .. } => panic!("expected ok reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
        // abort never occupies a pending slot.
        assert!(c.workers().get("echo").unwrap().pending.is_empty());
    }

    #[test]
    fn abort_replies_immediately_even_with_no_worker_connected() {
        let mut c = core();
        let req = RequestBody {
            method: "abort".into(),
            args: serde_json::Value::Null,
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Bytes::from_static(b"client-1"));
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Ok { data, .. } => assert_eq!(data, serde_json::Value::Null),
                    ReplyBody::Err { .. } => panic!("expected ok reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
    }

    #[test]
    fn self_api_ping_replies_without_touching_worker_table() {
        let mut c = core();
        let req = RequestBody {
            method: "ping".into(),
            args: serde_json::Value::Null,
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "broker".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Ok { data, .. } => assert_eq!(data, serde_json::Value::Bool(true)),
                    ReplyBody::Err { .. } => panic!("expected ok reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
    }

    #[test]
    fn heartbeat_tick_reports_failures_once() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        // liveness_max = 5: five ticks exhaust it, the sixth fails.
        for _ in 0..5 {
            assert!(c.heartbeat_tick().is_empty());
        }
        assert_eq!(c.heartbeat_tick(), vec!["echo".to_string()]);
        assert!(c.heartbeat_tick().is_empty());
    }

    #[test]
    fn worker_progress_forwards_to_waiting_client() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        let req = RequestBody {
            method: "echoAsyncWithNotifications".into(),
            args: serde_json::json!({"str": "foo"}),
        };
        let out = c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        let request_id = match &out[0].1 {
            Frame::WorkerRequest { request_id, .. } => request_id.clone(),
            _ => panic!("expected WorkerRequest"),
        };

        let out = c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerProgress {
                request_id,
                item: Bytes::from_static(b"\"foo-0%\""),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Bytes::from_static(b"client-1"));
        match &out[0].1 {
            Frame::ClientProgress { worker_name, item } => {
                assert_eq!(worker_name, "echo");
                assert_eq!(item, &Bytes::from_static(b"\"foo-0%\""));
            }
            _ => panic!("expected ClientProgress"),
        }
    }

    #[test]
    fn disconnect_preserves_pending_until_protect_time_elapses() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        let req = RequestBody {
            method: "echoSync".into(),
            args: serde_json::json!({"str": "hi"}),
        };
        c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );

        c.handle_frame(Bytes::from_static(b"worker-conn-1"), Frame::Disconnect);
        assert!(c.workers().get("echo").unwrap().pending.len() == 1);

        // A request arriving mid-grace-window is RECOVERING, not NOSUCH.
        let out = c.handle_frame(
            Bytes::from_static(b"client-2"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::Recovering),
                    ReplyBody::Ok { .. } => panic!("expected error reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }

        // Sweeping before the deadline does nothing.
        assert!(c.sweep_protect_time(Instant::now()).is_empty());
        assert_eq!(c.workers().get("echo").unwrap().pending.len(), 1);

        // Past the deadline, the original request fails RECOVERING.
        let out = c.sweep_protect_time(Instant::now() + Duration::from_secs(11));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Bytes::from_static(b"client-1"));
        match &out[0].1 {
            Frame::ClientReply { output, .. } => {
                let reply: ReplyBody = serde_json::from_slice(output).unwrap();
                match reply {
                    ReplyBody::Err { status, .. } => assert_eq!(status.code, ReplyStatus::Recovering),
                    ReplyBody::Ok { .. } => panic!("expected error reply"),
                }
            }
            _ => panic!("expected ClientReply"),
        }
        assert!(c.workers().get("echo").unwrap().pending.is_empty());
    }

    #[test]
    fn reconnect_within_protect_time_keeps_pending_request_alive() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        let req = RequestBody {
            method: "echoSync".into(),
            args: serde_json::json!({"str": "hi"}),
        };
        c.handle_frame(
            Bytes::from_static(b"client-1"),
            Frame::ClientRequest {
                worker_name: "echo".into(),
                input: Bytes::from(serde_json::to_vec(&req).unwrap()),
            },
        );
        c.handle_frame(Bytes::from_static(b"worker-conn-1"), Frame::Disconnect);

        c.handle_frame(
            Bytes::from_static(b"worker-conn-2"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        assert_eq!(c.workers().get("echo").unwrap().pending.len(), 1);
        assert!(c.workers().get("echo").unwrap().is_alive());
    }

    #[test]
    fn progress_for_already_resolved_request_is_dropped() {
        let mut c = core();
        c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerReady {
                worker_name: "echo".into(),
                info: Bytes::new(),
            },
        );
        let out = c.handle_frame(
            Bytes::from_static(b"worker-conn-1"),
            Frame::WorkerProgress {
                request_id: Bytes::from_static(b"echo-999"),
                item: Bytes::from_static(b"null"),
            },
        );
        assert!(out.is_empty());
    }
}
