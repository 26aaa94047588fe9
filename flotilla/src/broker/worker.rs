//! Worker representation (C2): per-worker connection state inside the
//! broker — identity, pending request table, heartbeat liveness counter,
//! and statistics.

use bytes::Bytes;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

use flotilla_core::error::ReplyStatus;

/// A request the broker is waiting on a reply for.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Routing identity of the client connection that issued the request.
    pub client_routing_id: Bytes,
    pub method: String,
    pub dispatched_at: Instant,
    /// Caller-supplied timeout, if any.
    pub timeout: Option<Duration>,
}

/// Per-worker counters (spec §3: "request count, reply count,
/// protocol-error count, connect count, missed-heartbeat count,
/// failed-heartbeat count").
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub requests: u64,
    pub replies: u64,
    pub protocol_errors: u64,
    pub connects: u64,
    pub missed_heartbeats: u64,
    pub failed_heartbeats: u64,
}

/// Lifecycle events a worker connection emits toward the broker core.
#[derive(Debug, Clone)]
pub enum WorkerLifecycleEvent {
    Connected,
    Disconnected,
    Request,
    Reply,
    BackToLife,
    FailedHeartbeat,
}

/// One worker's state as tracked by the broker.
///
/// Invariant: at most one alive connection per worker `name` at a time; a
/// second READY displaces the first and recoverably fails its pending
/// requests (spec §3).
pub struct WorkerConnection {
    pub name: String,
    /// `None` when the worker has never connected, or is presently
    /// disconnected (stub registered via `updateWorkers`, spec §4.4).
    pub routing_id: Option<Bytes>,
    pub connected_times: u64,
    pub liveness: i32,
    pub liveness_max: i32,
    pub heartbeat_disabled: bool,
    pub pending: HashMap<Bytes, PendingRequest>,
    pub stats: WorkerStats,
    /// True for the synthetic `broker` self-worker, which is always
    /// alive and runs no heartbeat ticker (spec §4.2).
    pub is_self: bool,
    /// Mirrors procman's persistent descriptor `disabled` flag, pushed in
    /// via `updateWorkers` (spec §4.4). A disabled worker is `NOSUCH` to
    /// clients even while still connected.
    pub enabled: bool,
    /// Set on disconnect to `now + protect_time`; pending requests survive
    /// until this deadline so a fast reconnect does not fail them twice
    /// (spec §9 "protect-time").
    pub disconnect_deadline: Option<Instant>,
    next_request_id: u64,
}

impl WorkerConnection {
    #[must_use]
    pub fn new(name: impl Into<String>, liveness_max: i32) -> Self {
        Self {
            name: name.into(),
            routing_id: None,
            connected_times: 0,
            liveness: liveness_max,
            liveness_max,
            heartbeat_disabled: false,
            pending: HashMap::new(),
            stats: WorkerStats::default(),
            is_self: false,
            enabled: true,
            disconnect_deadline: None,
            next_request_id: 0,
        }
    }

    #[must_use]
    pub fn new_self(liveness_max: i32) -> Self {
        let mut w = Self::new("broker", liveness_max);
        w.is_self = true;
        w
    }

    /// Worker is alive: connected and either within its liveness budget
    /// or heartbeat-disabled (spec §3).
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.is_self {
            return true;
        }
        self.routing_id.is_some() && (self.liveness >= 0 || self.heartbeat_disabled)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_self || self.routing_id.is_some()
    }

    /// `connect`: bind a new connection. A second READY while the worker
    /// is still live displaces the first and fails its prior pending
    /// requests with `RECOVERING` (spec §4.2); a reconnect arriving while
    /// only within its post-disconnect protect-time window instead
    /// preserves whatever was still pending, since it was never failed in
    /// the first place.
    pub fn connect(&mut self, routing_id: Bytes) -> Vec<(Bytes, PendingRequest)> {
        let drained = if self.routing_id.is_some() {
            self.pending.drain().collect()
        } else {
            Vec::new()
        };
        self.disconnect_deadline = None;
        self.routing_id = Some(routing_id);
        self.connected_times += 1;
        self.stats.connects += 1;
        self.liveness = self.liveness_max;
        drained
    }

    /// `disconnect`: clear the connection identity but leave pending
    /// requests in place for `protect_time`, so a fast reconnect can
    /// absorb them instead of failing every in-flight request with
    /// `RECOVERING` immediately (spec §9 "protect-time"). Call
    /// [`Self::sweep_protect_time`] once the window has actually elapsed.
    pub fn disconnect(&mut self, protect_time: Duration, now: Instant) {
        self.routing_id = None;
        self.disconnect_deadline = Some(now + protect_time);
    }

    /// Drain pending requests as `RECOVERING` once the protect-time grace
    /// window has elapsed without a reconnect.
    pub fn sweep_protect_time(&mut self, now: Instant) -> Vec<(Bytes, PendingRequest)> {
        match self.disconnect_deadline {
            Some(deadline) if now >= deadline => {
                self.disconnect_deadline = None;
                self.pending.drain().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Allocate a monotone, process-unique request id.
    pub fn next_request_id(&mut self) -> Bytes {
        let id = self.next_request_id;
        self.next_request_id += 1;
        Bytes::from(format!("{}-{id}", self.name))
    }

    pub fn heartbeat_tick(&mut self) -> HeartbeatOutcome {
        if self.is_self || self.heartbeat_disabled || self.routing_id.is_none() {
            return HeartbeatOutcome::Skipped;
        }
        let was_alive = self.liveness >= 0;
        self.liveness -= 1;
        if was_alive && self.liveness < 0 {
            self.stats.failed_heartbeats += 1;
            return HeartbeatOutcome::JustFailed;
        }
        if self.liveness < 0 {
            self.stats.missed_heartbeats += 1;
        }
        HeartbeatOutcome::Ok
    }

    /// Reset liveness on any message from the worker (heartbeat or
    /// otherwise).
    pub fn mark_alive(&mut self) {
        self.liveness = self.liveness_max;
    }

    pub fn set_heartbeat_disabled(&mut self, disabled: bool) {
        self.heartbeat_disabled = disabled;
        if disabled {
            self.liveness = self.liveness_max;
        }
    }
}

/// Outcome of a single heartbeat tick, used by the broker to decide
/// whether to publish `worker_failedHb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    /// Liveness just crossed below zero this tick (emit `failedHeartbeat`
    /// once per transition).
    JustFailed,
    Skipped,
}

/// Translate a connection/worker-availability problem into the
/// client-facing [`ReplyStatus`], per spec §4.3's client-request dispatch
/// rules.
#[must_use]
pub fn availability_status(worker: Option<&WorkerConnection>) -> Option<ReplyStatus> {
    match worker {
        None => Some(ReplyStatus::NoSuch),
        Some(w) if !w.enabled => Some(ReplyStatus::NoSuch),
        Some(w) if !w.is_alive() => Some(ReplyStatus::Recovering),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_drains_pending_as_recovering() {
        let mut w = WorkerConnection::new("echo", 5);
        w.connect(Bytes::from_static(b"conn-1"));
        w.pending.insert(
            Bytes::from_static(b"rid-1"),
            PendingRequest {
                client_routing_id: Bytes::from_static(b"client-1"),
                method: "echoSync".into(),
                dispatched_at: Instant::now(),
                timeout: None,
            },
        );

        let drained = w.connect(Bytes::from_static(b"conn-2"));
        assert_eq!(drained.len(), 1);
        assert!(w.pending.is_empty());
        assert_eq!(w.routing_id, Some(Bytes::from_static(b"conn-2")));
    }

    #[test]
    fn reconnect_within_protect_time_preserves_pending() {
        let mut w = WorkerConnection::new("echo", 5);
        w.connect(Bytes::from_static(b"conn-1"));
        w.pending.insert(
            Bytes::from_static(b"rid-1"),
            PendingRequest {
                client_routing_id: Bytes::from_static(b"client-1"),
                method: "echoSync".into(),
                dispatched_at: Instant::now(),
                timeout: None,
            },
        );

        w.disconnect(Duration::from_secs(10), Instant::now());
        assert!(!w.is_alive());
        assert_eq!(w.pending.len(), 1);

        let drained = w.connect(Bytes::from_static(b"conn-2"));
        assert!(drained.is_empty());
        assert_eq!(w.pending.len(), 1);
        assert!(w.disconnect_deadline.is_none());
    }

    #[test]
    fn sweep_protect_time_drains_only_after_deadline() {
        let mut w = WorkerConnection::new("echo", 5);
        w.connect(Bytes::from_static(b"conn-1"));
        w.pending.insert(
            Bytes::from_static(b"rid-1"),
            PendingRequest {
                client_routing_id: Bytes::from_static(b"client-1"),
                method: "echoSync".into(),
                dispatched_at: Instant::now(),
                timeout: None,
            },
        );
        let now = Instant::now();
        w.disconnect(Duration::from_secs(10), now);

        assert!(w.sweep_protect_time(now).is_empty());
        assert_eq!(w.pending.len(), 1);

        let drained = w.sweep_protect_time(now + Duration::from_secs(11));
        assert_eq!(drained.len(), 1);
        assert!(w.pending.is_empty());
        assert!(w.disconnect_deadline.is_none());
    }

    #[test]
    fn heartbeat_failure_fires_once() {
        let mut w = WorkerConnection::new("echo", 1);
        w.connect(Bytes::from_static(b"conn-1"));
        assert_eq!(w.heartbeat_tick(), HeartbeatOutcome::Ok); // liveness 1 -> 0
        assert_eq!(w.heartbeat_tick(), HeartbeatOutcome::JustFailed); // 0 -> -1
        assert_eq!(w.heartbeat_tick(), HeartbeatOutcome::Ok); // -1 -> -2, already failed
    }

    #[test]
    fn mark_alive_resets_liveness() {
        let mut w = WorkerConnection::new("echo", 3);
        w.connect(Bytes::from_static(b"conn-1"));
        w.heartbeat_tick();
        w.heartbeat_tick();
        assert_eq!(w.liveness, 1);
        w.mark_alive();
        assert_eq!(w.liveness, 3);
    }

    #[test]
    fn heartbeat_disabled_is_always_alive() {
        let mut w = WorkerConnection::new("echo", 1);
        w.connect(Bytes::from_static(b"conn-1"));
        w.set_heartbeat_disabled(true);
        for _ in 0..10 {
            w.heartbeat_tick();
        }
        assert!(w.is_alive());
    }
}
