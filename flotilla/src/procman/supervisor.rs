//! Procman supervisor (C7): dependency-ordered start, respawn cooldown,
//! heartbeat-driven restart, the memory guard, and debug mode.

use hashbrown::{HashMap, HashSet};
use std::time::Duration;

use flotilla_core::events::Event;

use super::registry::{Registry, WorkerDescriptor};

/// Lifecycle events the supervisor emits (spec §4.7 "Events emitted").
pub fn process_started(name: &str) -> Event {
    Event::joint("process_started", serde_json::json!({ "name": name }))
}
pub fn process_stopped(name: &str) -> Event {
    Event::joint("process_stopped", serde_json::json!({ "name": name }))
}
pub fn process_online(name: &str) -> Event {
    Event::joint("process_online", serde_json::json!({ "name": name }))
}
pub fn process_offline(name: &str) -> Event {
    Event::joint("process_offline", serde_json::json!({ "name": name }))
}
/// Emitted exactly once, when the initial start ordering has converged.
pub fn start_complete(online: &[String], failed: &[String]) -> Event {
    Event::joint(
        "start_complete",
        serde_json::json!({ "online": online, "failed": failed, "failedWorkers": failed }),
    )
}

/// Compute a start order respecting `require` (strong) and `after`
/// (weak) edges.
///
/// A worker with an unsatisfiable `require` chain (a cycle, or a
/// dependency that is itself unresolvable) is reported in `failed`
/// instead of an order slot, per spec §4.7 ("if a required worker never
/// becomes online the dependent worker is never started and is marked
/// failed").
#[must_use]
pub fn resolve_start_order(workers: &[WorkerDescriptor]) -> StartPlan {
    let by_name: HashMap<&str, &WorkerDescriptor> = workers.iter().map(|w| (w.name.as_str(), w)).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut failed: Vec<String> = Vec::new();
    let mut visiting: HashSet<String> = HashSet::new();
    let mut done: HashSet<String> = HashSet::new();

    for w in workers {
        visit(w.name.as_str(), &by_name, &mut resolved, &mut failed, &mut visiting, &mut done);
    }

    StartPlan { order: resolved, failed }
}

fn visit(
    name: &str,
    by_name: &HashMap<&str, &WorkerDescriptor>,
    resolved: &mut Vec<String>,
    failed: &mut Vec<String>,
    visiting: &mut HashSet<String>,
    done: &mut HashSet<String>,
) -> bool {
    if done.contains(name) {
        return !failed.contains(&name.to_string());
    }
    if visiting.contains(name) {
        // Cycle: every participant is unresolvable.
        return false;
    }
    let Some(w) = by_name.get(name) else {
        // A dependency naming a worker that does not exist at all.
        return false;
    };

    visiting.insert(name.to_string());
    let mut ok = true;
    for req in &w.requires {
        if !visit(req, by_name, resolved, failed, visiting, done) {
            ok = false;
        }
    }
    for after in &w.after {
        // Weak: we don't propagate its failure, we just need it attempted.
        visit(after, by_name, resolved, failed, visiting, done);
    }
    visiting.remove(name);
    done.insert(name.to_string());

    if ok {
        resolved.push(name.to_string());
    } else {
        failed.push(name.to_string());
    }
    ok
}

/// Result of [`resolve_start_order`].
#[derive(Debug, Clone, Default)]
pub struct StartPlan {
    pub order: Vec<String>,
    pub failed: Vec<String>,
}

/// Respawn backoff state for one worker (spec P6 / §4.7 "Respawn with
/// cooldown").
#[derive(Debug, Clone)]
pub struct Cooldown {
    pub delay: Duration,
    pub base: Duration,
    pub cap: Duration,
}

impl Cooldown {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            base,
            cap,
        }
    }

    /// A clean exit (code 0) resets the delay.
    pub fn on_clean_exit(&mut self) {
        self.delay = Duration::ZERO;
    }

    /// An unclean exit within the stable window doubles the delay up to
    /// the cap (spec P6: `min(base * 2^(k-1), cap)`, applied here as a
    /// running doubling rather than recomputed from a crash counter —
    /// equivalent since each call represents exactly one more crash).
    pub fn on_unclean_exit_within_window(&mut self) {
        self.delay = if self.delay.is_zero() {
            self.base
        } else {
            std::cmp::min(self.delay * 2, self.cap)
        };
    }

    /// `clearWorker`: resets the delay and cancels any in-flight cooldown.
    pub fn clear(&mut self) {
        self.delay = Duration::ZERO;
    }
}

/// Heartbeat-driven restart policy (spec §4.7 "Heartbeat-driven restart").
///
/// Reacts to a `worker_failedHb` event: unless the worker has
/// `heartbeatDisabled` set, it should be killed (SIGTERM, grace window,
/// then SIGKILL) and restarted under cooldown rules. Actual signaling is
/// delegated to [`super::pidfile::update_pid_file`]'s `graceful_kill`
/// sibling logic in the binary entrypoint, which owns the live child
/// handle; this function only decides *whether* to act.
#[must_use]
pub fn should_restart_on_failed_heartbeat(heartbeat_disabled: bool) -> bool {
    !heartbeat_disabled
}

/// Memory guard tick (spec §4.7 "Memory guard"): given each running
/// worker's sampled RSS and its configured ceiling, return the names that
/// exceed their ceiling and must be killed + restarted.
#[must_use]
pub fn memory_guard_violations(workers: &Registry, rss_by_name: &HashMap<String, u64>) -> Vec<String> {
    let mut out = Vec::new();
    for name in workers.names() {
        let Some(descriptor) = workers.find(&name) else { continue };
        let Some(ceiling) = descriptor.memory_ceiling_bytes else { continue };
        let Some(rss) = rss_by_name.get(&name) else { continue };
        if *rss > ceiling {
            out.push(name);
        }
    }
    out
}

/// Sample RSS for a set of pids via `sysinfo`.
#[must_use]
pub fn sample_rss(pids: &[u32]) -> HashMap<u32, u64> {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    system.refresh_all();
    pids.iter()
        .filter_map(|&pid| {
            system
                .process(Pid::from_u32(pid))
                .map(|p| (pid, p.memory()))
        })
        .collect()
}

/// `enableDebug(name, pauseOnStart)` / `disableDebug`: toggle the
/// persistent debug flags. The caller (binary entrypoint) is responsible
/// for the actual restart with the debug-port argument appended, and for
/// suppressing heartbeat checks while `debug` is set (mirrored in
/// [`should_restart_on_failed_heartbeat`] callers checking `descriptor.debug`
/// alongside `heartbeat_disabled`).
pub fn set_debug(registry: &mut Registry, name: &str, enabled: bool, pause_on_start: bool) -> bool {
    let Some(mut descriptor) = registry.find(name).cloned() else {
        return false;
    };
    descriptor.debug = enabled;
    descriptor.pause_on_start = enabled && pause_on_start;
    registry.upsert(descriptor);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, requires: &[&str], after: &[&str]) -> WorkerDescriptor {
        WorkerDescriptor {
            schema_version: 1,
            name: name.into(),
            path: "/bin/true".into(),
            args: vec![],
            requires: requires.iter().map(|s| s.to_string()).collect(),
            after: after.iter().map(|s| s.to_string()).collect(),
            tag: None,
            disabled: false,
            heartbeat_disabled: false,
            debug: false,
            pause_on_start: false,
            memory_ceiling_bytes: None,
        }
    }

    #[test]
    fn requires_are_ordered_before_dependents() {
        let plan = resolve_start_order(&[worker("b", &["a"], &[]), worker("a", &[], &[])]);
        assert!(plan.failed.is_empty());
        let pos_a = plan.order.iter().position(|n| n == "a").unwrap();
        let pos_b = plan.order.iter().position(|n| n == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn missing_require_fails_dependent() {
        let plan = resolve_start_order(&[worker("b", &["missing"], &[])]);
        assert!(plan.order.is_empty());
        assert_eq!(plan.failed, vec!["b".to_string()]);
    }

    #[test]
    fn a_require_cycle_fails_every_participant() {
        let plan = resolve_start_order(&[worker("a", &["b"], &[]), worker("b", &["a"], &[])]);
        assert!(plan.order.is_empty());
        assert_eq!(plan.failed.len(), 2);
        assert!(plan.failed.contains(&"a".to_string()));
        assert!(plan.failed.contains(&"b".to_string()));
    }

    #[test]
    fn after_edges_order_without_propagating_failure() {
        // "after" is a weak ordering hint: even if the weak dependency is
        // itself unresolvable, the dependent is not dragged down with it.
        let plan = resolve_start_order(&[worker("b", &[], &["a"]), worker("a", &["missing"], &[])]);
        assert!(plan.order.contains(&"b".to_string()));
        assert!(plan.failed.contains(&"a".to_string()));
    }

    #[test]
    fn memory_guard_flags_workers_over_their_ceiling() {
        let mut reg = Registry::new();
        let mut capped = worker("capped", &[], &[]);
        capped.memory_ceiling_bytes = Some(1024);
        reg.upsert(capped);
        reg.upsert(worker("uncapped", &[], &[]));

        let mut rss = HashMap::new();
        rss.insert("capped".to_string(), 2048);
        rss.insert("uncapped".to_string(), u64::MAX);

        let violations = memory_guard_violations(&reg, &rss);
        assert_eq!(violations, vec!["capped".to_string()]);
    }

    #[test]
    fn cooldown_doubles_on_unclean_exit_and_resets_on_clean() {
        let mut c = Cooldown::new(Duration::from_secs(1), Duration::from_secs(60));
        c.on_unclean_exit_within_window();
        assert_eq!(c.delay, Duration::from_secs(1));
        c.on_unclean_exit_within_window();
        assert_eq!(c.delay, Duration::from_secs(2));
        c.on_unclean_exit_within_window();
        assert_eq!(c.delay, Duration::from_secs(4));
        c.on_clean_exit();
        assert_eq!(c.delay, Duration::ZERO);
    }

    #[test]
    fn cooldown_caps() {
        let mut c = Cooldown::new(Duration::from_secs(1), Duration::from_secs(3));
        for _ in 0..10 {
            c.on_unclean_exit_within_window();
        }
        assert_eq!(c.delay, Duration::from_secs(3));
    }

    #[test]
    fn clear_drops_cooldown_immediately() {
        let mut c = Cooldown::new(Duration::from_secs(1), Duration::from_secs(60));
        c.on_unclean_exit_within_window();
        c.on_unclean_exit_within_window();
        assert!(c.delay >= Duration::from_secs(2));
        c.clear();
        assert_eq!(c.delay, Duration::ZERO);
    }
}
