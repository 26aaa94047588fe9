//! `flotilla-procman`: the process manager.
//!
//! Owns the persistent worker table, computes a dependency-ordered start
//! sequence, spawns and supervises each worker as its own OS process
//! (respawn-with-cooldown, heartbeat-driven restart, memory guard), and
//! pushes descriptor updates into the broker so `getWorkers`/`getStats`
//! can see a worker before it first connects.
//!
//! Unlike the broker and worker runtime, procman runs under `tokio`
//! rather than `compio`: it needs `tokio::process` to supervise child
//! processes and `tokio::signal` for `SIGINT`/`SIGTERM`/`SIGHUP`, neither
//! of which `compio` provides. Its one piece of network I/O (talking to
//! the broker) is handled by `procman::client`, which speaks the wire
//! codec directly over a plain `tokio::net::TcpStream`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use flotilla_core::buffer::SegmentedBuffer;
use flotilla_core::error::ReplyStatus;
use flotilla_wire::frame::{encode_multipart, FrameAssembler, WireDecoder};
use flotilla_wire::payload::{ReplyBody, RequestBody, StatusPayload};
use flotilla_wire::protocol::{self, Frame};

use flotilla::config::{Config, ProcessType};
use flotilla::procman::pidfile::{update_pid_file, UpdateOptions};
use flotilla::procman::registry::{Registry, WorkerDescriptor};
use flotilla::procman::supervisor::{
    memory_guard_violations, resolve_start_order, sample_rss, should_restart_on_failed_heartbeat, Cooldown,
};

#[derive(Parser, Debug)]
#[command(name = "flotilla-procman", about = "flotilla process manager")]
struct Cli {
    /// Start only this worker and its `require` chain (repeatable).
    #[arg(short = 'j', long = "just")]
    just: Vec<String>,

    /// Start only this worker, skipping its `require` chain (repeatable).
    #[arg(short = 'J', long = "truly-just")]
    truly_just: Vec<String>,

    /// Exclude a worker from startup (repeatable).
    #[arg(short = 's', long = "skip")]
    skip: Vec<String>,

    /// Erase the persistent worker table before starting.
    #[arg(short = 'r', long = "reset")]
    reset: bool,

    /// Force ANSI colors in log output.
    #[arg(short = 'c', long = "colors")]
    colors: bool,
}

/// Exit code for SIGINT (spec §4.8).
const EXIT_SIGINT: i32 = 130;
/// Exit code for SIGTERM (spec §4.8).
const EXIT_SIGTERM: i32 = 137;
/// Exit code for SIGHUP (spec §4.8).
const EXIT_SIGHUP: i32 = 129;
/// Exit code for a fatal init failure (spec §4.8).
const EXIT_FATAL_INIT: i32 = 1;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    flotilla::config::init_tracing_with_ansi(cli.colors);

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(EXIT_FATAL_INIT);
        }
    };

    if let Err(e) = update_pid_file(
        &config.pid_file_path(ProcessType::Procman),
        UpdateOptions {
            process_type: Some(ProcessType::Procman),
            ..UpdateOptions::default()
        },
    ) {
        tracing::error!(error = %e, "failed to claim procman pid file");
        std::process::exit(EXIT_FATAL_INIT);
    }

    let table_path = config.worker_table_path();
    if cli.reset {
        let _ = std::fs::remove_file(&table_path);
        tracing::info!("persistent worker table reset");
    }

    let registry = Registry::load(&table_path);
    let descriptors = select_workers(registry.descriptors(), &cli);

    let plan = resolve_start_order(&descriptors);
    if !plan.failed.is_empty() {
        tracing::warn!(failed = ?plan.failed, "some workers have unsatisfiable `require` chains");
    }

    let broker_addr = match &config.broker_tcp {
        flotilla_core::endpoint::Endpoint::Tcp(addr) => *addr,
        #[allow(unreachable_patterns)]
        _ => unreachable!("broker_tcp is always constructed as Endpoint::Tcp"),
    };

    let worker_rows: Vec<serde_json::Value> = descriptors
        .iter()
        .map(|d| serde_json::json!({ "name": d.name, "disabled": d.disabled }))
        .collect();
    if let Err(e) = flotilla::procman::client::call(broker_addr, "broker", "updateWorkers", serde_json::json!(worker_rows)).await {
        tracing::warn!(error = %e, "updateWorkers push to broker failed (broker may not be up yet)");
    }

    let registry = Arc::new(Mutex::new(registry));
    let cooldowns: Arc<Mutex<HashMap<String, Cooldown>>> = Arc::new(Mutex::new(HashMap::new()));
    let by_name: HashMap<String, WorkerDescriptor> = descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();

    for name in &plan.order {
        let Some(descriptor) = by_name.get(name).cloned() else { continue };
        spawn_supervised(descriptor, Arc::clone(&registry), Arc::clone(&cooldowns), &config, broker_addr, &table_path);
    }

    tokio::spawn(watch_heartbeats(Arc::clone(&registry), Arc::clone(&cooldowns), config.clone(), broker_addr));
    tokio::spawn(watch_memory(Arc::clone(&registry), config.clone()));
    tokio::spawn(report_start_complete(Arc::clone(&registry), plan.order.clone(), plan.failed.clone(), config.clone()));

    let procman_addr = match &config.procman_tcp {
        flotilla_core::endpoint::Endpoint::Tcp(addr) => *addr,
        #[allow(unreachable_patterns)]
        _ => unreachable!("procman_tcp is always constructed as Endpoint::Tcp"),
    };
    match tokio::net::TcpListener::bind(procman_addr).await {
        Ok(listener) => {
            tokio::spawn(run_control_server(listener, Arc::clone(&registry), Arc::clone(&cooldowns), config.clone()));
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to bind procman control listener, clearWorker/restartWorker unavailable");
        }
    }

    wait_for_exit_signal().await;
}

/// Apply `-j`/`-J`/`-s` selection (spec §4.8 "CLI surface").
fn select_workers(all: Vec<WorkerDescriptor>, cli: &Cli) -> Vec<WorkerDescriptor> {
    let by_name: HashMap<String, WorkerDescriptor> = all.iter().cloned().map(|d| (d.name.clone(), d)).collect();

    let mut selected: Vec<WorkerDescriptor> = if !cli.truly_just.is_empty() {
        cli.truly_just.iter().filter_map(|n| by_name.get(n)).cloned().collect()
    } else if !cli.just.is_empty() {
        let mut names: std::collections::HashSet<String> = std::collections::HashSet::new();
        for start in &cli.just {
            collect_requires(start, &by_name, &mut names);
        }
        names.into_iter().filter_map(|n| by_name.get(&n)).cloned().collect()
    } else {
        all
    };

    selected.retain(|d| !d.disabled && !cli.skip.contains(&d.name));
    selected
}

fn collect_requires(name: &str, by_name: &HashMap<String, WorkerDescriptor>, seen: &mut std::collections::HashSet<String>) {
    if !seen.insert(name.to_string()) {
        return;
    }
    let Some(d) = by_name.get(name) else { return };
    for req in &d.requires {
        collect_requires(req, by_name, seen);
    }
}

/// Spawn one worker and keep it running under respawn-with-cooldown rules
/// (spec §4.6) for as long as procman lives.
fn spawn_supervised(
    descriptor: WorkerDescriptor,
    registry: Arc<Mutex<Registry>>,
    cooldowns: Arc<Mutex<HashMap<String, Cooldown>>>,
    config: &Config,
    broker_addr: std::net::SocketAddr,
    table_path: &std::path::Path,
) {
    let config = config.clone();
    let table_path = table_path.to_path_buf();
    tokio::spawn(async move {
        loop {
            let delay = {
                let mut guard = cooldowns.lock().await;
                let cooldown = guard
                    .entry(descriptor.name.clone())
                    .or_insert_with(|| Cooldown::new(config.respawn_backoff_base, config.respawn_backoff_cap));
                cooldown.delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let Ok(mut child) = tokio::process::Command::new(&descriptor.path).args(&descriptor.args).spawn() else {
                tracing::error!(worker = %descriptor.name, "failed to spawn worker process");
                return;
            };
            let pid = child.id();
            tracing::info!(worker = %descriptor.name, ?pid, "worker process started");

            {
                let mut reg = registry.lock().await;
                if let Some(rt) = reg.runtime_mut(&descriptor.name) {
                    rt.pid = pid;
                    rt.running = true;
                    rt.started_at = Some(Instant::now());
                    rt.failed = false;
                }
                let _ = reg.save(&table_path);
            }

            let status = child.wait().await;
            let started_at = registry
                .lock()
                .await
                .runtime(&descriptor.name)
                .and_then(|r| r.started_at);
            let within_stable_window = started_at.is_some_and(|t| t.elapsed() < config.stable_window);

            {
                let mut reg = registry.lock().await;
                if let Some(rt) = reg.runtime_mut(&descriptor.name) {
                    rt.running = false;
                    rt.online = false;
                }
                let _ = reg.save(&table_path);
            }

            let mut guard = cooldowns.lock().await;
            let cooldown = guard.entry(descriptor.name.clone()).or_insert_with(|| Cooldown::new(config.respawn_backoff_base, config.respawn_backoff_cap));
            match status {
                Ok(s) if s.success() => {
                    cooldown.on_clean_exit();
                    tracing::info!(worker = %descriptor.name, "worker exited cleanly");
                }
                _ if within_stable_window => {
                    cooldown.on_unclean_exit_within_window();
                    tracing::warn!(worker = %descriptor.name, "worker exited uncleanly within stable window, backing off");
                }
                _ => {
                    cooldown.on_clean_exit();
                    tracing::warn!(worker = %descriptor.name, "worker exited uncleanly after stable window");
                }
            }
        }
    });
}

/// Poll the broker's `getStats` on `hb_interval` and react to any worker
/// whose liveness has gone negative the way the broker's own
/// `worker_failedHb` event would (spec §4.6): SIGTERM, grace window,
/// SIGKILL, then let the owning supervisor task respawn it.
///
/// The wire protocol carries no cross-process publish/subscribe frame
/// (see `DESIGN.md`), so this polls rather than subscribes; the
/// observable behavior — detect a failed heartbeat, kill, restart — is
/// the same.
async fn watch_heartbeats(registry: Arc<Mutex<Registry>>, cooldowns: Arc<Mutex<HashMap<String, Cooldown>>>, config: Config, broker_addr: std::net::SocketAddr) {
    let mut already_failed: std::collections::HashSet<String> = std::collections::HashSet::new();
    loop {
        tokio::time::sleep(config.hb_interval).await;

        let Ok(stats) = flotilla::procman::client::call(broker_addr, "broker", "getStats", serde_json::Value::Null).await else {
            continue;
        };
        let Some(rows) = stats.as_array() else { continue };

        for row in rows {
            let Some(name) = row.get("name").and_then(serde_json::Value::as_str) else { continue };
            let liveness = row.get("liveness").and_then(serde_json::Value::as_i64).unwrap_or(0);

            let heartbeat_disabled = {
                let reg = registry.lock().await;
                reg.find(name).map_or(true, |d| d.heartbeat_disabled)
            };

            if liveness < 0 {
                if already_failed.contains(name) {
                    continue;
                }
                already_failed.insert(name.to_string());
                if !should_restart_on_failed_heartbeat(heartbeat_disabled) {
                    continue;
                }
                let pid = {
                    let reg = registry.lock().await;
                    reg.runtime(name).and_then(|r| r.pid)
                };
                if let Some(pid) = pid {
                    tracing::warn!(worker = name, pid, "heartbeat failed, killing for restart");
                    kill_gracefully(pid, config.graceful_kill_window, config.kill_wait).await;
                    let mut guard = cooldowns.lock().await;
                    guard.entry(name.to_string()).or_insert_with(|| Cooldown::new(config.respawn_backoff_base, config.respawn_backoff_cap)).clear();
                }
            } else {
                already_failed.remove(name);
                if let Some(rt) = registry.lock().await.runtime_mut(name) {
                    rt.online = true;
                }
            }
        }
    }
}

/// Control listener (spec §4.7 "Respawn with cooldown"): accepts the same
/// `ClientRequest`/`ClientReply` wire shape the broker's self-API speaks,
/// exposing `clearWorker`/`restartWorker` so an external caller can act on
/// a worker's cooldown without going through the broker (procman, not the
/// broker, owns `respawnDelay`).
async fn run_control_server(
    listener: tokio::net::TcpListener,
    registry: Arc<Mutex<Registry>>,
    cooldowns: Arc<Mutex<HashMap<String, Cooldown>>>,
    config: Config,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "procman control listener accept failed");
                continue;
            }
        };
        tokio::spawn(handle_control_conn(stream, Arc::clone(&registry), Arc::clone(&cooldowns), config.clone()));
    }
}

async fn handle_control_conn(
    mut stream: tokio::net::TcpStream,
    registry: Arc<Mutex<Registry>>,
    cooldowns: Arc<Mutex<HashMap<String, Cooldown>>>,
    config: Config,
) {
    let mut buffer = SegmentedBuffer::new();
    let mut decoder = WireDecoder::new();
    let mut assembler = FrameAssembler::new(64, 16 * 1024 * 1024);
    let mut read_buf = vec![0_u8; 8192];

    loop {
        let n = match stream.read(&mut read_buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buffer.push(Bytes::copy_from_slice(&read_buf[..n]));

        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(wire_frame)) => match assembler.push_frame(wire_frame) {
                    Ok(Some(parts)) => {
                        let Ok(frame) = protocol::parse_frame(parts) else { continue };
                        let Frame::ClientRequest { input, .. } = frame else { continue };
                        let output = dispatch_control_request(&input, &registry, &cooldowns, &config).await;
                        let parts = protocol::encode_frame(Frame::ClientReply {
                            worker_name: "procman".to_string(),
                            output,
                        });
                        let mut out = BytesMut::new();
                        encode_multipart(&parts, &mut out);
                        if stream.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => return,
                },
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

/// `clearWorker`/`restartWorker` (spec §4.7): both take `{"name": "..."}`.
/// `clearWorker` only resets the cooldown so a worker presently sleeping
/// before respawn restarts immediately; `restartWorker` also kills a
/// currently-running instance so the restart happens regardless of state.
async fn dispatch_control_request(
    input: &[u8],
    registry: &Arc<Mutex<Registry>>,
    cooldowns: &Arc<Mutex<HashMap<String, Cooldown>>>,
    config: &Config,
) -> Bytes {
    let request: RequestBody = match serde_json::from_slice(input) {
        Ok(r) => r,
        Err(e) => return encode_control_error("", ReplyStatus::BadArg, e.to_string()),
    };
    let Some(name) = request.args.get("name").and_then(serde_json::Value::as_str) else {
        return encode_control_error(&request.method, ReplyStatus::BadArg, "missing \"name\"".into());
    };

    match request.method.as_str() {
        "clearWorker" => {
            clear_cooldown(cooldowns, name, config).await;
            encode_control_ok(&request.method)
        }
        "restartWorker" => {
            clear_cooldown(cooldowns, name, config).await;
            let pid = registry.lock().await.runtime(name).and_then(|r| r.pid);
            if let Some(pid) = pid {
                kill_gracefully(pid, config.graceful_kill_window, config.kill_wait).await;
            }
            encode_control_ok(&request.method)
        }
        other => encode_control_error(other, ReplyStatus::Unimpl, "no such method".into()),
    }
}

async fn clear_cooldown(cooldowns: &Arc<Mutex<HashMap<String, Cooldown>>>, name: &str, config: &Config) {
    let mut guard = cooldowns.lock().await;
    guard
        .entry(name.to_string())
        .or_insert_with(|| Cooldown::new(config.respawn_backoff_base, config.respawn_backoff_cap))
        .clear();
}

fn encode_control_ok(method: &str) -> Bytes {
    Bytes::from(serde_json::to_vec(&ReplyBody::ok(method, serde_json::Value::Bool(true))).unwrap_or_default())
}

fn encode_control_error(method: &str, status: ReplyStatus, message: String) -> Bytes {
    let reply = ReplyBody::err(method, StatusPayload::new(status, message));
    Bytes::from(serde_json::to_vec(&reply).unwrap_or_default())
}

#[cfg(unix)]
async fn kill_gracefully(pid: u32, graceful_window: Duration, kill_wait: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);
    let _ = kill(nix_pid, Signal::SIGTERM);
    tokio::time::sleep(graceful_window).await;
    let _ = kill(nix_pid, Signal::SIGKILL);
    tokio::time::sleep(kill_wait).await;
}

#[cfg(not(unix))]
async fn kill_gracefully(_pid: u32, _graceful_window: Duration, _kill_wait: Duration) {}

/// Memory guard (spec §4.6): every `memleak_guard_interval`, sample RSS
/// for all running workers and kill any that exceed their configured
/// ceiling so their supervisor task restarts them.
async fn watch_memory(registry: Arc<Mutex<Registry>>, config: Config) {
    loop {
        tokio::time::sleep(config.memleak_guard_interval).await;

        let (pids, reg_snapshot) = {
            let reg = registry.lock().await;
            let pids: Vec<u32> = reg.names().iter().filter_map(|n| reg.runtime(n).and_then(|r| r.pid)).collect();
            (pids, reg)
        };
        let rss = sample_rss(&pids);
        let rss_by_name: HashMap<String, u64> = reg_snapshot
            .names()
            .into_iter()
            .filter_map(|n| {
                let pid = reg_snapshot.runtime(&n)?.pid?;
                rss.get(&pid).map(|bytes| (n, *bytes))
            })
            .collect();
        drop(reg_snapshot);

        let violations = {
            let reg = registry.lock().await;
            memory_guard_violations(&reg, &rss_by_name)
        };
        for name in violations {
            let pid = registry.lock().await.runtime(&name).and_then(|r| r.pid);
            if let Some(pid) = pid {
                tracing::warn!(worker = %name, pid, "memory ceiling exceeded, killing for restart");
                kill_gracefully(pid, config.graceful_kill_window, config.kill_wait).await;
            }
        }
    }
}

/// Emit `start_complete` once every initially-planned worker has either
/// come online or is past a reasonable window to do so (spec §4.7:
/// "emitted exactly once, when the initial start ordering has
/// converged").
async fn report_start_complete(registry: Arc<Mutex<Registry>>, order: Vec<String>, failed: Vec<String>, config: Config) {
    let deadline = Instant::now() + config.hb_interval * 3 * (config.liveness_max.max(1) as u32);
    loop {
        let online: Vec<String> = {
            let reg = registry.lock().await;
            order.iter().filter(|n| reg.runtime(n).is_some_and(|r| r.online)).cloned().collect()
        };
        if online.len() == order.len() || Instant::now() >= deadline {
            let still_pending: Vec<String> = order.iter().filter(|n| !online.contains(n)).cloned().collect();
            let mut failed = failed.clone();
            failed.extend(still_pending);
            tracing::info!(?online, ?failed, "start_complete");
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, requires: &[&str]) -> WorkerDescriptor {
        WorkerDescriptor {
            schema_version: flotilla::procman::registry::CURRENT_SCHEMA_VERSION,
            name: name.to_string(),
            path: "/bin/true".into(),
            args: vec![],
            requires: requires.iter().map(|s| s.to_string()).collect(),
            after: vec![],
            tag: None,
            disabled: false,
            heartbeat_disabled: false,
            debug: false,
            pause_on_start: false,
            memory_ceiling_bytes: None,
        }
    }

    fn cli(just: &[&str], truly_just: &[&str], skip: &[&str]) -> Cli {
        Cli {
            just: just.iter().map(|s| s.to_string()).collect(),
            truly_just: truly_just.iter().map(|s| s.to_string()).collect(),
            skip: skip.iter().map(|s| s.to_string()).collect(),
            reset: false,
            colors: false,
        }
    }

    fn names(descriptors: &[WorkerDescriptor]) -> std::collections::HashSet<String> {
        descriptors.iter().map(|d| d.name.clone()).collect()
    }

    #[test]
    fn select_workers_with_no_filters_returns_everything_enabled() {
        let all = vec![descriptor("a", &[]), descriptor("b", &[])];
        let selected = select_workers(all, &cli(&[], &[], &[]));
        assert_eq!(names(&selected), names(&[descriptor("a", &[]), descriptor("b", &[])]));
    }

    #[test]
    fn select_workers_just_includes_the_require_closure() {
        let all = vec![descriptor("a", &[]), descriptor("b", &["a"]), descriptor("c", &["b"]), descriptor("d", &[])];
        let selected = select_workers(all, &cli(&["c"], &[], &[]));
        assert_eq!(names(&selected), ["a", "b", "c"].into_iter().map(String::from).collect());
    }

    #[test]
    fn select_workers_truly_just_excludes_the_require_closure() {
        let all = vec![descriptor("a", &[]), descriptor("b", &["a"])];
        let selected = select_workers(all, &cli(&[], &["b"], &[]));
        assert_eq!(names(&selected), ["b"].into_iter().map(String::from).collect());
    }

    #[test]
    fn select_workers_skip_applies_after_just() {
        let all = vec![descriptor("a", &[]), descriptor("b", &["a"]), descriptor("c", &["b"])];
        let selected = select_workers(all, &cli(&["c"], &[], &["a"]));
        assert_eq!(names(&selected), ["b", "c"].into_iter().map(String::from).collect());
    }

    #[test]
    fn select_workers_drops_disabled_workers_even_when_named() {
        let mut disabled = descriptor("a", &[]);
        disabled.disabled = true;
        let selected = select_workers(vec![disabled], &cli(&[], &[], &[]));
        assert!(selected.is_empty());
    }

    #[test]
    fn collect_requires_follows_a_chain_without_looping_on_cycles() {
        let by_name: HashMap<String, WorkerDescriptor> = [descriptor("a", &["b"]), descriptor("b", &["a"])]
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let mut seen = std::collections::HashSet::new();
        collect_requires("a", &by_name, &mut seen);
        assert_eq!(seen, ["a", "b"].into_iter().map(String::from).collect());
    }

    #[test]
    fn collect_requires_ignores_a_missing_dependency() {
        let by_name: HashMap<String, WorkerDescriptor> = [descriptor("a", &["ghost"])].into_iter().map(|d| (d.name.clone(), d)).collect();
        let mut seen = std::collections::HashSet::new();
        collect_requires("a", &by_name, &mut seen);
        assert_eq!(seen, ["a"].into_iter().map(String::from).collect());
    }
}

async fn wait_for_exit_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");

        let code = tokio::select! {
            _ = sigint.recv() => EXIT_SIGINT,
            _ = sigterm.recv() => EXIT_SIGTERM,
            _ = sighup.recv() => EXIT_SIGHUP,
        };
        tracing::info!(code, "exiting on signal");
        std::process::exit(code);
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        std::process::exit(EXIT_SIGINT);
    }
}
