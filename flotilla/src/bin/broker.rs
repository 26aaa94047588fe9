//! `flotilla-broker`: the broker process.
//!
//! Binds the client/worker TCP endpoint (and, if `BROKER_IPC_FILE` is set,
//! a Unix-domain IPC endpoint), claims its pid file, and runs the
//! Majordomo-like dispatch loop described in `flotilla::broker`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use flotilla_core::events::{EventsCmd, EventsHub, EventsHubEvent};
use flotilla_core::router::{HubEvent, RouterBehavior, RouterCmd, RouterHub};
use flotilla_wire::protocol::{encode_frame, Frame};

use flotilla::broker::session::run_connection;
use flotilla::broker::BrokerCore;
use flotilla::config::{Config, ProcessType};
use flotilla::procman::pidfile::{is_process_alive, read_pid, update_pid_file, UpdateOptions};

/// Monotone per-process routing id generator: one TCP/IPC connection gets
/// exactly one routing id for its lifetime, used only to key `RouterHub`'s
/// peer map (never sent on the wire, see `broker::session`).
static NEXT_ROUTING_ID: AtomicU64 = AtomicU64::new(1);

fn next_routing_id() -> Bytes {
    Bytes::from(format!("conn-{}", NEXT_ROUTING_ID.fetch_add(1, Ordering::Relaxed)))
}

/// What the core dispatch task reacts to: either a decoded envelope from
/// some connection, or a periodic housekeeping tick.
enum CoreEvent {
    Inbound(Bytes, Frame),
    HeartbeatTick,
    TimeoutSweep,
    ProtectTimeSweep,
}

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    flotilla::config::init_tracing();
    let config = Config::from_env()?;

    update_pid_file(
        &config.pid_file_path(ProcessType::Broker),
        UpdateOptions {
            process_type: Some(ProcessType::Broker),
            kill_current: std::env::var_os("BROKER_TAKE_OVER").is_some(),
            ..UpdateOptions::default()
        },
    )?;

    let (events_hub_tx, events_hub_rx) = flume::unbounded::<EventsHubEvent>();
    let (events_pub_tx, events_pub_rx) = flume::unbounded::<EventsCmd>();
    compio::runtime::spawn(EventsHub::new(events_hub_rx, events_pub_rx).run()).detach();

    let (hub_event_tx, hub_event_rx) = flume::unbounded::<HubEvent>();
    let (router_user_tx, router_user_rx) = flume::unbounded::<RouterCmd>();
    compio::runtime::spawn(RouterHub::new(hub_event_rx, router_user_rx, RouterBehavior::Standard).run()).detach();

    let (inbound_tx, inbound_rx) = flume::unbounded::<(Bytes, Frame)>();
    let (core_event_tx, core_event_rx) = flume::unbounded::<CoreEvent>();

    // Fan the raw frame channel into the merged core-event channel.
    {
        let core_event_tx = core_event_tx.clone();
        compio::runtime::spawn(async move {
            while let Ok((routing_id, frame)) = inbound_rx.recv_async().await {
                if core_event_tx.send(CoreEvent::Inbound(routing_id, frame)).is_err() {
                    break;
                }
            }
        })
        .detach();
    }

    spawn_ticker(core_event_tx.clone(), config.hb_interval, CoreEvent::heartbeat_tick);
    spawn_ticker(core_event_tx.clone(), Duration::from_millis(250), CoreEvent::timeout_sweep);
    spawn_ticker(core_event_tx, Duration::from_millis(500), CoreEvent::protect_time_sweep);

    compio::runtime::spawn(run_core(
        core_event_rx,
        router_user_tx,
        events_pub_tx,
        config.liveness_max,
        config.protect_time,
    ))
    .detach();

    compio::runtime::spawn(watch_procman(config.pid_file_path(ProcessType::Procman), config.hb_interval)).detach();

    let tcp_addr = match &config.broker_tcp {
        flotilla_core::endpoint::Endpoint::Tcp(addr) => *addr,
        #[allow(unreachable_patterns)]
        _ => unreachable!("broker_tcp is always constructed as Endpoint::Tcp"),
    };
    let listener = compio::net::TcpListener::bind(tcp_addr).await?;
    tracing::info!(addr = %tcp_addr, "broker listening (tcp)");

    #[cfg(unix)]
    if let Some(ipc_path) = config.broker_ipc_file.clone() {
        let hub_event_tx = hub_event_tx.clone();
        let inbound_tx = inbound_tx.clone();
        compio::runtime::spawn(async move {
            if let Err(e) = accept_ipc_loop(ipc_path, hub_event_tx, inbound_tx).await {
                tracing::error!(error = %e, "ipc accept loop exited");
            }
        })
        .detach();
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted connection");
                let routing_id = next_routing_id();
                let hub_event_tx = hub_event_tx.clone();
                let inbound_tx = inbound_tx.clone();
                compio::runtime::spawn(run_connection(stream, routing_id, hub_event_tx, inbound_tx)).detach();
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

#[cfg(unix)]
async fn accept_ipc_loop(
    path: std::path::PathBuf,
    hub_event_tx: flume::Sender<HubEvent>,
    inbound_tx: flume::Sender<(Bytes, Frame)>,
) -> std::io::Result<()> {
    let _ = std::fs::remove_file(&path);
    let listener = compio::net::UnixListener::bind(&path)?;
    tracing::info!(path = %path.display(), "broker listening (ipc)");
    loop {
        let (stream, _addr) = listener.accept().await?;
        let routing_id = next_routing_id();
        compio::runtime::spawn(run_connection(stream, routing_id, hub_event_tx.clone(), inbound_tx.clone())).detach();
    }
}

/// Watch procman's pid file; if it names a pid that is no longer alive,
/// the broker has no supervisor left and exits non-zero (spec §4.3: "a
/// special loop watches the procman pseudo-worker's heartbeat").
///
/// Does nothing until procman has written its pid file at least once, so
/// the broker does not exit before procman has had a chance to start.
async fn watch_procman(procman_pid_file: std::path::PathBuf, interval: Duration) {
    loop {
        compio::time::sleep(interval).await;
        let Some(pid) = read_pid(&procman_pid_file) else {
            continue;
        };
        if !is_process_alive(pid) {
            tracing::error!(pid, "procman is no longer alive, exiting");
            std::process::exit(2);
        }
    }
}

fn spawn_ticker(tx: flume::Sender<CoreEvent>, interval: Duration, make: fn() -> CoreEvent) {
    compio::runtime::spawn(async move {
        loop {
            compio::time::sleep(interval).await;
            if tx.send(make()).is_err() {
                break;
            }
        }
    })
    .detach();
}

impl CoreEvent {
    const fn heartbeat_tick() -> Self {
        Self::HeartbeatTick
    }
    const fn timeout_sweep() -> Self {
        Self::TimeoutSweep
    }
    const fn protect_time_sweep() -> Self {
        Self::ProtectTimeSweep
    }
}

async fn run_core(
    core_event_rx: flume::Receiver<CoreEvent>,
    router_user_tx: flume::Sender<RouterCmd>,
    events_pub_tx: flume::Sender<EventsCmd>,
    liveness_max: i32,
    protect_time: Duration,
) {
    let mut core = BrokerCore::new(events_pub_tx, liveness_max, protect_time);

    while let Ok(event) = core_event_rx.recv_async().await {
        let outbound = match event {
            CoreEvent::Inbound(routing_id, frame) => core.handle_frame(routing_id, frame),
            CoreEvent::HeartbeatTick => {
                core.heartbeat_tick();
                Vec::new()
            }
            CoreEvent::TimeoutSweep => core.sweep_timeouts(Instant::now()),
            CoreEvent::ProtectTimeSweep => core.sweep_protect_time(Instant::now()),
        };

        for (target, frame) in outbound {
            let mut parts = vec![target, Bytes::new()];
            parts.extend(encode_frame(frame));
            let _ = router_user_tx.send(RouterCmd::SendMessage(parts));
        }
    }
}
