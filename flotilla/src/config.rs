//! Runtime configuration: environment variables, transport endpoints, and
//! the tunable knobs named throughout the specification (heartbeat
//! interval, cooldown backoff, memory-guard interval, graceful-kill
//! windows, protect-time).

use flotilla_core::endpoint::Endpoint;
use std::path::PathBuf;
use std::time::Duration;

/// `NEF_PROCESS_TYPE` values used for pid-file ownership disambiguation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Broker,
    Procman,
}

impl ProcessType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Procman => "procman",
        }
    }
}

impl std::str::FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broker" => Ok(Self::Broker),
            "procman" => Ok(Self::Procman),
            other => Err(format!("unknown NEF_PROCESS_TYPE {other:?}")),
        }
    }
}

/// Heartbeat tick interval (spec §4.2: "every `HB_INTERVAL` (e.g. 2.5 s)").
pub const HB_INTERVAL: Duration = Duration::from_millis(2500);

/// Initial/reset liveness counter (spec §3: "default 5").
pub const LIVENESS_MAX: i32 = 5;

/// Default respawn backoff base (spec P6: `min(base * 2^(k-1), cap)`).
///
/// Open Question resolution: the specification leaves `base` unstated and
/// only constrains it via end-to-end scenario 5 (respawnDelay reaches
/// >= 4s within a handful of rapid crashes). A 1-second base matches that
/// scenario (1, 2, 4, 8, ... seconds) and is the conventional default for
/// this backoff shape.
pub const RESPAWN_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap on respawn backoff (spec §3: "e.g. 60 s").
pub const RESPAWN_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Window after process start within which an unclean exit counts toward
/// backoff escalation (spec §4.6: "within a stable-window after start
/// (e.g. < 60 s)").
pub const STABLE_WINDOW: Duration = Duration::from_secs(60);

/// Graceful-kill SIGTERM wait before SIGKILL (spec §4.6/§4.8: "20 s").
pub const GRACEFUL_KILL_WINDOW: Duration = Duration::from_secs(20);

/// Wait after SIGKILL before giving up (spec §4.6/§4.8: "5 s").
pub const KILL_WAIT: Duration = Duration::from_secs(5);

/// Memory-guard RSS sampling interval (spec §4.6: "default ~5 min").
pub const MEMLEAK_GUARD_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Grace period after a worker disconnects before its connection state is
/// torn down, allowing a short window for reconnect (spec §9 Open
/// Question, resolved to the suggested default).
pub const PROTECT_TIME: Duration = Duration::from_secs(10);

/// Default TCP port for the broker's loopback endpoint.
pub const DEFAULT_BROKER_PORT: u16 = 5571;

/// Default TCP port for procman's control endpoint (`clearWorker` /
/// `restartWorker`, spec §4.7).
pub const DEFAULT_PROCMAN_PORT: u16 = 5572;

/// Runtime configuration assembled from environment variables and CLI
/// flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for pid files and the persistent worker table
    /// (`NEF_VAR`).
    pub var_dir: PathBuf,
    /// Path to the generated host-id file (`HOSTID_FILE`).
    pub hostid_file: PathBuf,
    /// IPC transport endpoint (`BROKER_IPC_FILE`), if configured.
    pub broker_ipc_file: Option<PathBuf>,
    /// TCP transport endpoint the broker binds to.
    pub broker_tcp: Endpoint,
    /// TCP endpoint procman binds its own control listener to
    /// (`clearWorker`/`restartWorker`, spec §4.7).
    pub procman_tcp: Endpoint,
    pub hb_interval: Duration,
    pub liveness_max: i32,
    pub respawn_backoff_base: Duration,
    pub respawn_backoff_cap: Duration,
    pub stable_window: Duration,
    pub graceful_kill_window: Duration,
    pub kill_wait: Duration,
    pub memleak_guard_interval: Duration,
    pub protect_time: Duration,
}

impl Config {
    /// Load configuration from the environment, falling back to the
    /// documented defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `BROKER_IPC_FILE` or the TCP port override is
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var_dir = std::env::var_os("NEF_VAR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("flotilla"));

        let hostid_file = std::env::var_os("HOSTID_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| var_dir.join("hostid"));

        let broker_ipc_file = std::env::var_os("BROKER_IPC_FILE").map(PathBuf::from);

        let port: u16 = match std::env::var("BROKER_TCP_PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidPort(v.clone()))?,
            Err(_) => DEFAULT_BROKER_PORT,
        };
        let broker_tcp = Endpoint::parse(&format!("tcp://127.0.0.1:{port}"))
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;

        let procman_port: u16 = match std::env::var("PROCMAN_TCP_PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidPort(v.clone()))?,
            Err(_) => DEFAULT_PROCMAN_PORT,
        };
        let procman_tcp = Endpoint::parse(&format!("tcp://127.0.0.1:{procman_port}"))
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;

        Ok(Self {
            var_dir,
            hostid_file,
            broker_ipc_file,
            broker_tcp,
            procman_tcp,
            hb_interval: HB_INTERVAL,
            liveness_max: LIVENESS_MAX,
            respawn_backoff_base: RESPAWN_BACKOFF_BASE,
            respawn_backoff_cap: RESPAWN_BACKOFF_CAP,
            stable_window: STABLE_WINDOW,
            graceful_kill_window: GRACEFUL_KILL_WINDOW,
            kill_wait: KILL_WAIT,
            memleak_guard_interval: MEMLEAK_GUARD_INTERVAL,
            protect_time: PROTECT_TIME,
        })
    }

    #[must_use]
    pub fn pid_file_path(&self, process_type: ProcessType) -> PathBuf {
        self.var_dir.join(format!("{}.pid", process_type.as_str()))
    }

    #[must_use]
    pub fn worker_table_path(&self) -> PathBuf {
        self.var_dir.join("workers.json")
    }
}

/// Configuration parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid BROKER_TCP_PORT: {0}")]
    InvalidPort(String),
    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Install the ambient logging sink.
///
/// Reads `RUST_LOG` via `tracing_subscriber::EnvFilter`, defaulting to
/// `info` when unset.
pub fn init_tracing() {
    init_tracing_with_ansi(true);
}

/// Like [`init_tracing`], but lets the caller force ANSI color codes on
/// (procman's `-c`/`--colors` flag) regardless of terminal detection.
pub fn init_tracing_with_ansi(ansi: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
        .try_init();
}
