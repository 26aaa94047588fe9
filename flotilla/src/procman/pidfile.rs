//! PID-file / identity (C8): the five-step takeover protocol from spec
//! §4.8, used by both the broker and procman binaries to claim their own
//! pid file at startup.

use std::path::Path;
use std::time::Duration;

use flotilla_core::error::{FlotillaError, ReplyStatus};

use crate::config::ProcessType;

/// Options for [`update_pid_file`].
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    pub process_type: Option<ProcessType>,
    pub kill_current: bool,
    pub graceful_kill_window: Duration,
    pub kill_wait: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            process_type: None,
            kill_current: false,
            graceful_kill_window: crate::config::GRACEFUL_KILL_WINDOW,
            kill_wait: crate::config::KILL_WAIT,
        }
    }
}

/// Claim `path` for the current process, following spec §4.8's five
/// steps.
///
/// # Errors
///
/// Returns [`ReplyStatus::Exists`] if a live process with a matching
/// identity already owns the file and `kill_current` was not set.
pub fn update_pid_file(path: &Path, opts: UpdateOptions) -> Result<(), FlotillaError> {
    let my_pid = std::process::id();

    // Step 1: absent -> claim.
    let Ok(existing) = std::fs::read_to_string(path) else {
        return write_pid(path, my_pid);
    };
    let Ok(existing_pid) = existing.trim().parse::<u32>() else {
        return write_pid(path, my_pid);
    };

    // Step 2: dead -> overwrite.
    if !process_alive(existing_pid) {
        return write_pid(path, my_pid);
    }

    // Step 3: alive — if we can read the other process's environment and
    // its declared process type doesn't match ours, it's a different
    // logical role reusing a stale path; overwrite.
    if let Some(want) = opts.process_type {
        if let Some(other_type) = read_process_type_env(existing_pid) {
            if other_type != want.as_str() {
                return write_pid(path, my_pid);
            }
        }
    }

    // Step 4: live match and caller asked to take over.
    if opts.kill_current {
        graceful_kill(existing_pid, opts.graceful_kill_window, opts.kill_wait)?;
        return write_pid(path, my_pid);
    }

    // Step 5: otherwise, refuse.
    Err(FlotillaError::reply(
        ReplyStatus::Exists,
        format!("pid file {} is live-owned by pid {existing_pid}", path.display()),
    ))
}

fn write_pid(path: &Path, pid: u32) -> Result<(), FlotillaError> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    // Atomic replace: write to a sibling temp file, then rename (spec §5
    // "written atomically").
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(pid.to_string().as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read whatever pid a pid file currently names, without judging whether
/// it is alive.
#[must_use]
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Public wrapper over the signal-0 liveness probe, used by the broker's
/// procman-heartbeat watchdog (spec §4.3: "if the procman PID is no
/// longer alive, the broker exits with a non-zero status").
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    process_alive(pid)
}

/// Signal-0 liveness probe: does not actually signal the process, just
/// checks whether the kernel still has a pid table entry for it.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM: the pid exists but belongs to another user — still alive.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Best-effort read of another process's `NEF_PROCESS_TYPE` environment
/// variable via `/proc/<pid>/environ` on platforms that expose it.
///
/// Per spec §9's design note: "where the OS does not expose a process's
/// environment to other processes, the fallback is best-effort overwrite"
/// — returning `None` here makes step 3 a no-op, falling through to the
/// live-match path, which is the documented reduced invariant.
#[cfg(target_os = "linux")]
fn read_process_type_env(pid: u32) -> Option<String> {
    let environ = std::fs::read(format!("/proc/{pid}/environ")).ok()?;
    environ
        .split(|b| *b == 0)
        .find_map(|entry| {
            let s = std::str::from_utf8(entry).ok()?;
            s.strip_prefix("NEF_PROCESS_TYPE=").map(str::to_string)
        })
}

#[cfg(not(target_os = "linux"))]
fn read_process_type_env(_pid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn graceful_kill(pid: u32, graceful_window: Duration, kill_wait: Duration) -> Result<(), FlotillaError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);
    let _ = kill(nix_pid, Signal::SIGTERM);
    let deadline = std::time::Instant::now() + graceful_window;
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let _ = kill(nix_pid, Signal::SIGKILL);
    let deadline = std::time::Instant::now() + kill_wait;
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    Err(FlotillaError::reply(
        ReplyStatus::Internal,
        format!("pid {pid} survived SIGKILL within {kill_wait:?}"),
    ))
}

#[cfg(not(unix))]
fn graceful_kill(_pid: u32, _graceful_window: Duration, _kill_wait: Duration) -> Result<(), FlotillaError> {
    Err(FlotillaError::reply(ReplyStatus::Internal, "graceful kill unsupported on this platform".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_absent_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.pid");
        update_pid_file(&path, UpdateOptions::default()).unwrap();
        let written: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id());
    }

    #[test]
    fn overwrites_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.pid");
        // pid 1 is assumed unreachable for signal 0 in the test sandbox's
        // namespace, but to keep this hermetic we use an implausibly large
        // pid instead, which `kill` reports as not alive (ESRCH).
        std::fs::write(&path, "999999999").unwrap();
        update_pid_file(&path, UpdateOptions::default()).unwrap();
        let written: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id());
    }

    #[test]
    fn refuses_live_owner_without_kill_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.pid");
        // Our own pid is obviously alive; simulate a foreign live owner.
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let err = update_pid_file(
            &path,
            UpdateOptions {
                process_type: None,
                kill_current: false,
                ..UpdateOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.reply_status(), Some(ReplyStatus::Exists));
    }
}
