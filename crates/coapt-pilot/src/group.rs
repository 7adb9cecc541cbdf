//! Process-group termination with signal escalation.
//!
//! Every host the harness spawns leads its own process group, so a single
//! group signal reaches the wrapper shell, the build tool and the actual
//! device binary together. SIGTERM goes first; members still running after
//! the grace period receive SIGKILL.
//!
//! # Safety rails
//!
//! - Refuses to target group 0, group 1 or the harness's own group.
//! - Handles ESRCH (group already gone) without error.
//! - Handles EPERM by logging and reporting the group as unreachable.

use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use coapt_types::CoaptError;

/// Timing for [`kill_group`].
#[derive(Debug, Clone)]
pub struct GroupKillConfig {
    /// Time between SIGTERM and SIGKILL escalation.
    pub grace_period: Duration,
    /// Polling interval while waiting for members to exit.
    pub poll_interval: Duration,
}

impl Default for GroupKillConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// What [`kill_group`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// No member of the group was running.
    AlreadyGone,
    /// Every member exited after SIGTERM.
    Terminated,
    /// At least one member needed SIGKILL.
    Killed,
}

fn validate_pgid(pgid: i32) -> Result<(), CoaptError> {
    if pgid <= 1 {
        return Err(CoaptError::SignalError(format!(
            "refusing to signal process group {pgid}"
        )));
    }
    if pgid == nix::unistd::getpgrp().as_raw() {
        return Err(CoaptError::SignalError(format!(
            "refusing to signal our own process group {pgid}"
        )));
    }
    Ok(())
}

/// Send a signal to a whole group.
///
/// Returns `Ok(false)` if the group no longer exists or we lack permission.
fn send_group_signal(pgid: i32, sig: Signal) -> Result<bool, CoaptError> {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => {
            debug!(pgid, signal = ?sig, "signal sent to process group");
            Ok(true)
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pgid, signal = ?sig, "process group already gone (ESRCH)");
            Ok(false)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!(pgid, signal = ?sig, "permission denied signalling process group");
            Ok(false)
        }
        Err(e) => Err(CoaptError::SignalError(format!(
            "failed to send {sig:?} to process group {pgid}: {e}"
        ))),
    }
}

/// Whether any member of the group is still running.
///
/// Zombies do not count: an unreaped group leader has finished even though
/// its pid is still allocated.
#[cfg(target_os = "linux")]
pub fn group_alive(pgid: i32) -> bool {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return signal::killpg(Pid::from_raw(pgid), None).is_ok(),
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((state, pgrp)) = parse_stat(&stat) {
            if pgrp == pgid && state != 'Z' && state != 'X' {
                return true;
            }
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
pub fn group_alive(pgid: i32) -> bool {
    signal::killpg(Pid::from_raw(pgid), None).is_ok()
}

/// Extract `(state, pgrp)` from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Terminate every process in group `pgid`.
///
/// Sends SIGTERM, polls until the group is empty or the grace period runs
/// out, then sends SIGKILL to whatever is left. A zero grace period sends
/// SIGKILL straight away.
pub fn kill_group(pgid: i32, config: &GroupKillConfig) -> Result<KillOutcome, CoaptError> {
    validate_pgid(pgid)?;

    if !group_alive(pgid) {
        debug!(pgid, "process group has no running members");
        return Ok(KillOutcome::AlreadyGone);
    }

    if config.grace_period.is_zero() {
        send_group_signal(pgid, Signal::SIGKILL)?;
        info!(pgid, "process group killed");
        return Ok(KillOutcome::Killed);
    }

    if !send_group_signal(pgid, Signal::SIGTERM)? {
        return Ok(KillOutcome::AlreadyGone);
    }

    let deadline = Instant::now() + config.grace_period;
    loop {
        if !group_alive(pgid) {
            info!(pgid, "process group exited after SIGTERM");
            return Ok(KillOutcome::Terminated);
        }
        if Instant::now() >= deadline {
            warn!(pgid, "grace period expired, escalating to SIGKILL");
            send_group_signal(pgid, Signal::SIGKILL)?;
            return Ok(KillOutcome::Killed);
        }
        std::thread::sleep(config.poll_interval);
    }
}
