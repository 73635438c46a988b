//! Platform-specific process control and port helpers.

use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Ask a process to terminate. Does not wait for it to exit.
///
/// Children are spawned as process group leaders, so the whole group is
/// signalled; a plain process is signalled directly.
#[cfg(unix)]
pub fn graceful_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let pid_t = Pid::from_raw(pid as i32);
    if killpg(pid_t, Signal::SIGTERM).is_ok() {
        return Ok(());
    }
    kill(pid_t, Signal::SIGTERM)
        .map_err(|e| AppError::process(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

/// Ask a process to terminate. Does not wait for it to exit.
#[cfg(not(unix))]
pub fn graceful_signal(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            stderr.trim()
        )))
    }
}

/// Let the OS pick a free TCP port. The port is released before returning,
/// so another process may grab it first; the child then fails to bind and
/// that surfaces as a readiness timeout.
pub fn find_available_port() -> Result<u16> {
    portpicker::pick_unused_port().ok_or_else(|| AppError::process("No free TCP port available"))
}
