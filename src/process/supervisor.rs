//! Spawning, output capture, exit detection and kill for child processes.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::control::{graceful_signal, is_process_alive};
use super::{ProcessRegistry, RunningProcess};
use crate::tunnel::TunnelHandle;
use crate::config::EntryConfig;
use crate::error::{AppError, Result};
use crate::logbook::LogBook;

/// Sent when a child exits with code 0, its way of asking to be restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub instance_id: String,
    pub pid: u32,
}

/// A freshly spawned child. `exited` fires once the exit watcher has
/// finished with it, restart request included.
#[derive(Debug, Clone)]
pub struct SpawnedChild {
    pub pid: u32,
    pub exited: CancellationToken,
}

pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
    logbook: Arc<LogBook>,
    entry: EntryConfig,
    restarts: mpsc::UnboundedSender<RestartRequest>,
}

impl Supervisor {
    pub fn new(
        entry: EntryConfig,
        registry: Arc<ProcessRegistry>,
        logbook: Arc<LogBook>,
    ) -> (Self, mpsc::UnboundedReceiver<RestartRequest>) {
        let (restarts, rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                logbook,
                entry,
                restarts,
            },
            rx,
        )
    }

    fn build_command(&self, workspace: &Path, port: u16) -> Command {
        let mut cmd = Command::new(&self.entry.program);
        cmd.args(&self.entry.args)
            .arg(self.entry.port_arg.replace("{port}", &port.to_string()))
            .current_dir(workspace)
            // Children get no environment at all, so parent secrets never leak into them.
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd
    }

    /// Spawn the child for `instance_id` on `port` and register it.
    ///
    /// Fails if the instance already has a registered process.
    pub fn spawn(&self, instance_id: &str, port: u16, workspace: &Path) -> Result<SpawnedChild> {
        if self.registry.contains(instance_id) {
            return Err(AppError::instance_running());
        }

        let mut child = self
            .build_command(workspace, port)
            .spawn()
            .map_err(|e| AppError::process(format!("Failed to start instance: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::process("Failed to get process ID"))?;

        let process = RunningProcess::new(instance_id, pid, port);
        let stopping = process.stopping.clone();
        if let Err(e) = self.registry.insert(process) {
            let _ = child.start_kill();
            return Err(e);
        }

        if let Some(stdout) = child.stdout.take() {
            self.pump_lines(instance_id, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump_lines(instance_id, stderr);
        }

        let id = instance_id.to_string();
        let registry = Arc::clone(&self.registry);
        let logbook = Arc::clone(&self.logbook);
        let restarts = self.restarts.clone();
        let exited = CancellationToken::new();
        let exited_guard = exited.clone().drop_guard();
        tokio::spawn(async move {
            let _exited = exited_guard;
            let status = child.wait().await;
            let description = match &status {
                Ok(status) => describe_exit(status),
                Err(e) => format!("could not be waited on: {e}"),
            };
            logbook.append(&id, format!("Child process {pid} {description}"));

            if stopping.is_cancelled() {
                return;
            }
            let Some(process) = registry.remove_if_pid(&id, pid) else {
                return;
            };
            process.release();

            let clean = matches!(&status, Ok(status) if status.code() == Some(0));
            if clean {
                logbook.append(&id, "Exit code 0 requests a restart; restarting shortly...");
                let _ = restarts.send(RestartRequest {
                    instance_id: id,
                    pid,
                });
            }
        });

        Ok(SpawnedChild { pid, exited })
    }

    fn pump_lines<R>(&self, instance_id: &str, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let id = instance_id.to_string();
        let logbook = Arc::clone(&self.logbook);
        let mut lines = BufReader::new(stream).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                logbook.append(&id, format!("{}: {}", id, line));
            }
        });
    }

    /// Send the graceful termination signal and close the tunnel.
    /// Returns the pid that was signalled, or `None` if nothing was running.
    pub fn kill(&self, instance_id: &str) -> Option<u32> {
        let process = self.registry.remove(instance_id)?;
        Some(self.terminate(process))
    }

    /// Like [`kill`](Self::kill), but only if `pid` is still the registered process.
    pub fn kill_pid(&self, instance_id: &str, pid: u32) -> Option<u32> {
        let process = self.registry.remove_if_pid(instance_id, pid)?;
        Some(self.terminate(process))
    }

    fn terminate(&self, process: RunningProcess) -> u32 {
        let id = process.instance_id.clone();
        let pid = process.release();
        if !is_process_alive(pid) {
            log::debug!("Instance {} (pid {}) already exited", id, pid);
            return pid;
        }
        if let Err(e) = graceful_signal(pid) {
            log::warn!("Failed to signal instance {} (pid {}): {}", id, pid, e);
        }
        pid
    }

    /// Stop every tracked child and wait for their tunnels to close.
    /// Used on supervisor shutdown.
    pub async fn stop_all(&self) {
        let mut tunnels = Vec::new();
        for mut process in self.registry.drain() {
            log::info!(
                "Stopping instance {} (pid: {}, port: {})",
                process.instance_id,
                process.pid,
                process.port
            );
            tunnels.extend(process.tunnel.take());
            self.terminate(process);
        }
        futures_util::future::join_all(tunnels.into_iter().map(TunnelHandle::close_and_join))
            .await;
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "exited".to_string(),
    }
}
