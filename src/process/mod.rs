//! Child process supervision: ports, readiness, spawning and the registry.

mod control;
mod health;
mod registry;
mod supervisor;

use tokio_util::sync::CancellationToken;

use crate::tunnel::TunnelHandle;

pub use control::find_available_port;
pub use health::{Readiness, ReadinessProber};
pub use registry::ProcessRegistry;
pub use supervisor::{RestartRequest, SpawnedChild, Supervisor};

/// A live child process. Held only in the in-memory [`ProcessRegistry`].
#[derive(Debug)]
pub struct RunningProcess {
    pub instance_id: String,
    pub pid: u32,
    pub port: u16,
    pub(crate) tunnel: Option<TunnelHandle>,
    /// Cancelled when the process is stopped on purpose; the exit watcher
    /// uses it to tell a requested stop from a crash or self-restart.
    pub(crate) stopping: CancellationToken,
}

impl RunningProcess {
    pub(crate) fn new(instance_id: &str, pid: u32, port: u16) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            pid,
            port,
            tunnel: None,
            stopping: CancellationToken::new(),
        }
    }

    pub fn has_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Mark as deliberately stopped and close the tunnel, if any.
    pub(crate) fn release(mut self) -> u32 {
        self.stopping.cancel();
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close();
        }
        self.pid
    }
}
