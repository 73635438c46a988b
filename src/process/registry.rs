//! In-memory table of running child processes.

use std::collections::HashMap;
use std::sync::RwLock;

use super::RunningProcess;
use crate::error::{AppError, Result};
use crate::tunnel::TunnelHandle;

/// At most one [`RunningProcess`] per instance id. The backing map is never
/// handed out; callers get copies of the fields they ask for.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: RwLock<HashMap<String, RunningProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, process: RunningProcess) -> Result<()> {
        let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
        if procs.contains_key(&process.instance_id) {
            return Err(AppError::instance_running());
        }
        procs.insert(process.instance_id.clone(), process);
        Ok(())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.contains_key(instance_id)
    }

    /// Get the port for an instance.
    pub fn port(&self, instance_id: &str) -> Option<u16> {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.get(instance_id).map(|p| p.port)
    }

    pub fn pid(&self, instance_id: &str) -> Option<u32> {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.get(instance_id).map(|p| p.pid)
    }

    pub fn has_tunnel(&self, instance_id: &str) -> bool {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.get(instance_id).is_some_and(RunningProcess::has_tunnel)
    }

    /// Id of the instance currently running on `port`, if any.
    pub fn port_owner(&self, port: u16) -> Option<String> {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs
            .values()
            .find(|p| p.port == port)
            .map(|p| p.instance_id.clone())
    }

    /// Attach a tunnel to the process `pid` of `instance_id`. Hands the
    /// tunnel back if that process is no longer registered.
    pub fn attach_tunnel(
        &self,
        instance_id: &str,
        pid: u32,
        tunnel: TunnelHandle,
    ) -> std::result::Result<(), TunnelHandle> {
        let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
        match procs.get_mut(instance_id) {
            Some(process) if process.pid == pid => {
                if let Some(old) = process.tunnel.replace(tunnel) {
                    old.close();
                }
                Ok(())
            }
            _ => Err(tunnel),
        }
    }

    /// Remove an instance from tracking and return its process info.
    pub fn remove(&self, instance_id: &str) -> Option<RunningProcess> {
        let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
        procs.remove(instance_id)
    }

    /// Remove the entry only if it still belongs to `pid`; a newer process
    /// registered under the same id is left alone.
    pub fn remove_if_pid(&self, instance_id: &str, pid: u32) -> Option<RunningProcess> {
        let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
        if procs.get(instance_id).is_some_and(|p| p.pid == pid) {
            procs.remove(instance_id)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn drain(&self) -> Vec<RunningProcess> {
        let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
        procs.drain().map(|(_, p)| p).collect()
    }
}
