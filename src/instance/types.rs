//! Instance-related type definitions.

use serde::{Deserialize, Serialize};

use crate::logbook::LogEntry;
use crate::process::ProcessRegistry;
use crate::store::InstanceRecord;

/// Title given to instances created without one.
pub const DEFAULT_TITLE: &str = "New instance";

/// The user a start is performed for; becomes administrator on first bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Started,
    Stopped,
}

/// Derived status: `started` iff a process is registered for the id.
pub fn status(instance_id: &str, registry: &ProcessRegistry) -> InstanceStatus {
    if registry.contains(instance_id) {
        InstanceStatus::Started
    } else {
        InstanceStatus::Stopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeInfo {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub title: String,
    pub status: InstanceStatus,
    pub auto_start: bool,
    pub fixed_port: Option<u16>,
    pub runtime_info: Option<RuntimeInfo>,
}

impl InstanceSummary {
    pub fn new(record: &InstanceRecord, registry: &ProcessRegistry) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            status: status(&record.id, registry),
            auto_start: record.auto_start,
            fixed_port: record.fixed_port,
            runtime_info: registry.port(&record.id).map(|port| RuntimeInfo { port }),
        }
    }
}

/// Summary plus the instance log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub summary: InstanceSummary,
    pub log: Vec<LogEntry>,
}

/// Partial update accepted by `patch`. `fixed_port = Some(0)` clears the fixed port.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub auto_start: Option<bool>,
    #[serde(default)]
    pub fixed_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { port: u16 },
    /// Already running or already starting; nothing was done.
    AlreadyRunning,
    /// The child never answered its health check and was torn down.
    NotReady,
    /// The child exited before it answered. An exit code of 0 still gets
    /// its restart.
    Exited,
    /// A stop arrived while starting.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}
