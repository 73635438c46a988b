//! Instance CRUD operations.

use super::lifecycle::InstanceController;
use super::types::{InstanceDetail, InstancePatch, InstanceSummary, DEFAULT_TITLE};
use crate::error::{AppError, Result};
use crate::logbook::LogEntry;
use crate::paths::workspace_dir;
use crate::store::InstanceRecord;
use crate::validation::validate_instance_id;

impl InstanceController {
    /// Create a new, stopped instance. A missing or blank title becomes the default.
    pub fn create(&self, instance_id: &str, title: Option<&str>) -> Result<InstanceSummary> {
        validate_instance_id(instance_id)?;

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);
        let record = InstanceRecord::new(instance_id, title);
        self.store.insert(record.clone())?;

        log::info!("Created instance {} ({})", instance_id, title);
        Ok(InstanceSummary::new(&record, &self.registry))
    }

    pub fn patch(&self, instance_id: &str, patch: InstancePatch) -> Result<InstanceSummary> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(AppError::other("title must be a non-empty string"));
            }
        }

        let record = self.store.update(instance_id, |record| {
            if let Some(title) = patch.title {
                record.title = title.trim().to_string();
            }
            if let Some(auto_start) = patch.auto_start {
                record.auto_start = auto_start;
            }
            if let Some(port) = patch.fixed_port {
                record.fixed_port = (port != 0).then_some(port);
            }
            Ok(record.clone())
        })?;
        Ok(InstanceSummary::new(&record, &self.registry))
    }

    pub fn list(&self) -> Vec<InstanceSummary> {
        self.store
            .list()
            .iter()
            .map(|record| InstanceSummary::new(record, &self.registry))
            .collect()
    }

    pub fn get(&self, instance_id: &str) -> Result<InstanceDetail> {
        let record = self
            .store
            .get(instance_id)
            .ok_or_else(|| AppError::instance_not_found(instance_id))?;
        Ok(InstanceDetail {
            summary: InstanceSummary::new(&record, &self.registry),
            log: self.logbook.entries(instance_id),
        })
    }

    pub fn log(&self, instance_id: &str) -> Result<Vec<LogEntry>> {
        if self.store.get(instance_id).is_none() {
            return Err(AppError::instance_not_found(instance_id));
        }
        Ok(self.logbook.entries(instance_id))
    }

    /// The admin password set by bootstrap. Only handed out while the instance is stopped.
    pub fn admin_password(&self, instance_id: &str) -> Result<Option<String>> {
        let record = self
            .store
            .get(instance_id)
            .ok_or_else(|| AppError::instance_not_found(instance_id))?;
        if self.is_busy(instance_id) {
            return Err(AppError::instance_running());
        }
        Ok(record.admin_password)
    }

    /// Delete a stopped instance along with its workspace and remote link.
    pub fn delete(&self, instance_id: &str) -> Result<()> {
        validate_instance_id(instance_id)?;

        if self.store.get(instance_id).is_none() {
            return Err(AppError::instance_not_found(instance_id));
        }
        if self.is_busy(instance_id) {
            return Err(AppError::instance_running());
        }
        self.cancel_pending_restart(instance_id);

        let workspace = workspace_dir(&self.config.data_dir, instance_id);
        if workspace.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workspace) {
                log::warn!(
                    "Failed to remove workspace {:?}: {}",
                    workspace,
                    e
                );
            }
        }

        self.store.remove_remote_link(instance_id)?;
        self.store.remove(instance_id)?;
        self.logbook.forget(instance_id);

        log::info!("Deleted instance {}", instance_id);
        Ok(())
    }
}
