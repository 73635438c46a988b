//! Durable instance records and remote links.
//!
//! Everything here is owned by the store; the supervisor only ever reads
//! records by id and writes through [`InstanceStore::update`] and
//! [`InstanceStore::upsert_remote_link`].

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub fixed_port: Option<u16>,
    /// Set once by bootstrap; handed out only while the instance is stopped.
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl InstanceRecord {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            auto_start: false,
            fixed_port: None,
            admin_password: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Credentials and addresses letting the parent call into an instance as a federation peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteLink {
    pub title: String,
    pub api_key: String,
    /// API base, e.g. `http://localhost:4000/api`.
    pub url: String,
    #[serde(default)]
    pub site_url: String,
    /// Federation identifier the instance reports for itself.
    #[serde(default)]
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    instances: BTreeMap<String, InstanceRecord>,
    #[serde(default)]
    remotes: BTreeMap<String, RemoteLink>,
}

/// Instance persistence, file-backed (TOML) or purely in memory.
pub struct InstanceStore {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
    cache: RwLock<Arc<StoreData>>,
}

impl InstanceStore {
    /// Open (or create) a store persisted at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| AppError::io(e.to_string()))?;
            toml::from_str(&content)?
        } else {
            StoreData::default()
        };

        Ok(Self {
            path: Some(path),
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(data)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(StoreData::default())),
        }
    }

    fn snapshot(&self) -> Arc<StoreData> {
        let data = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&data)
    }

    fn save(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
        }
        let content = toml::to_string_pretty(data)?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content).map_err(|e| AppError::io(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| AppError::io(e.to_string()))
    }

    /// Read-modify-write while holding the write lock, so concurrent
    /// mutations cannot lose each other's changes.
    fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreData) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = (*self.snapshot()).clone();
        let result = f(&mut updated)?;
        self.save(&updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }

    pub fn get(&self, id: &str) -> Option<InstanceRecord> {
        self.snapshot().instances.get(id).cloned()
    }

    /// All instances ordered by id.
    pub fn list(&self) -> Vec<InstanceRecord> {
        self.snapshot().instances.values().cloned().collect()
    }

    pub fn insert(&self, record: InstanceRecord) -> Result<()> {
        self.mutate(move |data| {
            if data.instances.contains_key(&record.id) {
                return Err(AppError::instance_exists(&record.id));
            }
            data.instances.insert(record.id.clone(), record);
            Ok(())
        })
    }

    pub fn update<F, T>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut InstanceRecord) -> Result<T>,
    {
        self.mutate(|data| {
            let record = data
                .instances
                .get_mut(id)
                .ok_or_else(|| AppError::instance_not_found(id))?;
            f(record)
        })
    }

    pub fn remove(&self, id: &str) -> Result<InstanceRecord> {
        self.mutate(|data| {
            data.instances
                .remove(id)
                .ok_or_else(|| AppError::instance_not_found(id))
        })
    }

    pub fn remote_link(&self, id: &str) -> Option<RemoteLink> {
        self.snapshot().remotes.get(id).cloned()
    }

    /// Create-or-update the remote link keyed by `id`. `f` receives the
    /// existing link (if any) and returns the link to store.
    pub fn upsert_remote_link<F>(&self, id: &str, f: F) -> Result<RemoteLink>
    where
        F: FnOnce(Option<RemoteLink>) -> RemoteLink,
    {
        self.mutate(|data| {
            let link = f(data.remotes.remove(id));
            data.remotes.insert(id.to_string(), link.clone());
            Ok(link)
        })
    }

    /// Update an existing remote link in place; returns `None` when there is none.
    pub fn update_remote_link<F>(&self, id: &str, f: F) -> Result<Option<RemoteLink>>
    where
        F: FnOnce(&mut RemoteLink),
    {
        if !self.snapshot().remotes.contains_key(id) {
            return Ok(None);
        }
        self.mutate(|data| {
            Ok(data.remotes.get_mut(id).map(|link| {
                f(link);
                link.clone()
            }))
        })
    }

    pub fn remove_remote_link(&self, id: &str) -> Result<Option<RemoteLink>> {
        if !self.snapshot().remotes.contains_key(id) {
            return Ok(None);
        }
        self.mutate(|data| Ok(data.remotes.remove(id)))
    }
}
