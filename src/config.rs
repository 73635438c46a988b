use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::default_data_dir;

/// Load the supervisor config, writing the defaults first if the file does not exist.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let config = AppConfig::default();
        save_config(path, &config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(config).map_err(|e| AppError::config(e.to_string()))?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Federation identifier of this (parent) server. Required for first-run bootstrap.
    #[serde(default)]
    pub federation_identifier: Option<String>,
    #[serde(default = "default_child_host")]
    pub child_host: String,
    #[serde(default = "default_template_url")]
    pub template_url: String,
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_autostart_interval_ms")]
    pub autostart_interval_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Actor used for starts that no user requested (autostart sweep).
    #[serde(default = "default_system_actor")]
    pub system_actor: String,
}

/// How the child's entry point is launched inside its workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "default_entry_program")]
    pub program: String,
    #[serde(default = "default_entry_args")]
    pub args: Vec<String>,
    /// Argument carrying the port; `{port}` is substituted.
    #[serde(default = "default_port_arg")]
    pub port_arg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_child_host() -> String {
    "localhost".to_string()
}

fn default_template_url() -> String {
    "https://api.github.com/repos/palantus/sitecore/zipball".to_string()
}

fn default_install_command() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_entry_program() -> String {
    "node".to_string()
}

fn default_entry_args() -> Vec<String> {
    vec!["server.mjs".to_string()]
}

fn default_port_arg() -> String {
    "--port={port}".to_string()
}

fn default_max_attempts() -> u32 {
    200
}

fn default_interval_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_restart_delay_ms() -> u64 {
    500
}

fn default_autostart_interval_ms() -> u64 {
    1000
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_system_actor() -> String {
    "admin".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            federation_identifier: None,
            child_host: default_child_host(),
            template_url: default_template_url(),
            install_command: default_install_command(),
            entry: EntryConfig::default(),
            probe: ProbeConfig::default(),
            restart_delay_ms: default_restart_delay_ms(),
            autostart_interval_ms: default_autostart_interval_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            system_actor: default_system_actor(),
        }
    }
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            program: default_entry_program(),
            args: default_entry_args(),
            port_arg: default_port_arg(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl AppConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn autostart_interval(&self) -> Duration {
        Duration::from_millis(self.autostart_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Parent federation identifier, treating an empty string as unset.
    pub fn federation_identifier(&self) -> Option<&str> {
        self.federation_identifier
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
