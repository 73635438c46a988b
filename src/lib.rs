mod archive;
mod bootstrap;
mod config;
mod download;
mod error;
mod events;
mod instance;
mod logbook;
mod paths;
mod process;
mod remote;
mod store;
mod tunnel;
mod validation;

use std::path::Path;
use std::sync::Arc;

pub use config::{load_config, save_config, AppConfig, EntryConfig, ProbeConfig};
pub use error::{AppError, ErrorKind, Result};
pub use events::{BroadcastEventBus, BusEvent, EventSink};
pub use instance::{
    Actor, InstanceController, InstanceDetail, InstancePatch, InstanceStatus, InstanceSummary,
    Provisioner, RuntimeInfo, StartOutcome, StopOutcome, TemplateProvisioner,
};
pub use logbook::{LogBook, LogEntry};
pub use paths::default_config_path;
pub use process::ProcessRegistry;
pub use store::{InstanceRecord, InstanceStore, RemoteLink};

/// Everything a running supervisor holds on to.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub controller: Arc<InstanceController>,
    pub events: Arc<BroadcastEventBus>,
}

impl AppState {
    /// Load the config at `config_path`, prepare the data directory and open
    /// the instance store. Must be called inside a tokio runtime.
    pub fn open(config_path: &Path) -> Result<Self> {
        let config = Arc::new(load_config(config_path)?);
        paths::ensure_data_dirs(&config.data_dir)?;

        let store = Arc::new(InstanceStore::open(paths::store_path(&config.data_dir))?);
        let provisioner: Arc<dyn Provisioner> = Arc::new(TemplateProvisioner::new(&config)?);
        let events = Arc::new(BroadcastEventBus::new());
        let sink: Arc<dyn EventSink> = Arc::clone(&events) as Arc<dyn EventSink>;
        let controller =
            InstanceController::new(Arc::clone(&config), store, provisioner, sink)?;

        Ok(Self {
            config,
            controller,
            events,
        })
    }
}

/// Install the process-wide subscriber. `RUST_LOG` overrides `default_level`.
/// Records from the `log` facade are captured through the subscriber's bridge.
pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the supervisor until Ctrl-C: autostart flagged instances, log bus
/// traffic, then stop every child on the way out.
pub async fn run(state: AppState) -> Result<()> {
    if state.config.federation_identifier().is_none() {
        log::warn!("No federation_identifier configured; first-time bootstrap of new instances will fail");
    }
    log::info!("Supervising instances under {:?}", state.config.data_dir);

    let autostart = state.controller.spawn_autostart_sweep();

    let mut bus = state.events.subscribe();
    let bus_logger = tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(event) => log::debug!("Bus event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event bus listener lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let signal = tokio::signal::ctrl_c().await;
    if let Err(e) = &signal {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }

    log::info!("Shutting down; stopping all instances");
    autostart.abort();
    bus_logger.abort();
    state.controller.shutdown().await;

    signal.map_err(AppError::from)
}
