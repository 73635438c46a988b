//! Instance lifecycle: start, stop, self-restart and shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::deploy::{ensure_workspace, Provisioner};
use super::types::{Actor, StartOutcome, StopOutcome};
use crate::bootstrap::BootstrapNegotiator;
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::EventSink;
use crate::logbook::LogBook;
use crate::process::{
    find_available_port, ProcessRegistry, Readiness, ReadinessProber, RestartRequest, Supervisor,
};
use crate::store::{InstanceRecord, InstanceStore, RemoteLink};
use crate::tunnel::{self, TunnelParams};

/// Composes provisioning, the supervisor, readiness probing, bootstrap and
/// the event tunnel into the `start`/`stop` state machine.
pub struct InstanceController {
    pub(super) config: Arc<AppConfig>,
    pub(super) store: Arc<InstanceStore>,
    pub(super) logbook: Arc<LogBook>,
    pub(super) registry: Arc<ProcessRegistry>,
    supervisor: Supervisor,
    prober: ReadinessProber,
    negotiator: BootstrapNegotiator,
    provisioner: Arc<dyn Provisioner>,
    events: Arc<dyn EventSink>,
    /// Starts in progress. Doubles as the per-instance start lock.
    in_flight: Mutex<HashMap<String, InFlight>>,
    pending_restarts: Mutex<HashMap<String, CancellationToken>>,
}

struct InFlight {
    /// Fired by `stop` or `shutdown`.
    cancel: CancellationToken,
    /// Fired once the start has returned.
    done: CancellationToken,
}

/// Removes the in-flight entry when a start finishes, however it finishes.
struct InFlightGuard<'a> {
    map: &'a Mutex<HashMap<String, InFlight>>,
    instance_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.remove(&self.instance_id) {
            entry.done.cancel();
        }
    }
}

impl InstanceController {
    /// Build the controller and start listening for restart requests.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<InstanceStore>,
        provisioner: Arc<dyn Provisioner>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let logbook = Arc::new(LogBook::new());
        let registry = Arc::new(ProcessRegistry::new());
        let (supervisor, restarts) = Supervisor::new(
            config.entry.clone(),
            Arc::clone(&registry),
            Arc::clone(&logbook),
        );
        let prober = ReadinessProber::new(&config.child_host, &config.probe)?;
        let negotiator = BootstrapNegotiator::new(&config)?;

        let controller = Arc::new(Self {
            config,
            store,
            logbook,
            registry,
            supervisor,
            prober,
            negotiator,
            provisioner,
            events,
            in_flight: Mutex::new(HashMap::new()),
            pending_restarts: Mutex::new(HashMap::new()),
        });

        tokio::spawn(listen_for_restarts(Arc::downgrade(&controller), restarts));
        Ok(controller)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn logbook(&self) -> &LogBook {
        &self.logbook
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Running or in the middle of starting.
    pub fn is_busy(&self, instance_id: &str) -> bool {
        if self.registry.contains(instance_id) {
            return true;
        }
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains_key(instance_id)
    }

    /// Start an instance on behalf of `actor`.
    ///
    /// Starting a running (or starting) instance is a logged no-op. A child
    /// that never becomes ready is torn down and reported as
    /// [`StartOutcome::NotReady`] rather than as an error; one that exits
    /// first is reported as [`StartOutcome::Exited`].
    pub async fn start(&self, instance_id: &str, actor: &Actor) -> Result<StartOutcome> {
        self.begin(instance_id, actor, true).await
    }

    async fn begin(&self, instance_id: &str, actor: &Actor, clear_log: bool) -> Result<StartOutcome> {
        let record = self
            .store
            .get(instance_id)
            .ok_or_else(|| AppError::instance_not_found(instance_id))?;

        if self.registry.contains(instance_id) {
            self.logbook
                .append(instance_id, "Warning: instance is already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.contains_key(instance_id) {
                drop(in_flight);
                self.logbook
                    .append(instance_id, "Warning: instance is already starting");
                return Ok(StartOutcome::AlreadyRunning);
            }
            in_flight.insert(
                instance_id.to_string(),
                InFlight {
                    cancel: cancel.clone(),
                    done: CancellationToken::new(),
                },
            );
        }
        let _guard = InFlightGuard {
            map: &self.in_flight,
            instance_id: instance_id.to_string(),
        };
        self.cancel_pending_restart(instance_id);

        if clear_log {
            self.logbook.clear(instance_id);
        }
        self.launch(&record, actor, &cancel).await
    }

    async fn launch(
        &self,
        record: &InstanceRecord,
        actor: &Actor,
        cancel: &CancellationToken,
    ) -> Result<StartOutcome> {
        let id = record.id.as_str();

        let workspace =
            ensure_workspace(self.provisioner.as_ref(), &self.config.data_dir, id, &self.logbook)
                .await?;
        if cancel.is_cancelled() {
            return Ok(StartOutcome::Cancelled);
        }

        let port = self.resolve_port(record)?;
        self.logbook
            .append(id, format!("Starting process on port {port}"));
        let child = self.supervisor.spawn(id, port, &workspace)?;
        let pid = child.pid;

        self.logbook.append(id, "Waiting for API to become available");
        match self
            .prober
            .wait_ready(id, port, &self.logbook, cancel, &child.exited)
            .await
        {
            Readiness::Ready => self.logbook.append(id, "API ready"),
            Readiness::Exited => {
                self.logbook
                    .append(id, "Error: process exited before the API became available");
                return Ok(StartOutcome::Exited);
            }
            Readiness::TimedOut => {
                self.supervisor.kill_pid(id, pid);
                return Ok(StartOutcome::NotReady);
            }
            Readiness::Cancelled => {
                self.supervisor.kill_pid(id, pid);
                return Ok(StartOutcome::Cancelled);
            }
        }

        let link = match self.store.remote_link(id) {
            Some(link) => link,
            None => {
                let negotiated = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = self.negotiator.negotiate(id, port, &actor.id, &self.store, &self.logbook) => Some(result),
                };
                match negotiated {
                    Some(Ok(link)) => link,
                    Some(Err(e)) => {
                        self.supervisor.kill_pid(id, pid);
                        return Err(e);
                    }
                    None => {
                        self.supervisor.kill_pid(id, pid);
                        return Ok(StartOutcome::Cancelled);
                    }
                }
            }
        };

        let link = match self.refresh_link_addresses(id, port, link) {
            Ok(link) => link,
            Err(e) => {
                self.supervisor.kill_pid(id, pid);
                return Err(e);
            }
        };
        self.open_tunnel(id, pid, port, &link);

        if cancel.is_cancelled() || self.registry.pid(id) != Some(pid) {
            self.supervisor.kill_pid(id, pid);
            return Ok(StartOutcome::Cancelled);
        }

        self.logbook
            .append(id, format!("Instance started on port {port}"));
        Ok(StartOutcome::Started { port })
    }

    /// Fixed port if configured (and not held by another instance), otherwise a free one.
    fn resolve_port(&self, record: &InstanceRecord) -> Result<u16> {
        match record.fixed_port.filter(|port| *port != 0) {
            Some(port) => match self.registry.port_owner(port) {
                Some(owner) => {
                    self.logbook.append(
                        &record.id,
                        format!("Error: port {port} is in use by instance {owner}"),
                    );
                    Err(AppError::port_occupied(port))
                }
                None => Ok(port),
            },
            None => find_available_port(),
        }
    }

    /// The port can change from run to run, so the link's addresses are
    /// rewritten on every start.
    fn refresh_link_addresses(&self, instance_id: &str, port: u16, link: RemoteLink) -> Result<RemoteLink> {
        let url = self.negotiator.api_base(port);
        let site_url = self.negotiator.site_url(port);
        let updated = self.store.update_remote_link(instance_id, |l| {
            l.url = url;
            l.site_url = site_url;
        })?;
        Ok(updated.unwrap_or(link))
    }

    fn open_tunnel(&self, instance_id: &str, pid: u32, port: u16, link: &RemoteLink) {
        let params = TunnelParams {
            instance_id: instance_id.to_string(),
            url: format!("ws://{}:{}/api", self.config.child_host, port),
            api_key: link.api_key.clone(),
            origin: link
                .identifier
                .clone()
                .unwrap_or_else(|| instance_id.to_string()),
        };
        let handle = tunnel::open(params, Arc::clone(&self.logbook), Arc::clone(&self.events));
        if let Err(handle) = self.registry.attach_tunnel(instance_id, pid, handle) {
            handle.close();
        }
    }

    /// Stop an instance: signal the child, close its tunnel, and cancel any
    /// start or restart still in progress for it.
    pub fn stop(&self, instance_id: &str) -> Result<StopOutcome> {
        if self.store.get(instance_id).is_none() && !self.registry.contains(instance_id) {
            return Err(AppError::instance_not_found(instance_id));
        }

        let cancelled_restart = self.cancel_pending_restart(instance_id);
        let cancelled_start = {
            let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(instance_id) {
                Some(entry) => {
                    entry.cancel.cancel();
                    true
                }
                None => false,
            }
        };

        match self.supervisor.kill(instance_id) {
            Some(pid) => {
                self.logbook
                    .append(instance_id, format!("Stopping process {pid}"));
                Ok(StopOutcome::Stopped)
            }
            None if cancelled_start || cancelled_restart => {
                self.logbook.append(instance_id, "Start cancelled");
                Ok(StopOutcome::Stopped)
            }
            None => {
                self.logbook.append(
                    instance_id,
                    "Warning: process not found, so it cannot be stopped",
                );
                Ok(StopOutcome::NotRunning)
            }
        }
    }

    pub(super) fn cancel_pending_restart(&self, instance_id: &str) -> bool {
        let mut pending = self
            .pending_restarts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match pending.remove(instance_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn in_flight_done(&self, instance_id: &str) -> Option<CancellationToken> {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.get(instance_id).map(|entry| entry.done.clone())
    }

    fn schedule_restart(self: Arc<Self>, request: RestartRequest) {
        let token = CancellationToken::new();
        {
            let mut pending = self
                .pending_restarts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = pending.insert(request.instance_id.clone(), token.clone()) {
                previous.cancel();
            }
        }

        let delay = self.config.restart_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // A child can exit while its own start is still unwinding.
            if let Some(done) = self.in_flight_done(&request.instance_id) {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = done.cancelled() => {}
                }
            }
            {
                let mut pending = self
                    .pending_restarts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if token.is_cancelled() {
                    return;
                }
                pending.remove(&request.instance_id);
            }

            let id = request.instance_id.as_str();
            if self.store.get(id).is_none() {
                log::warn!("Instance {} was deleted before its restart; not restarting", id);
                return;
            }

            let actor = Actor::new(self.config.system_actor.clone());
            match self.begin(id, &actor, false).await {
                Ok(outcome) => log::info!("Restart of instance {} finished: {:?}", id, outcome),
                Err(e) => {
                    self.logbook.append(id, format!("Error: restart failed: {e}"));
                }
            }
        });
    }

    /// Start every instance flagged `auto_start`, one after another, pausing
    /// `autostart_interval` before each.
    pub fn spawn_autostart_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let actor = Actor::new(controller.config.system_actor.clone());
            let interval = controller.config.autostart_interval();
            for record in controller.store.list() {
                if !record.auto_start {
                    continue;
                }
                tokio::time::sleep(interval).await;
                log::info!("Autostarting instance {}", record.id);
                match controller.start(&record.id, &actor).await {
                    Ok(outcome) => log::info!("Autostart of {}: {:?}", record.id, outcome),
                    Err(e) => log::error!("Failed to autostart instance {}: {}", record.id, e),
                }
            }
        })
    }

    /// Cancel pending work, signal every running child and wait for the
    /// tunnels to close.
    pub async fn shutdown(&self) {
        {
            let mut pending = self
                .pending_restarts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (_, token) in pending.drain() {
                token.cancel();
            }
        }
        {
            let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            for entry in in_flight.values() {
                entry.cancel.cancel();
            }
        }
        self.supervisor.stop_all().await;
    }
}

async fn listen_for_restarts(
    controller: Weak<InstanceController>,
    mut restarts: mpsc::UnboundedReceiver<RestartRequest>,
) {
    while let Some(request) = restarts.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.schedule_restart(request);
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use wiremock::MockServer;

    use super::InstanceController;
    use crate::bootstrap::tests::mount_child_api;
    use crate::config::{AppConfig, EntryConfig, ProbeConfig};
    use crate::error::ErrorKind;
    use crate::events::BroadcastEventBus;
    use crate::instance::deploy::tests::StubProvisioner;
    use crate::instance::types::{Actor, StartOutcome, StopOutcome};
    use crate::store::{InstanceRecord, InstanceStore};

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub server: MockServer,
        pub controller: Arc<InstanceController>,
    }

    pub(crate) fn test_config(dir: &std::path::Path, script: &str) -> AppConfig {
        AppConfig {
            data_dir: dir.to_path_buf(),
            federation_identifier: Some("parent".to_string()),
            child_host: "127.0.0.1".to_string(),
            entry: EntryConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
                port_arg: "--port={port}".to_string(),
            },
            probe: ProbeConfig {
                max_attempts: 20,
                interval_ms: 20,
                request_timeout_ms: 500,
            },
            restart_delay_ms: 50,
            autostart_interval_ms: 10,
            http_timeout_secs: 5,
            ..AppConfig::default()
        }
    }

    /// A controller whose children are `script`, with a mock child API that
    /// the instance `acme` is pinned to via its fixed port.
    pub(crate) async fn harness_with(script: &str, edit: impl FnOnce(&mut AppConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        mount_child_api(&server, "acme").await;

        let mut config = test_config(dir.path(), script);
        edit(&mut config);

        let store = Arc::new(InstanceStore::in_memory());
        let mut record = InstanceRecord::new("acme", "Acme Corp");
        record.fixed_port = Some(server.address().port());
        store.insert(record).unwrap();

        let controller = InstanceController::new(
            Arc::new(config),
            store,
            Arc::new(StubProvisioner),
            Arc::new(BroadcastEventBus::new()),
        )
        .unwrap();

        Harness {
            dir,
            server,
            controller,
        }
    }

    pub(crate) async fn harness(script: &str) -> Harness {
        harness_with(script, |_| {}).await
    }

    pub(crate) async fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f(), "condition not reached");
    }

    pub(crate) async fn login_calls(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/api/auth/login")
            .count()
    }

    fn alice() -> Actor {
        Actor::new("alice")
    }

    #[tokio::test]
    async fn start_then_stop() {
        let h = harness("sleep 30").await;
        let port = h.server.address().port();

        let outcome = h.controller.start("acme", &alice()).await.unwrap();
        assert_eq!(outcome, StartOutcome::Started { port });
        assert!(h.controller.registry().contains("acme"));
        assert!(h.controller.registry().has_tunnel("acme"));
        assert!(h.dir.path().join("subs").join("acme").join("server.mjs").exists());
        assert!(h.controller.logbook().contains("acme", "API ready"));

        assert_eq!(h.controller.stop("acme").unwrap(), StopOutcome::Stopped);
        assert!(!h.controller.registry().contains("acme"));
    }

    #[tokio::test]
    async fn start_while_running_is_a_noop() {
        let h = harness("sleep 30").await;
        h.controller.start("acme", &alice()).await.unwrap();
        let pid = h.controller.registry().pid("acme");
        // the mock API refuses the websocket upgrade; let that line land first
        let controller = Arc::clone(&h.controller);
        wait_until(move || controller.logbook().contains("acme", "websocket connection failed"))
            .await;
        let before = h.controller.logbook().len("acme");

        let outcome = h.controller.start("acme", &alice()).await.unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyRunning);
        assert_eq!(h.controller.registry().pid("acme"), pid);
        assert_eq!(h.controller.logbook().len("acme"), before + 1);
        assert!(h.controller.logbook().contains("acme", "already running"));

        h.controller.stop("acme").unwrap();
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_noop() {
        let h = harness("sleep 30").await;
        assert_eq!(h.controller.stop("acme").unwrap(), StopOutcome::NotRunning);
        assert_eq!(h.controller.logbook().len("acme"), 1);
        assert!(h.controller.logbook().contains("acme", "cannot be stopped"));
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let h = harness("sleep 30").await;
        let err = h.controller.start("ghost", &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
    }

    #[tokio::test]
    async fn readiness_timeout_leaves_no_process() {
        let h = harness_with("sleep 30", |c| c.probe.max_attempts = 3).await;
        let unused = crate::process::find_available_port().unwrap();
        h.controller
            .store()
            .update("acme", |r| {
                r.fixed_port = Some(unused);
                Ok(())
            })
            .unwrap();

        let outcome = h.controller.start("acme", &alice()).await.unwrap();
        assert_eq!(outcome, StartOutcome::NotReady);
        assert!(h.controller.registry().is_empty());
        assert!(h.controller.logbook().contains("acme", "Giving up after 3 attempts."));
        assert_eq!(login_calls(&h.server).await, 0);
    }

    #[tokio::test]
    async fn crash_before_ready_ends_the_start_early() {
        // far longer than the timeout below if the prober kept going
        let h = harness_with("exit 1", |c| c.probe.max_attempts = 500).await;
        let unused = crate::process::find_available_port().unwrap();
        h.controller
            .store()
            .update("acme", |r| {
                r.fixed_port = Some(unused);
                Ok(())
            })
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            h.controller.start("acme", &alice()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome, StartOutcome::Exited);
        assert!(h.controller.registry().is_empty());
        assert!(!h.controller.logbook().contains("acme", "Giving up"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!h.controller.is_busy("acme"));
    }

    #[tokio::test]
    async fn clean_exit_before_ready_still_restarts() {
        let h = harness_with(
            "if [ -f restarted ]; then echo respawned; sleep 30; else : > restarted; exit 0; fi",
            |c| c.probe.max_attempts = 30,
        )
        .await;
        let unused = crate::process::find_available_port().unwrap();
        h.controller
            .store()
            .update("acme", |r| {
                r.fixed_port = Some(unused);
                Ok(())
            })
            .unwrap();

        let outcome = h.controller.start("acme", &alice()).await.unwrap();
        assert_eq!(outcome, StartOutcome::Exited);
        assert!(!h.controller.logbook().contains("acme", "Giving up"));

        let controller = Arc::clone(&h.controller);
        wait_until(move || controller.logbook().contains("acme", "acme: respawned")).await;
        assert!(h
            .controller
            .logbook()
            .contains("acme", "Exit code 0 requests a restart"));
        assert!(!h.controller.logbook().contains("acme", "already starting"));

        h.controller.stop("acme").unwrap();
    }

    #[tokio::test]
    async fn bootstrap_runs_only_on_first_start() {
        let h = harness("sleep 30").await;

        h.controller.start("acme", &alice()).await.unwrap();
        let first = h.controller.store().remote_link("acme").unwrap();
        h.controller.stop("acme").unwrap();

        let outcome = h.controller.start("acme", &alice()).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(login_calls(&h.server).await, 1);
        assert_eq!(h.controller.store().remote_link("acme").unwrap().api_key, first.api_key);

        h.controller.stop("acme").unwrap();
    }

    #[tokio::test]
    async fn link_addresses_follow_the_port() {
        let h = harness("sleep 30").await;
        h.controller.start("acme", &alice()).await.unwrap();
        h.controller.stop("acme").unwrap();

        h.controller
            .store()
            .update_remote_link("acme", |l| l.url = "http://127.0.0.1:1/api".to_string())
            .unwrap();
        h.controller.start("acme", &alice()).await.unwrap();

        let port = h.server.address().port();
        let link = h.controller.store().remote_link("acme").unwrap();
        assert_eq!(link.url, format!("http://127.0.0.1:{port}/api"));
        assert_eq!(link.site_url, format!("http://127.0.0.1:{port}"));
        h.controller.stop("acme").unwrap();
    }

    #[tokio::test]
    async fn failed_bootstrap_tears_the_process_down() {
        let h = harness_with("sleep 30", |c| c.federation_identifier = None).await;

        let err = h.controller.start("acme", &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bootstrap);
        assert!(h.controller.registry().is_empty());
        assert!(h
            .controller
            .logbook()
            .contains("acme", "Missing federation identifier"));
    }

    #[tokio::test]
    async fn fixed_port_held_by_another_instance_is_rejected() {
        let h = harness("sleep 30").await;
        h.controller.start("acme", &alice()).await.unwrap();

        let mut other = InstanceRecord::new("beta", "Beta");
        other.fixed_port = Some(h.server.address().port());
        h.controller.store().insert(other).unwrap();

        let err = h.controller.start("beta", &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortOccupied);
        h.controller.stop("acme").unwrap();
    }

    #[tokio::test]
    async fn clean_exit_restarts_once() {
        // first run exits 0 after a moment; the restarted run stays up
        let h = harness(
            "if [ -f restarted ]; then sleep 30; else : > restarted; sleep 1; exit 0; fi",
        )
        .await;

        h.controller.start("acme", &alice()).await.unwrap();
        let first_pid = h.controller.registry().pid("acme").unwrap();

        let controller = Arc::clone(&h.controller);
        wait_until(move || {
            controller
                .registry()
                .pid("acme")
                .is_some_and(|pid| pid != first_pid)
        })
        .await;
        assert!(h
            .controller
            .logbook()
            .contains("acme", "Exit code 0 requests a restart"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let second_pid = h.controller.registry().pid("acme");
        assert!(second_pid.is_some_and(|pid| pid != first_pid));
        assert_eq!(login_calls(&h.server).await, 1);

        h.controller.stop("acme").unwrap();
    }

    #[tokio::test]
    async fn failing_exit_is_not_restarted() {
        let h = harness("sleep 0.3; exit 1").await;
        h.controller.start("acme", &alice()).await.unwrap();

        let controller = Arc::clone(&h.controller);
        wait_until(move || !controller.registry().contains("acme")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!h.controller.registry().contains("acme"));
        assert!(h.controller.logbook().contains("acme", "exited with code 1"));
    }

    #[tokio::test]
    async fn stop_cancels_a_start_waiting_for_readiness() {
        let h = harness_with("sleep 30", |c| c.probe.max_attempts = 500).await;
        let unused = crate::process::find_available_port().unwrap();
        h.controller
            .store()
            .update("acme", |r| {
                r.fixed_port = Some(unused);
                Ok(())
            })
            .unwrap();

        let controller = Arc::clone(&h.controller);
        let start = tokio::spawn(async move { controller.start("acme", &Actor::new("alice")).await });

        let controller = Arc::clone(&h.controller);
        wait_until(move || controller.registry().contains("acme")).await;
        assert!(h.controller.is_busy("acme"));

        assert_eq!(h.controller.stop("acme").unwrap(), StopOutcome::Stopped);
        let outcome = start.await.unwrap().unwrap();
        assert_eq!(outcome, StartOutcome::Cancelled);
        assert!(!h.controller.is_busy("acme"));
    }

    #[tokio::test]
    async fn autostart_sweep_starts_flagged_instances() {
        let h = harness("sleep 30").await;
        h.controller
            .store()
            .update("acme", |r| {
                r.auto_start = true;
                Ok(())
            })
            .unwrap();
        h.controller
            .store()
            .insert(InstanceRecord::new("idle", "Idle"))
            .unwrap();

        h.controller.spawn_autostart_sweep().await.unwrap();

        assert!(h.controller.registry().contains("acme"));
        assert!(!h.controller.registry().contains("idle"));
        h.controller.shutdown().await;
        assert!(h.controller.registry().is_empty());
    }
}
