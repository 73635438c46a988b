//! Readiness probing for freshly spawned children.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::error::{AppError, Result};
use crate::logbook::LogBook;

/// Well-known path every child answers once its API is up.
pub const HEALTH_PATH: &str = "/api/system/ip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Every attempt failed.
    TimedOut,
    /// The start was cancelled while waiting.
    Cancelled,
    /// The child exited before it answered.
    Exited,
}

/// Polls a child's health endpoint at a fixed interval, one probe at a time.
pub struct ReadinessProber {
    client: Client,
    host: String,
    max_attempts: u32,
    interval: Duration,
}

impl ReadinessProber {
    pub fn new(host: &str, probe: &ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(probe.request_timeout())
            .build()
            .map_err(|e| AppError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            host: host.to_string(),
            max_attempts: probe.max_attempts,
            interval: probe.interval(),
        })
    }

    /// Any HTTP response counts; only transport failures (refused,
    /// reset, timeout) mean "not up yet".
    pub async fn check_once(&self, port: u16) -> bool {
        let url = format!("http://{}:{}{}", self.host, port, HEALTH_PATH);
        self.client.get(&url).send().await.is_ok()
    }

    /// Wait up to `max_attempts * interval` for the child on `port` to answer.
    ///
    /// Each failed attempt and the final give-up are appended to the instance log.
    /// Polling ends early when `cancel` fires or the child behind `exited` is gone.
    pub async fn wait_ready(
        &self,
        instance_id: &str,
        port: u16,
        logbook: &LogBook,
        cancel: &CancellationToken,
        exited: &CancellationToken,
    ) -> Readiness {
        for attempt in 1..=self.max_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = exited.cancelled() => return Readiness::Exited,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let ready = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = exited.cancelled() => return Readiness::Exited,
                ready = self.check_once(port) => ready,
            };
            if ready {
                return Readiness::Ready;
            }

            logbook.append(
                instance_id,
                format!(
                    "Still not online (attempt {}/{})",
                    attempt, self.max_attempts
                ),
            );
        }

        logbook.append(
            instance_id,
            format!("Giving up after {} attempts.", self.max_attempts),
        );
        Readiness::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{Readiness, ReadinessProber, HEALTH_PATH};
    use crate::config::ProbeConfig;
    use crate::logbook::LogBook;

    fn fast_probe(max_attempts: u32) -> ProbeConfig {
        ProbeConfig {
            max_attempts,
            interval_ms: 10,
            request_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn any_response_counts_as_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(HEALTH_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let prober = ReadinessProber::new("127.0.0.1", &fast_probe(3)).unwrap();
        let logbook = LogBook::new();
        let readiness = prober
            .wait_ready(
                "acme",
                server.address().port(),
                &logbook,
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(readiness, Readiness::Ready);
        assert_eq!(logbook.len("acme"), 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let port = crate::process::find_available_port().unwrap();
        let prober = ReadinessProber::new("127.0.0.1", &fast_probe(3)).unwrap();
        let logbook = LogBook::new();

        let readiness = prober
            .wait_ready(
                "acme",
                port,
                &logbook,
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(readiness, Readiness::TimedOut);
        // three failed attempts plus the give-up line
        assert_eq!(logbook.len("acme"), 4);
        assert!(logbook.contains("acme", "Giving up"));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let port = crate::process::find_available_port().unwrap();
        let prober = ReadinessProber::new("127.0.0.1", &fast_probe(1000)).unwrap();
        let logbook = LogBook::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let readiness = prober
            .wait_ready("acme", port, &logbook, &cancel, &CancellationToken::new())
            .await;
        assert_eq!(readiness, Readiness::Cancelled);
        assert_eq!(logbook.len("acme"), 0);
    }

    #[tokio::test]
    async fn child_exit_stops_polling() {
        let port = crate::process::find_available_port().unwrap();
        let prober = ReadinessProber::new("127.0.0.1", &fast_probe(1000)).unwrap();
        let logbook = LogBook::new();
        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();

        let waiting = prober.wait_ready("acme", port, &logbook, &cancel, &exited);
        let (readiness, ()) = tokio::join!(waiting, async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            exited.cancel();
        });

        assert_eq!(readiness, Readiness::Exited);
        assert!(!logbook.contains("acme", "Giving up"));
    }
}
