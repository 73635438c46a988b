//! Workspace provisioning: fetching the host application template and
//! installing its dependencies into an instance's workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::future::BoxFuture;
use reqwest::Client;
use tokio::process::Command;

use crate::archive::extract_template;
use crate::config::AppConfig;
use crate::download::{download_file, USER_AGENT};
use crate::error::{AppError, Result};
use crate::logbook::LogBook;
use crate::paths::{cache_dir, is_workspace_provisioned, workspace_dir};

/// Fills an empty workspace directory with a runnable copy of the host application.
pub trait Provisioner: Send + Sync {
    fn provision<'a>(
        &'a self,
        instance_id: &'a str,
        workspace: &'a Path,
        logbook: &'a LogBook,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Downloads `template_url`, unpacks it and runs `install_command`.
pub struct TemplateProvisioner {
    client: Client,
    template_url: String,
    install_command: Vec<String>,
    cache_dir: PathBuf,
}

impl TemplateProvisioner {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::network(e.to_string()))?;

        Ok(Self {
            client,
            template_url: config.template_url.clone(),
            install_command: config.install_command.clone(),
            cache_dir: cache_dir(&config.data_dir),
        })
    }

    async fn fetch_and_extract(
        &self,
        instance_id: &str,
        workspace: &Path,
        logbook: &LogBook,
    ) -> Result<()> {
        let archive = self.cache_dir.join(format!("{instance_id}.template"));

        logbook.append(instance_id, "Downloading application template...");
        let bytes = download_file(&self.client, &self.template_url, &archive).await?;
        logbook.append(instance_id, format!("Downloaded {bytes} bytes"));

        let archive_for_task = archive.clone();
        let dest = workspace.to_path_buf();
        let extracted =
            tokio::task::spawn_blocking(move || extract_template(&archive_for_task, &dest))
                .await
                .map_err(|e| AppError::provision(format!("extraction task failed: {e}")));

        if let Err(e) = std::fs::remove_file(&archive) {
            log::warn!("Failed to remove template archive {:?}: {}", archive, e);
        }
        extracted??;
        logbook.append(instance_id, "Template extracted");
        Ok(())
    }

    async fn install(&self, instance_id: &str, workspace: &Path, logbook: &LogBook) -> Result<()> {
        let Some((program, args)) = self.install_command.split_first() else {
            return Ok(());
        };

        logbook.append(
            instance_id,
            format!("Running {}...", self.install_command.join(" ")),
        );
        let output = Command::new(program)
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AppError::provision(format!("Failed to run {program}: {e}")))?;

        for stream in [&output.stdout, &output.stderr] {
            let text = String::from_utf8_lossy(stream);
            if !text.trim().is_empty() {
                logbook.append(instance_id, text.trim_end());
            }
        }

        if !output.status.success() {
            return Err(AppError::provision(format!(
                "{} failed with {}",
                self.install_command.join(" "),
                output.status
            )));
        }
        logbook.append(instance_id, "Install done");
        Ok(())
    }
}

impl Provisioner for TemplateProvisioner {
    fn provision<'a>(
        &'a self,
        instance_id: &'a str,
        workspace: &'a Path,
        logbook: &'a LogBook,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.fetch_and_extract(instance_id, workspace, logbook)
                .await?;
            self.install(instance_id, workspace, logbook).await
        })
    }
}

/// Return the instance workspace, provisioning it first if it does not exist.
///
/// A failed provisioning removes the partial workspace so the next start retries.
pub async fn ensure_workspace(
    provisioner: &dyn Provisioner,
    data_dir: &Path,
    instance_id: &str,
    logbook: &LogBook,
) -> Result<PathBuf> {
    let workspace = workspace_dir(data_dir, instance_id);
    if is_workspace_provisioned(data_dir, instance_id) {
        return Ok(workspace);
    }

    logbook.append(instance_id, "Provisioning workspace...");
    std::fs::create_dir_all(&workspace)
        .map_err(|e| AppError::io(format!("Failed to create workspace: {}", e)))?;

    if let Err(e) = provisioner.provision(instance_id, &workspace, logbook).await {
        logbook.append(instance_id, format!("Error: provisioning failed: {e}"));
        if let Err(rm_err) = std::fs::remove_dir_all(&workspace) {
            log::warn!(
                "Failed to remove partial workspace {:?}: {}",
                workspace,
                rm_err
            );
        }
        return Err(e);
    }

    Ok(workspace)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write as _;
    use std::path::Path;

    use futures_util::future::BoxFuture;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{ensure_workspace, Provisioner, TemplateProvisioner};
    use crate::config::AppConfig;
    use crate::error::{AppError, ErrorKind, Result};
    use crate::logbook::LogBook;

    /// Writes a single marker file; used wherever a real template is not needed.
    pub(crate) struct StubProvisioner;

    impl Provisioner for StubProvisioner {
        fn provision<'a>(
            &'a self,
            _instance_id: &'a str,
            workspace: &'a Path,
            _logbook: &'a LogBook,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                std::fs::write(workspace.join("server.mjs"), "// stub")?;
                Ok(())
            })
        }
    }

    struct FailingProvisioner;

    impl Provisioner for FailingProvisioner {
        fn provision<'a>(
            &'a self,
            _instance_id: &'a str,
            workspace: &'a Path,
            _logbook: &'a LogBook,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                std::fs::write(workspace.join("half"), "x")?;
                Err(AppError::provision("boom"))
            })
        }
    }

    fn zipball() -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.add_directory("sitecore-abc123/", options).unwrap();
            writer
                .start_file("sitecore-abc123/server.mjs", options)
                .unwrap();
            writer.write_all(b"console.log('hi')").unwrap();
            writer
                .start_file("sitecore-abc123/package.json", options)
                .unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    async fn template_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zipball"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zipball()))
            .mount(&server)
            .await;
        server
    }

    fn config_for(dir: &Path, server: &MockServer, install: &[&str]) -> AppConfig {
        AppConfig {
            data_dir: dir.to_path_buf(),
            template_url: format!("{}/zipball", server.uri()),
            install_command: install.iter().map(|s| s.to_string()).collect(),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn existing_workspace_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("subs").join("acme");
        std::fs::create_dir_all(&workspace).unwrap();

        let got = ensure_workspace(&FailingProvisioner, dir.path(), "acme", &LogBook::new())
            .await
            .unwrap();
        assert_eq!(got, workspace);
        assert!(!workspace.join("half").exists());
    }

    #[tokio::test]
    async fn failed_provisioning_removes_partial_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let logbook = LogBook::new();

        let err = ensure_workspace(&FailingProvisioner, dir.path(), "acme", &logbook)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provision);
        assert!(!dir.path().join("subs").join("acme").exists());
        assert!(logbook.contains("acme", "provisioning failed"));
    }

    #[tokio::test]
    async fn template_is_downloaded_and_flattened() {
        let server = template_server().await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &server, &[]);
        let provisioner = TemplateProvisioner::new(&config).unwrap();

        let workspace = ensure_workspace(&provisioner, dir.path(), "acme", &LogBook::new())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(workspace.join("server.mjs")).unwrap(),
            "console.log('hi')"
        );
        assert!(workspace.join("package.json").exists());
        assert!(!workspace.join("sitecore-abc123").exists());
        assert!(!dir.path().join("cache").join("acme.template").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_command_runs_in_workspace() {
        let server = template_server().await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(
            dir.path(),
            &server,
            &["/bin/sh", "-c", "echo installing; touch installed"],
        );
        let provisioner = TemplateProvisioner::new(&config).unwrap();
        let logbook = LogBook::new();

        let workspace = ensure_workspace(&provisioner, dir.path(), "acme", &logbook)
            .await
            .unwrap();

        assert!(workspace.join("installed").exists());
        assert!(logbook.contains("acme", "installing"));
        assert!(logbook.contains("acme", "Install done"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_install_is_a_provision_error() {
        let server = template_server().await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &server, &["/bin/sh", "-c", "exit 3"]);
        let provisioner = TemplateProvisioner::new(&config).unwrap();

        let err = ensure_workspace(&provisioner, dir.path(), "acme", &LogBook::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Provision);
        assert!(!dir.path().join("subs").join("acme").exists());
    }
}
