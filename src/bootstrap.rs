//! One-time credential and identity exchange with a freshly started instance.
//!
//! Runs only while the instance has no remote link. The exchange is not
//! transactional: a failure at any step aborts the sequence and leaves the
//! steps already completed in place.

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::AppConfig;
use crate::download::USER_AGENT;
use crate::error::{AppError, Result};
use crate::logbook::LogBook;
use crate::remote::RemoteClient;
use crate::store::{InstanceStore, RemoteLink};

/// Credential pair every brand-new instance ships with.
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";
/// Name of the federation API key registered on the instance.
const API_KEY_NAME: &str = "master";
const ADMIN_ROLE: &str = "admin";

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyRequest<'a> {
    name: &'a str,
    key: &'a str,
    user_id: &'a str,
    federation: bool,
    identifier: &'a str,
}

pub struct BootstrapNegotiator {
    client: Client,
    host: String,
    federation_identifier: Option<String>,
}

impl BootstrapNegotiator {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| AppError::network(e.to_string()))?;

        Ok(Self {
            client,
            host: config.child_host.clone(),
            federation_identifier: config.federation_identifier().map(str::to_string),
        })
    }

    pub fn api_base(&self, port: u16) -> String {
        format!("http://{}:{}/api", self.host, port)
    }

    pub fn site_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }

    /// Link `instance_id` (listening on `port`) back to this parent and make
    /// `actor` an administrator on it. Returns the stored remote link.
    pub async fn negotiate(
        &self,
        instance_id: &str,
        port: u16,
        actor: &str,
        store: &InstanceStore,
        logbook: &LogBook,
    ) -> Result<RemoteLink> {
        let log = |text: &str| logbook.append(instance_id, text);
        let fail = |step: &str, err: AppError| {
            logbook.append(instance_id, format!("Error: bootstrap step '{step}' failed: {err}"));
            AppError::bootstrap(step, err.to_string())
        };

        log("Beginning initial configuration by logging in...");
        let token = self.login(port).await.map_err(|e| fail("login", e))?;
        log("Logged in with the default credentials");

        let Some(parent_identifier) = self.federation_identifier.as_deref() else {
            let message = "Error: Missing federation identifier on parent (set federation_identifier in config.toml)";
            log(message);
            return Err(AppError::bootstrap("apikey", message));
        };
        let api_key = uuid::Uuid::new_v4().to_string();
        log("Registering federation API key on instance...");
        let request = ApiKeyRequest {
            name: API_KEY_NAME,
            key: &api_key,
            user_id: DEFAULT_USERNAME,
            federation: true,
            identifier: parent_identifier,
        };
        self.call(Method::POST, port, "system/apikeys", &token, &request)
            .await
            .map_err(|e| fail("apikey", e))?;

        log("Creating remote link...");
        let url = self.api_base(port);
        let site_url = self.site_url(port);
        let mut link = store
            .upsert_remote_link(instance_id, |existing| match existing {
                Some(mut link) => {
                    link.api_key = api_key.clone();
                    link.url = url.clone();
                    link.site_url = site_url.clone();
                    link
                }
                None => RemoteLink {
                    title: instance_id.to_string(),
                    api_key: api_key.clone(),
                    url: url.clone(),
                    site_url: site_url.clone(),
                    identifier: None,
                },
            })
            .map_err(|e| fail("remote", e))?;

        log("Setting identifier for federation...");
        self.call(
            Method::PATCH,
            port,
            "federation/setup",
            &token,
            &json!({ "identifier": instance_id }),
        )
        .await
        .map_err(|e| fail("identifier", e))?;

        let remote = RemoteClient::new(&self.client, &link);
        let setup = remote
            .federation_setup()
            .await
            .map_err(|e| fail("refresh", e))?;
        if let Some(identifier) = setup.identifier {
            link = store
                .update_remote_link(instance_id, |l| l.identifier = Some(identifier.clone()))
                .map_err(|e| fail("refresh", e))?
                .unwrap_or(link);
        }

        log("Setting your user as admin on instance...");
        let remote = RemoteClient::new(&self.client, &link);
        let me = remote.me(actor).await.map_err(|e| fail("admin", e))?;
        log(&format!("User id on instance: {}", me.id));
        self.call(
            Method::POST,
            port,
            &format!("user/{}/roles", me.id),
            &token,
            &json!({ "id": ADMIN_ROLE }),
        )
        .await
        .map_err(|e| fail("admin", e))?;

        log("Setting new admin password...");
        let password = uuid::Uuid::new_v4().to_string();
        store
            .update(instance_id, |record| {
                record.admin_password = Some(password.clone());
                Ok(())
            })
            .map_err(|e| fail("password", e))?;
        remote
            .post(
                "me/changepass",
                &json!({ "existingPass": DEFAULT_PASSWORD, "newPass": password }),
                None,
            )
            .await
            .map_err(|e| fail("password", e))?;

        log("Done with initial configuration");
        Ok(link)
    }

    async fn login(&self, port: u16) -> Result<String> {
        let url = format!("{}/auth/login", self.api_base(port));
        let response = self
            .client
            .post(&url)
            .json(&json!({ "username": DEFAULT_USERNAME, "password": DEFAULT_PASSWORD }))
            .send()
            .await
            .map_err(|e| AppError::network_with_url(&url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("HTTP {}", response.status()),
            ));
        }
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| AppError::network_with_url(&url, e.to_string()))?;
        Ok(body.token)
    }

    /// Call the instance with the default-credential session token.
    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        port: u16,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<()> {
        let url = format!("{}/{}", self.api_base(port), path);
        let response = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::network_with_url(&url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}
