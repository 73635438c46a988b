//! Authenticated HTTP access to an instance through its remote link.

use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::store::RemoteLink;

/// Header naming the parent-side user a federated call is made on behalf of.
pub const ACTOR_HEADER: &str = "X-Federation-User";

/// User as reported by the child's `me` endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteUser {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationSetup {
    #[serde(default)]
    pub identifier: Option<String>,
}

pub struct RemoteClient<'a> {
    client: &'a Client,
    link: &'a RemoteLink,
}

impl<'a> RemoteClient<'a> {
    pub fn new(client: &'a Client, link: &'a RemoteLink) -> Self {
        Self { client, link }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.link.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        actor: Option<&str>,
        body: Option<&B>,
    ) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.link.api_key);
        if let Some(actor) = actor {
            request = request.header(ACTOR_HEADER, actor);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::network_with_url(&url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::network_with_url(
                &url,
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(response)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, actor: Option<&str>) -> Result<T> {
        let response = self.send::<()>(Method::GET, path, actor, None).await?;
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|e| AppError::network_with_url(&url, e.to_string()))
    }

    /// POST a JSON body. Only the response status is checked.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        actor: Option<&str>,
    ) -> Result<()> {
        self.send(Method::POST, path, actor, Some(body)).await?;
        Ok(())
    }

    pub async fn me(&self, actor: &str) -> Result<RemoteUser> {
        self.get("me", Some(actor)).await
    }

    pub async fn federation_setup(&self) -> Result<FederationSetup> {
        self.get("federation/setup", None).await
    }
}
