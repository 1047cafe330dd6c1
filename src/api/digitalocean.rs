//! DigitalOcean v2 REST client

use super::{
    Action, ApiError, ApiResult, ComputeApi, CreateDropletRequest, Droplet, DropletAction, Image,
    Page, SshKey,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com/v2";

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct DropletsEnvelope {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: Action,
}

#[derive(Deserialize)]
struct ImagesEnvelope {
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Deserialize)]
struct SshKeysEnvelope {
    #[serde(default)]
    ssh_keys: Vec<SshKey>,
}

/// Client for the DigitalOcean droplet, action, image and key APIs.
#[derive(Clone)]
pub struct DigitalOceanClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl DigitalOceanClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> ApiResult<reqwest::Response> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound { endpoint });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        endpoint: &'static str,
    ) -> ApiResult<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", self.auth())
            .query(query)
            .send()
            .await?;

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(ApiError::from)
    }

    async fn delete(&self, path: &str, endpoint: &'static str) -> ApiResult<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, endpoint).await?;
        Ok(())
    }

    fn page_query(page: Page) -> [(&'static str, String); 2] {
        [
            ("page", page.page.to_string()),
            ("per_page", page.per_page.to_string()),
        ]
    }
}

#[async_trait]
impl ComputeApi for DigitalOceanClient {
    async fn list_droplets(&self, page: Page) -> ApiResult<Vec<Droplet>> {
        let envelope: DropletsEnvelope = self
            .get_json("/droplets", &Self::page_query(page), "list droplets")
            .await?;
        Ok(envelope.droplets)
    }

    async fn get_droplet(&self, id: u64) -> ApiResult<Droplet> {
        let envelope: DropletEnvelope = self
            .get_json(&format!("/droplets/{id}"), &[], "get droplet")
            .await?;
        Ok(envelope.droplet)
    }

    async fn create_droplet(&self, request: &CreateDropletRequest) -> ApiResult<Droplet> {
        debug!(name = %request.name, image = %request.image, "Creating droplet");
        let resp = self
            .http
            .post(self.url("/droplets"))
            .header("Authorization", self.auth())
            .json(request)
            .send()
            .await?;

        let envelope: DropletEnvelope = Self::check(resp, "create droplet").await?.json().await?;
        Ok(envelope.droplet)
    }

    async fn delete_droplet(&self, id: u64) -> ApiResult<()> {
        self.delete(&format!("/droplets/{id}"), "delete droplet").await
    }

    async fn droplet_action(&self, droplet_id: u64, action: &DropletAction) -> ApiResult<Action> {
        let resp = self
            .http
            .post(self.url(&format!("/droplets/{droplet_id}/actions")))
            .header("Authorization", self.auth())
            .json(action)
            .send()
            .await?;

        let envelope: ActionEnvelope = Self::check(resp, "droplet action").await?.json().await?;
        Ok(envelope.action)
    }

    async fn get_action(&self, id: u64) -> ApiResult<Action> {
        let envelope: ActionEnvelope = self
            .get_json(&format!("/actions/{id}"), &[], "get action")
            .await?;
        Ok(envelope.action)
    }

    async fn list_snapshots(&self, page: Page) -> ApiResult<Vec<Image>> {
        let [page_param, per_page_param] = Self::page_query(page);
        let query = [("private", "true".to_string()), page_param, per_page_param];
        let envelope: ImagesEnvelope = self.get_json("/images", &query, "list images").await?;
        Ok(envelope.images)
    }

    async fn delete_image(&self, id: u64) -> ApiResult<()> {
        self.delete(&format!("/images/{id}"), "delete image").await
    }

    async fn list_ssh_keys(&self, page: Page) -> ApiResult<Vec<SshKey>> {
        let envelope: SshKeysEnvelope = self
            .get_json("/account/keys", &Self::page_query(page), "list ssh keys")
            .await?;
        Ok(envelope.ssh_keys)
    }
}
