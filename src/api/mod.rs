//! Remote compute API
//!
//! [`ComputeApi`] is the narrow set of provider operations the lifecycle
//! code depends on: listing, creating and deleting droplets, issuing and
//! polling droplet actions, and listing snapshot images and SSH keys.
//! Every list call is paginated; a page shorter than the requested size
//! marks the end of the collection.
//!
//! [`DigitalOceanClient`] implements it against the DigitalOcean v2 REST API.

mod digitalocean;
mod types;

pub use digitalocean::{DigitalOceanClient, DEFAULT_BASE_URL};
pub use types::*;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("compute api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("compute api {endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("compute api {endpoint}: resource not found")]
    NotFound { endpoint: &'static str },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Operations the remote compute provider must expose.
///
/// Implementations are shared across every logical server, so they must be
/// safe to call concurrently. Reads have no side effects on other servers'
/// resources.
#[async_trait]
pub trait ComputeApi: Send + Sync + 'static {
    async fn list_droplets(&self, page: Page) -> ApiResult<Vec<Droplet>>;

    async fn get_droplet(&self, id: u64) -> ApiResult<Droplet>;

    async fn create_droplet(&self, request: &CreateDropletRequest) -> ApiResult<Droplet>;

    async fn delete_droplet(&self, id: u64) -> ApiResult<()>;

    /// Start an asynchronous action (shutdown, power cycle, resize, snapshot)
    /// against a droplet. The returned [`Action`] is polled with [`get_action`].
    ///
    /// [`get_action`]: ComputeApi::get_action
    async fn droplet_action(&self, droplet_id: u64, action: &DropletAction) -> ApiResult<Action>;

    async fn get_action(&self, id: u64) -> ApiResult<Action>;

    /// Snapshot images owned by the account.
    async fn list_snapshots(&self, page: Page) -> ApiResult<Vec<Image>>;

    async fn delete_image(&self, id: u64) -> ApiResult<()>;

    async fn list_ssh_keys(&self, page: Page) -> ApiResult<Vec<SshKey>>;
}
