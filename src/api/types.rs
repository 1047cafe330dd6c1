use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

// ── Pagination ───────────────────────────────────────────────────────

/// One page request against a paginated collection (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn first(per_page: u32) -> Self {
        Self { page: 1, per_page }
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            ..self
        }
    }
}

// ── Droplets ─────────────────────────────────────────────────────────

/// Power status of a droplet. Anything the provider reports besides
/// `active` and `off` (`new`, `archive`, ...) collapses into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropletStatus {
    Active,
    Off,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    pub status: DropletStatus,
    #[serde(default)]
    pub networks: Networks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: NetworkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Public,
    Private,
    #[serde(other)]
    Other,
}

impl Droplet {
    fn ipv4(&self, kind: NetworkKind) -> Option<Ipv4Addr> {
        self.networks
            .v4
            .iter()
            .filter(|n| n.kind == kind)
            .find_map(|n| n.ip_address.parse().ok())
    }

    pub fn private_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4(NetworkKind::Private)
    }

    pub fn public_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4(NetworkKind::Public)
    }

    /// The address clients should be forwarded to.
    pub fn address(&self, public: bool) -> Option<IpAddr> {
        let ip = if public {
            self.public_ipv4()
        } else {
            self.private_ipv4()
        };
        ip.map(IpAddr::V4)
    }
}

/// Boot image for a new droplet: a snapshot id or a template slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ImageRef {
    Id(u64),
    Slug(String),
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Id(id) => write!(f, "snapshot {}", id),
            ImageRef::Slug(slug) => f.write_str(slug),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: ImageRef,
    pub private_networking: bool,
    /// SSH key fingerprints
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

// ── Actions ──────────────────────────────────────────────────────────

/// Asynchronous mutation requested against a droplet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DropletAction {
    /// Graceful ACPI shutdown
    Shutdown,
    /// Hard power off
    PowerOff,
    PowerOn,
    Resize { size: String },
    Snapshot { name: String },
}

impl DropletAction {
    pub fn kind(&self) -> &'static str {
        match self {
            DropletAction::Shutdown => "shutdown",
            DropletAction::PowerOff => "power_off",
            DropletAction::PowerOn => "power_on",
            DropletAction::Resize { .. } => "resize",
            DropletAction::Snapshot { .. } => "snapshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    InProgress,
    Completed,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub status: ActionStatus,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub resource_id: Option<u64>,
}

// ── Images and keys ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub fingerprint: String,
}
