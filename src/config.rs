use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Idle timeout used when none is configured or the configured one is unparsable
pub const FALLBACK_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Global configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Process-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Defaults for every logical server
    #[serde(default)]
    pub defaults: ServerDefaults,

    /// Logical server definitions keyed by name
    #[serde(default)]
    pub servers: HashMap<String, ServerDefinition>,
}

/// How accepted client traffic reaches a spun-up droplet
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Relay bytes through this process (default)
    #[default]
    Proxy,
    /// Install kernel NAT rules and get out of the data path
    Nat,
}

/// Packet filter used for NAT forwarding
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NatBackendKind {
    #[default]
    Pf,
    Iptables,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Compute API bearer token
    pub api_token: Option<String>,

    /// Compute API base URL (default: DigitalOcean v2)
    pub api_url: Option<String>,

    /// Address the per-port listeners bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the local admin API (0 disables it)
    #[serde(default)]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    #[serde(default)]
    pub forwarding: ForwardingMode,

    /// Network interface NAT rules attach to (required for NAT forwarding)
    pub nat_interface: Option<String>,

    #[serde(default)]
    pub nat_backend: NatBackendKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_url: None,
            bind: default_bind_address(),
            admin_port: 0,
            admin_token: None,
            pid_file: None,
            forwarding: ForwardingMode::default(),
            nat_interface: None,
            nat_backend: NatBackendKind::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerDefaults {
    /// Idle period after which a server is spun down, e.g. "5m" or "90s"
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout: String,

    /// How often each controller checks for idleness
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// How often an open proxied connection reports liveness
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Droplet status polling interval while waiting for boot
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_ms: u64,

    /// Action polling interval
    #[serde(default = "default_action_poll_interval")]
    pub action_poll_interval_ms: u64,

    /// Interval between shutdown requests while powering off
    #[serde(default = "default_shutdown_retry_interval")]
    pub shutdown_retry_interval_ms: u64,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            activity_timeout: default_activity_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            liveness_interval_secs: default_liveness_interval(),
            status_poll_interval_ms: default_status_poll_interval(),
            action_poll_interval_ms: default_action_poll_interval(),
            shutdown_retry_interval_ms: default_shutdown_retry_interval(),
        }
    }
}

impl ServerDefaults {
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn action_poll_interval(&self) -> Duration {
        Duration::from_millis(self.action_poll_interval_ms)
    }

    pub fn shutdown_retry_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_retry_interval_ms)
    }
}

/// Definition of one logical server
///
/// Read-only once loaded; the name is the key in `[servers]`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerDefinition {
    /// Ports to listen on; each connection is forwarded to the same port on the droplet
    #[serde(default)]
    pub ports: Vec<u16>,

    pub region: String,

    /// Final droplet size slug
    pub size: String,

    /// Size to create the droplet with before resizing to `size`
    pub initial_size: Option<String>,

    /// Template image slug used when no snapshot is available
    pub image: Option<String>,

    /// Snapshot the droplet on spin-down and boot from the snapshot next time
    #[serde(default)]
    pub use_persistent_image: bool,

    /// Forward to the public address instead of the private one
    #[serde(default)]
    pub use_public_address: bool,

    /// Names of SSH keys registered with the provider
    #[serde(default)]
    pub ssh_keys: Vec<String>,

    /// Block storage volume names to attach
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Boot data handed to the droplet (cloud-init etc.)
    pub user_data: Option<String>,

    /// Idle timeout (overrides default)
    pub activity_timeout: Option<String>,
}

impl ServerDefinition {
    pub fn new(region: &str, size: &str, ports: Vec<u16>) -> Self {
        Self {
            ports,
            region: region.to_string(),
            size: size.to_string(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    pub fn with_initial_size(mut self, size: &str) -> Self {
        self.initial_size = Some(size.to_string());
        self
    }

    pub fn with_activity_timeout(mut self, timeout: &str) -> Self {
        self.activity_timeout = Some(timeout.to_string());
        self
    }

    /// Size to create with: `initial_size` when set, otherwise `size`
    pub fn create_size(&self) -> &str {
        self.initial_size.as_deref().unwrap_or(&self.size)
    }

    /// Whether the droplet must be resized after creation
    pub fn needs_resize(&self) -> bool {
        self.initial_size
            .as_deref()
            .is_some_and(|initial| initial != self.size)
    }

    /// Idle timeout; unparsable values fall back rather than failing
    pub fn idle_timeout(&self, defaults: &ServerDefaults) -> Duration {
        let raw = self
            .activity_timeout
            .as_deref()
            .unwrap_or(&defaults.activity_timeout);
        parse_activity_timeout(raw)
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.trim().is_empty() {
            return Err("Server name must not be empty".to_string());
        }
        if self.ports.is_empty() {
            return Err(format!("Server '{}' has no ports", name));
        }
        if self.ports.contains(&0) {
            return Err(format!("Server '{}' has an invalid port 0", name));
        }
        if self.region.trim().is_empty() {
            return Err(format!("Server '{}' requires 'region'", name));
        }
        if self.size.trim().is_empty() {
            return Err(format!("Server '{}' requires 'size'", name));
        }
        if !self.use_persistent_image && self.image.is_none() {
            return Err(format!(
                "Server '{}' requires 'image' unless use_persistent_image is set",
                name
            ));
        }
        Ok(())
    }
}

/// Parse a humantime duration ("2m", "90s", "1h 30m"), or bare seconds.
pub fn parse_activity_timeout(raw: &str) -> Duration {
    let raw = raw.trim();
    let parsed = raw
        .parse::<u64>()
        .map(Duration::from_secs)
        .or_else(|_| humantime::parse_duration(raw));

    match parsed {
        Ok(d) if !d.is_zero() => d,
        Ok(_) => {
            warn!(value = raw, "Zero activity timeout, using fallback");
            FALLBACK_ACTIVITY_TIMEOUT
        }
        Err(e) => {
            warn!(value = raw, error = %e, "Unparsable activity timeout, using fallback");
            FALLBACK_ACTIVITY_TIMEOUT
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_activity_timeout() -> String {
    "5m".to_string()
}

fn default_idle_check_interval() -> u64 {
    60
}

fn default_liveness_interval() -> u64 {
    60
}

fn default_status_poll_interval() -> u64 {
    500
}

fn default_action_poll_interval() -> u64 {
    1000
}

fn default_shutdown_retry_interval() -> u64 {
    2000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.servers.is_empty() {
            errors.push("No servers configured".to_string());
        }

        let mut names: Vec<&String> = self.servers.keys().collect();
        names.sort();

        let mut claimed: HashMap<u16, &str> = HashMap::new();
        for name in names {
            let server = &self.servers[name];
            if let Err(e) = server.validate(name) {
                errors.push(e);
            }
            for &port in &server.ports {
                if let Some(owner) = claimed.insert(port, name) {
                    if owner != name.as_str() {
                        errors.push(format!(
                            "Port {} is claimed by both '{}' and '{}'",
                            port, owner, name
                        ));
                    }
                }
            }
        }

        if self.server.forwarding == ForwardingMode::Nat && self.server.nat_interface.is_none() {
            errors.push("NAT forwarding requires 'nat_interface'".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// API token, required by every mode that talks to the provider
    pub fn api_token(&self) -> anyhow::Result<&str> {
        self.server
            .api_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("'server.api_token' is required"))
    }
}
