//! Droplet lifecycle for logical servers
//!
//! [`DropletHandler`] owns every create and destroy against the droplet
//! backing a logical server. Both operations are idempotent: spinning up a
//! server whose droplet already exists reuses it, and spinning down a server
//! with no droplet is a no-op.

use crate::action::await_action;
use crate::api::{ComputeApi, CreateDropletRequest, Droplet, DropletAction, DropletStatus, ImageRef};
use crate::config::{ServerDefaults, ServerDefinition};
use crate::error::ComputeError;
use crate::locator::{find_droplet, find_snapshot, find_ssh_key_fingerprints, namespaced};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can bring a logical server's instance up and down.
///
/// Controllers depend only on this trait, so a different provider (or a
/// test double) can be wired in without touching the reactor.
#[async_trait]
pub trait LifecycleBackend: Send + Sync {
    /// Ensure an instance exists for `name` and return the address to forward to.
    async fn spinup(&self, name: &str) -> Result<IpAddr, ComputeError>;

    /// Destroy the instance for `name`, snapshotting it first if configured.
    async fn spindown(&self, name: &str) -> Result<(), ComputeError>;
}

/// Polling cadences used while waiting on the provider
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    /// Between droplet status checks while booting
    pub instance_status: Duration,
    /// Between action status checks
    pub action: Duration,
    /// Between shutdown requests while powering off
    pub shutdown_retry: Duration,
}

impl PollIntervals {
    pub fn from_defaults(defaults: &ServerDefaults) -> Self {
        Self {
            instance_status: defaults.status_poll_interval(),
            action: defaults.action_poll_interval(),
            shutdown_retry: defaults.shutdown_retry_interval(),
        }
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self::from_defaults(&ServerDefaults::default())
    }
}

/// Lifecycle backend for DigitalOcean droplets.
pub struct DropletHandler {
    api: Arc<dyn ComputeApi>,
    servers: Arc<HashMap<String, ServerDefinition>>,
    intervals: PollIntervals,
}

impl DropletHandler {
    pub fn new(
        api: Arc<dyn ComputeApi>,
        servers: HashMap<String, ServerDefinition>,
        intervals: PollIntervals,
    ) -> Self {
        Self {
            api,
            servers: Arc::new(servers),
            intervals,
        }
    }

    fn definition(&self, name: &str) -> Result<&ServerDefinition, ComputeError> {
        self.servers
            .get(name)
            .ok_or_else(|| ComputeError::UnknownServer(name.to_string()))
    }

    fn address_of(definition: &ServerDefinition, droplet: &Droplet) -> Result<IpAddr, ComputeError> {
        droplet
            .address(definition.use_public_address)
            .ok_or_else(|| ComputeError::NoAddress {
                name: droplet.name.clone(),
                family: if definition.use_public_address {
                    "public"
                } else {
                    "private"
                },
            })
    }

    /// Pick the boot image, returning the snapshot id when one is consumed.
    async fn resolve_image(
        &self,
        name: &str,
        definition: &ServerDefinition,
    ) -> Result<(ImageRef, Option<u64>), ComputeError> {
        if definition.use_persistent_image {
            match find_snapshot(self.api.as_ref(), name).await {
                Ok(snapshot) => {
                    info!(server = %name, snapshot_id = snapshot.id, "Booting from snapshot");
                    return Ok((ImageRef::Id(snapshot.id), Some(snapshot.id)));
                }
                Err(e) if e.is_not_found() => {
                    debug!(server = %name, "No snapshot found, falling back to image");
                }
                Err(e) => return Err(e),
            }
        }

        match &definition.image {
            Some(slug) => Ok((ImageRef::Slug(slug.clone()), None)),
            None => Err(ComputeError::ImageNotFound(name.to_string())),
        }
    }

    /// Poll a droplet until it reports `active`. Lookup errors are retried.
    async fn wait_until_active(&self, id: u64) -> Droplet {
        loop {
            match self.api.get_droplet(id).await {
                Ok(droplet) if droplet.status == DropletStatus::Active => return droplet,
                Ok(droplet) => {
                    debug!(droplet_id = id, status = ?droplet.status, "Waiting for droplet to become active");
                }
                Err(e) => {
                    warn!(droplet_id = id, error = %e, "Could not fetch droplet status, retrying");
                }
            }
            tokio::time::sleep(self.intervals.instance_status).await;
        }
    }

    /// Request an action and wait for it to finish.
    async fn run_action(&self, droplet_id: u64, action: DropletAction) -> Result<(), ComputeError> {
        let kind = action.kind();
        let started = self.api.droplet_action(droplet_id, &action).await?;
        debug!(droplet_id, action_id = started.id, kind, "Action requested");

        if await_action(self.api.as_ref(), started.id, self.intervals.action).await {
            Ok(())
        } else {
            Err(ComputeError::ActionFailed {
                kind,
                action_id: started.id,
            })
        }
    }

    /// Shut a droplet down, re-requesting until it reports `off`.
    async fn power_off(&self, droplet: &Droplet) -> Result<(), ComputeError> {
        let mut status = droplet.status;
        let mut requests: u32 = 0;

        while status != DropletStatus::Off {
            requests += 1;
            match self.api.droplet_action(droplet.id, &DropletAction::Shutdown).await {
                Ok(action) => debug!(droplet_id = droplet.id, action_id = action.id, requests, "Shutdown requested"),
                Err(e) => warn!(droplet_id = droplet.id, error = %e, "Shutdown request failed"),
            }

            tokio::time::sleep(self.intervals.shutdown_retry).await;

            match self.api.get_droplet(droplet.id).await {
                Ok(current) => status = current.status,
                Err(e) if e.is_not_found() => return Err(ComputeError::Vanished(droplet.name.clone())),
                Err(e) => warn!(droplet_id = droplet.id, error = %e, "Could not fetch droplet status, retrying"),
            }
        }

        info!(droplet_id = droplet.id, name = %droplet.name, "Droplet is off");
        Ok(())
    }

    /// Bring an existing droplet to `active` if it isn't already.
    async fn reuse(&self, droplet: Droplet) -> Result<Droplet, ComputeError> {
        match droplet.status {
            DropletStatus::Active => Ok(droplet),
            DropletStatus::Off => {
                info!(droplet_id = droplet.id, name = %droplet.name, "Powering on existing droplet");
                self.run_action(droplet.id, DropletAction::PowerOn).await?;
                Ok(self.wait_until_active(droplet.id).await)
            }
            DropletStatus::Other => Ok(self.wait_until_active(droplet.id).await),
        }
    }
}

#[async_trait]
impl LifecycleBackend for DropletHandler {
    async fn spinup(&self, name: &str) -> Result<IpAddr, ComputeError> {
        let definition = self.definition(name)?;

        match find_droplet(self.api.as_ref(), name).await {
            Ok(existing) => {
                debug!(server = %name, droplet_id = existing.id, "Droplet already exists");
                let droplet = self.reuse(existing).await?;
                return Self::address_of(definition, &droplet);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let (image, consumed_snapshot) = self.resolve_image(name, definition).await?;
        let ssh_keys = find_ssh_key_fingerprints(self.api.as_ref(), &definition.ssh_keys).await?;

        let request = CreateDropletRequest {
            name: namespaced(name),
            region: definition.region.clone(),
            size: definition.create_size().to_string(),
            image,
            private_networking: true,
            ssh_keys,
            volumes: definition.volumes.clone(),
            user_data: definition.user_data.clone(),
        };

        let created = self.api.create_droplet(&request).await?;
        info!(server = %name, droplet_id = created.id, size = %request.size, image = %request.image, "Droplet created");

        self.wait_until_active(created.id).await;
        info!(server = %name, droplet_id = created.id, "Droplet is active");

        // The droplet now carries the snapshot's state, whatever happens next
        if let Some(snapshot_id) = consumed_snapshot {
            match self.api.delete_image(snapshot_id).await {
                Ok(()) => debug!(server = %name, snapshot_id, "Deleted consumed snapshot"),
                Err(e) => warn!(server = %name, snapshot_id, error = %e, "Failed to delete consumed snapshot"),
            }
        }

        if definition.needs_resize() {
            info!(server = %name, from = %request.size, to = %definition.size, "Resizing droplet");
            self.run_action(created.id, DropletAction::PowerOff).await?;
            self.run_action(
                created.id,
                DropletAction::Resize {
                    size: definition.size.clone(),
                },
            )
            .await?;
            self.run_action(created.id, DropletAction::PowerOn).await?;
        }

        let droplet = self.api.get_droplet(created.id).await?;
        Self::address_of(definition, &droplet)
    }

    async fn spindown(&self, name: &str) -> Result<(), ComputeError> {
        let definition = self.definition(name)?;

        let droplet = match find_droplet(self.api.as_ref(), name).await {
            Ok(droplet) => droplet,
            Err(e) if e.is_not_found() => {
                info!(server = %name, "No droplet to spin down");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(server = %name, droplet_id = droplet.id, "Spinning down droplet");
        self.power_off(&droplet).await?;

        if definition.use_persistent_image {
            info!(server = %name, droplet_id = droplet.id, "Saving snapshot");
            self.run_action(
                droplet.id,
                DropletAction::Snapshot {
                    name: namespaced(name),
                },
            )
            .await?;
        }

        self.api.delete_droplet(droplet.id).await?;
        info!(server = %name, droplet_id = droplet.id, "Droplet deleted");
        Ok(())
    }
}
