//! In-memory stand-in for the DigitalOcean API shared by integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dospin::api::{
    Action, ActionStatus, ApiError, ApiResult, ComputeApi, CreateDropletRequest, Droplet,
    DropletAction, DropletStatus, Image, Networks, NetworkKind, NetworkV4, Page, SshKey,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// One recorded API call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListDroplets(u32),
    GetDroplet(u64),
    CreateDroplet(CreateDropletRequest),
    DeleteDroplet(u64),
    DropletAction(u64, DropletAction),
    GetAction(u64),
    ListSnapshots(u32),
    DeleteImage(u64),
    ListSshKeys(u32),
}

impl Call {
    /// Whether the call changes anything on the provider
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::CreateDroplet(_) | Call::DeleteDroplet(_) | Call::DropletAction(..) | Call::DeleteImage(_)
        )
    }
}

struct FakeDroplet {
    droplet: Droplet,
    /// Status reads left before a booting droplet turns active
    boot_polls_left: u32,
}

#[derive(Default)]
struct State {
    droplets: Vec<FakeDroplet>,
    snapshots: Vec<Image>,
    ssh_keys: Vec<SshKey>,
    actions: HashMap<u64, Action>,
    /// Droplet reads left that fail with a 503
    failing_fetches: u32,
    next_id: u64,
    calls: Vec<Call>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn droplet_mut(&mut self, id: u64) -> Option<&mut FakeDroplet> {
        self.droplets.iter_mut().find(|d| d.droplet.id == id)
    }
}

/// Fake provider with droplets that boot after a few status polls.
pub struct FakeCompute {
    state: Mutex<State>,
    private_ip: Ipv4Addr,
    public_ip: Ipv4Addr,
    boot_polls: u32,
    /// Action kind that completes as `errored`
    failing_action: Mutex<Option<&'static str>>,
    /// Remove the droplet as soon as a shutdown is requested
    vanish_on_shutdown: Mutex<bool>,
}

fn paginate<T: Clone>(items: &[T], page: Page) -> Vec<T> {
    let start = ((page.page.max(1) - 1) * page.per_page) as usize;
    items.iter().skip(start).take(page.per_page as usize).cloned().collect()
}

fn networks(private_ip: Ipv4Addr, public_ip: Ipv4Addr) -> Networks {
    Networks {
        v4: vec![
            NetworkV4 {
                ip_address: private_ip.to_string(),
                kind: NetworkKind::Private,
            },
            NetworkV4 {
                ip_address: public_ip.to_string(),
                kind: NetworkKind::Public,
            },
        ],
    }
}

pub fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

impl FakeCompute {
    pub fn new(private_ip: Ipv4Addr) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1000,
                ..Default::default()
            }),
            private_ip,
            public_ip: Ipv4Addr::new(203, 0, 113, 10),
            boot_polls: 2,
            failing_action: Mutex::new(None),
            vanish_on_shutdown: Mutex::new(false),
        }
    }

    pub fn with_droplet(self, name: &str, status: DropletStatus) -> Self {
        {
            let mut state = self.state.lock();
            let id = state.next_id();
            state.droplets.push(FakeDroplet {
                droplet: Droplet {
                    id,
                    name: name.to_string(),
                    status,
                    networks: networks(self.private_ip, self.public_ip),
                },
                boot_polls_left: 0,
            });
        }
        self
    }

    /// Add `count` droplets that belong to someone else
    pub fn with_unrelated_droplets(self, count: usize) -> Self {
        {
            let mut state = self.state.lock();
            for i in 0..count {
                let id = state.next_id();
                state.droplets.push(FakeDroplet {
                    droplet: Droplet {
                        id,
                        name: format!("web-{i}"),
                        status: DropletStatus::Active,
                        networks: Networks::default(),
                    },
                    boot_polls_left: 0,
                });
            }
        }
        self
    }

    pub fn with_snapshot(self, name: &str, created_at: DateTime<Utc>) -> Self {
        {
            let mut state = self.state.lock();
            let id = state.next_id();
            state.snapshots.push(Image {
                id,
                name: name.to_string(),
                created_at: Some(created_at),
            });
        }
        self
    }

    pub fn with_ssh_key(self, name: &str, fingerprint: &str) -> Self {
        {
            let mut state = self.state.lock();
            let id = state.next_id();
            state.ssh_keys.push(SshKey {
                id,
                name: name.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }
        self
    }

    pub fn fail_action(&self, kind: &'static str) {
        *self.failing_action.lock() = Some(kind);
    }

    /// Make the next `count` droplet reads fail with a transient error
    pub fn fail_droplet_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    pub fn droplet_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::GetDroplet(_)))
            .count()
    }

    pub fn vanish_on_shutdown(&self) {
        *self.vanish_on_shutdown.lock() = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn creates(&self) -> Vec<CreateDropletRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateDroplet(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Kinds of every droplet action requested, in order
    pub fn action_kinds(&self) -> Vec<&'static str> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DropletAction(_, action) => Some(action.kind()),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::DeleteDroplet(_)))
            .count()
    }

    pub fn droplet_names(&self) -> Vec<String> {
        self.state
            .lock()
            .droplets
            .iter()
            .map(|d| d.droplet.name.clone())
            .collect()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.state.lock().snapshots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn snapshot_ids(&self) -> Vec<u64> {
        self.state.lock().snapshots.iter().map(|s| s.id).collect()
    }
}

fn not_found(endpoint: &'static str) -> ApiError {
    ApiError::NotFound { endpoint }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn list_droplets(&self, page: Page) -> ApiResult<Vec<Droplet>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListDroplets(page.page));
        let droplets: Vec<Droplet> = state.droplets.iter().map(|d| d.droplet.clone()).collect();
        Ok(paginate(&droplets, page))
    }

    async fn get_droplet(&self, id: u64) -> ApiResult<Droplet> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetDroplet(id));
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ApiError::Status {
                endpoint: "get droplet",
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        let fake = state.droplet_mut(id).ok_or_else(|| not_found("get droplet"))?;
        if fake.droplet.status == DropletStatus::Other {
            if fake.boot_polls_left == 0 {
                fake.droplet.status = DropletStatus::Active;
            } else {
                fake.boot_polls_left -= 1;
            }
        }
        Ok(fake.droplet.clone())
    }

    async fn create_droplet(&self, request: &CreateDropletRequest) -> ApiResult<Droplet> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateDroplet(request.clone()));
        let id = state.next_id();
        let droplet = Droplet {
            id,
            name: request.name.clone(),
            status: DropletStatus::Other,
            networks: networks(self.private_ip, self.public_ip),
        };
        state.droplets.push(FakeDroplet {
            droplet: droplet.clone(),
            boot_polls_left: self.boot_polls,
        });
        Ok(droplet)
    }

    async fn delete_droplet(&self, id: u64) -> ApiResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::DeleteDroplet(id));
        let before = state.droplets.len();
        state.droplets.retain(|d| d.droplet.id != id);
        if state.droplets.len() == before {
            return Err(not_found("delete droplet"));
        }
        Ok(())
    }

    async fn droplet_action(&self, droplet_id: u64, action: &DropletAction) -> ApiResult<Action> {
        let failing = *self.failing_action.lock();
        let vanish = *self.vanish_on_shutdown.lock();

        let mut state = self.state.lock();
        state.calls.push(Call::DropletAction(droplet_id, action.clone()));
        let fake = state.droplet_mut(droplet_id).ok_or_else(|| not_found("droplet action"))?;
        match action {
            DropletAction::Shutdown | DropletAction::PowerOff => fake.droplet.status = DropletStatus::Off,
            DropletAction::PowerOn => fake.droplet.status = DropletStatus::Active,
            DropletAction::Resize { .. } | DropletAction::Snapshot { .. } => {}
        }

        if vanish && *action == DropletAction::Shutdown {
            state.droplets.retain(|d| d.droplet.id != droplet_id);
        }

        let status = if failing == Some(action.kind()) {
            ActionStatus::Errored
        } else {
            ActionStatus::Completed
        };

        if let DropletAction::Snapshot { name: snapshot_name } = action {
            if status == ActionStatus::Completed {
                let id = state.next_id();
                let created_at = timestamp(1_700_000_000 + id as i64);
                state.snapshots.push(Image {
                    id,
                    name: snapshot_name.clone(),
                    created_at: Some(created_at),
                });
            }
        }

        let id = state.next_id();
        let recorded = Action {
            id,
            status,
            kind: action.kind().to_string(),
            resource_id: Some(droplet_id),
        };
        state.actions.insert(id, recorded.clone());

        // Report in-progress first; the poller sees the final status
        Ok(Action {
            status: ActionStatus::InProgress,
            ..recorded
        })
    }

    async fn get_action(&self, id: u64) -> ApiResult<Action> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetAction(id));
        state.actions.get(&id).cloned().ok_or_else(|| not_found("get action"))
    }

    async fn list_snapshots(&self, page: Page) -> ApiResult<Vec<Image>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListSnapshots(page.page));
        Ok(paginate(&state.snapshots, page))
    }

    async fn delete_image(&self, id: u64) -> ApiResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::DeleteImage(id));
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.id != id);
        if state.snapshots.len() == before {
            return Err(not_found("delete image"));
        }
        Ok(())
    }

    async fn list_ssh_keys(&self, page: Page) -> ApiResult<Vec<SshKey>> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListSshKeys(page.page));
        Ok(paginate(&state.ssh_keys, page))
    }
}
