//! Per-server lifecycle controller
//!
//! Each logical server gets one [`ServerManager`], a single task draining an
//! event queue. Spin-ups and spin-downs run inline on that task, so at most
//! one lifecycle operation is ever in flight per server and events are
//! handled strictly in arrival order. Everything else talks to the
//! controller through a cloneable [`ServerHandle`].

use crate::compute::LifecycleBackend;
use crate::forward::{rule_name, Forwarder};
use crate::proxy::{relay, ConnStatus, LivenessSink};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events processed by a controller, in arrival order
#[derive(Debug)]
pub enum ServerEvent {
    /// A client connected to one of the server's ports
    Connection(TcpStream),
    /// Signal from a proxy session
    Liveness(ConnStatus),
    /// Forced teardown, independent of the idle timeout
    Spindown,
    /// Snapshot of the controller's state
    Status(oneshot::Sender<ServerStatus>),
    /// Exit the event loop
    Stop,
}

/// Point-in-time view of a controller
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub ports: Vec<u16>,
    pub idle_timeout: Duration,
    /// Time since the last connection or liveness signal
    pub idle_for: Duration,
    pub active_sessions: usize,
    /// Whether an instance is believed to exist
    pub provisioned: bool,
}

/// Timing knobs for one controller
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub idle_timeout: Duration,
    /// How often idleness is checked
    pub check_interval: Duration,
    /// How often open proxy sessions report liveness
    pub pulse_interval: Duration,
}

/// Cloneable handle to a running controller.
#[derive(Clone)]
pub struct ServerHandle {
    name: Arc<str>,
    events: mpsc::UnboundedSender<ServerEvent>,
    stopped: watch::Receiver<bool>,
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, event: ServerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Enqueue an accepted connection. Never blocks.
    pub fn submit_connection(&self, stream: TcpStream) -> bool {
        self.send(ServerEvent::Connection(stream))
    }

    /// Enqueue a forced spin-down.
    pub fn request_spindown(&self) -> bool {
        self.send(ServerEvent::Spindown)
    }

    /// Ask the controller to exit once the event in progress finishes.
    pub fn stop(&self) -> bool {
        self.send(ServerEvent::Stop)
    }

    /// Wait until the controller's loop has exited.
    pub async fn await_stopped(&self) {
        let mut stopped = self.stopped.clone();
        // A dropped sender means the loop is gone as well
        let _ = stopped.wait_for(|done| *done).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Current status, answered in turn by the controller.
    ///
    /// Returns `None` if the controller has stopped.
    pub async fn status(&self) -> Option<ServerStatus> {
        let (tx, rx) = oneshot::channel();
        if !self.send(ServerEvent::Status(tx)) {
            return None;
        }
        rx.await.ok()
    }
}

impl LivenessSink for ServerHandle {
    fn signal(&self, status: ConnStatus) -> bool {
        self.send(ServerEvent::Liveness(status))
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Reactor owning the lifecycle of one logical server.
pub struct ServerManager {
    name: String,
    ports: Vec<u16>,
    backend: Arc<dyn LifecycleBackend>,
    forwarder: Forwarder,
    settings: ControllerSettings,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    /// Handed to proxy sessions so they can report liveness
    handle: ServerHandle,
    stopped: watch::Sender<bool>,
    last_activity: Instant,
    provisioned: bool,
    active_sessions: usize,
    /// Droplet address the NAT rules currently point at
    nat_target: Option<IpAddr>,
}

impl ServerManager {
    pub fn new(
        name: impl Into<String>,
        ports: Vec<u16>,
        backend: Arc<dyn LifecycleBackend>,
        forwarder: Forwarder,
        settings: ControllerSettings,
    ) -> (Self, ServerHandle) {
        let name = name.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let handle = ServerHandle {
            name: Arc::from(name.as_str()),
            events: events_tx,
            stopped: stopped_rx,
        };

        let manager = Self {
            name,
            ports,
            backend,
            forwarder,
            settings,
            events: events_rx,
            handle: handle.clone(),
            stopped: stopped_tx,
            last_activity: Instant::now(),
            // An instance may have survived a restart, so start armed
            provisioned: true,
            active_sessions: 0,
            nat_target: None,
        };

        (manager, handle)
    }

    /// Start the controller on its own task.
    pub fn spawn(
        name: impl Into<String>,
        ports: Vec<u16>,
        backend: Arc<dyn LifecycleBackend>,
        forwarder: Forwarder,
        settings: ControllerSettings,
    ) -> ServerHandle {
        let (manager, handle) = Self::new(name, ports, backend, forwarder, settings);
        tokio::spawn(manager.serve());
        handle
    }

    /// Run the event loop until a stop event arrives.
    pub async fn serve(mut self) {
        info!(
            server = %self.name,
            ports = ?self.ports,
            idle_timeout = ?self.settings.idle_timeout,
            "Controller started"
        );

        let check_interval = self.settings.check_interval;
        let mut idle_check = interval_at(Instant::now() + check_interval, check_interval);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => match event {
                    Some(ServerEvent::Stop) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
                _ = idle_check.tick() => self.check_idle().await,
            }
        }

        info!(server = %self.name, "Controller stopped");
        let _ = self.stopped.send(true);
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connection(stream) => self.on_connection(stream).await,
            ServerEvent::Liveness(status) => self.on_liveness(status),
            ServerEvent::Spindown => self.spindown("requested").await,
            ServerEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
            ServerEvent::Stop => {}
        }
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.name.clone(),
            ports: self.ports.clone(),
            idle_timeout: self.settings.idle_timeout,
            idle_for: self.last_activity.elapsed(),
            active_sessions: self.active_sessions,
            provisioned: self.provisioned,
        }
    }

    async fn on_connection(&mut self, stream: TcpStream) {
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(server = %self.name, error = %e, "Dropping connection without local address");
                return;
            }
        };
        let peer = stream.peer_addr().ok();
        debug!(server = %self.name, port = local.port(), ?peer, "Handling connection");

        // Armed before spin-up: a failed spin-up may still leave a droplet behind
        self.provisioned = true;
        self.last_activity = Instant::now();

        let address = match self.backend.spinup(&self.name).await {
            Ok(address) => address,
            Err(e) => {
                error!(server = %self.name, error = %e, "Spin-up failed, dropping connection");
                return;
            }
        };
        self.last_activity = Instant::now();

        match self.forwarder.clone() {
            Forwarder::Proxy => {
                let target = SocketAddr::new(address, local.port());
                tokio::spawn(relay(stream, target, self.handle.clone(), self.settings.pulse_interval));
            }
            Forwarder::Nat(nat) => {
                if self.nat_target != Some(address) {
                    let mut installed = true;
                    for &port in &self.ports {
                        let rule = rule_name(&self.name, port);
                        if let Err(e) = nat.add_forwarding_rule(&rule, local.ip(), address, port).await {
                            error!(server = %self.name, rule = %rule, error = %e, "Failed to install forwarding rule");
                            installed = false;
                        }
                    }
                    if installed {
                        self.nat_target = Some(address);
                    }
                }
                // The client's retry is redirected by the kernel
                drop(stream);
            }
        }
    }

    fn on_liveness(&mut self, status: ConnStatus) {
        self.last_activity = Instant::now();
        match status {
            ConnStatus::Opened => self.active_sessions += 1,
            ConnStatus::Active => {}
            ConnStatus::Disconnected => {
                self.active_sessions = self.active_sessions.saturating_sub(1);
            }
        }
    }

    async fn check_idle(&mut self) {
        if !self.provisioned {
            return;
        }
        let idle_for = self.last_activity.elapsed();
        if idle_for > self.settings.idle_timeout {
            info!(server = %self.name, idle_for = ?idle_for, "Idle timeout reached");
            self.spindown("idle").await;
        }
    }

    async fn spindown(&mut self, reason: &str) {
        info!(server = %self.name, reason, "Spinning down");
        match self.backend.spindown(&self.name).await {
            Ok(()) => {
                self.provisioned = false;
                info!(server = %self.name, "Spin-down complete");
                self.remove_nat_rules().await;
            }
            Err(e) => error!(server = %self.name, error = %e, "Spin-down failed"),
        }
    }

    async fn remove_nat_rules(&mut self) {
        let Forwarder::Nat(nat) = self.forwarder.clone() else {
            return;
        };
        if self.nat_target.take().is_none() {
            return;
        }
        for &port in &self.ports {
            let rule = rule_name(&self.name, port);
            if let Err(e) = nat.remove_forwarding_rule(&rule).await {
                error!(server = %self.name, rule = %rule, error = %e, "Failed to remove forwarding rule");
            }
        }
    }
}

/// Running controllers indexed by logical server name
#[derive(Debug, Default, Clone)]
pub struct ServerRegistry {
    servers: HashMap<String, ServerHandle>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ServerHandle) {
        self.servers.insert(handle.name().to_string(), handle);
    }

    pub fn get(&self, name: &str) -> Option<&ServerHandle> {
        self.servers.get(name)
    }

    /// Server names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn handles(&self) -> impl Iterator<Item = &ServerHandle> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Status of every controller that is still running, sorted by name
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::with_capacity(self.servers.len());
        for name in self.names() {
            if let Some(status) = self.servers[&name].status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Stop every controller and wait for them to exit.
    pub async fn stop_all(&self) {
        for handle in self.handles() {
            handle.stop();
        }
        for handle in self.handles() {
            handle.await_stopped().await;
        }
    }
}
