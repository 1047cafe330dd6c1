//! Forwarding strategies
//!
//! Accepted connections reach the droplet either through the in-process
//! [`relay`](crate::proxy::relay) or through kernel NAT rules installed by a
//! [`NatBackend`], after which this process is out of the data path.

use crate::config::{ForwardingMode, NatBackendKind, ServerConfig};
use crate::locator::NAMESPACE;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Kernel-level port forwarding
#[async_trait]
pub trait NatBackend: Send + Sync {
    /// Redirect `local:port` to `remote:port` under `rule_name`.
    async fn add_forwarding_rule(
        &self,
        rule_name: &str,
        local: IpAddr,
        remote: IpAddr,
        port: u16,
    ) -> anyhow::Result<()>;

    /// Remove the rule installed under `rule_name`, if any.
    async fn remove_forwarding_rule(&self, rule_name: &str) -> anyhow::Result<()>;
}

/// How a controller hands accepted connections to the droplet
#[derive(Clone)]
pub enum Forwarder {
    Proxy,
    Nat(Arc<dyn NatBackend>),
}

impl Forwarder {
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        match config.forwarding {
            ForwardingMode::Proxy => Ok(Forwarder::Proxy),
            ForwardingMode::Nat => {
                let interface = config
                    .nat_interface
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("NAT forwarding requires 'nat_interface'"))?;
                Ok(Forwarder::Nat(Arc::new(PacketFilter::new(
                    config.nat_backend,
                    interface,
                ))))
            }
        }
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Forwarder::Proxy => f.write_str("Proxy"),
            Forwarder::Nat(_) => f.write_str("Nat"),
        }
    }
}

/// Name of the NAT rule forwarding `port` for logical server `server`
pub fn rule_name(server: &str, port: u16) -> String {
    format!("{NAMESPACE}{server}-{port}")
}

/// pf anchor holding a single rule
fn pf_anchor(rule_name: &str) -> String {
    format!("dospin/{rule_name}")
}

/// pf redirect rule, loaded into the rule's own anchor
pub fn pf_rule(interface: &str, local: IpAddr, remote: IpAddr, port: u16) -> String {
    format!(
        "rdr pass on {interface} proto tcp from any to {local} port {port} -> {remote} port {port}\n"
    )
}

/// iptables invocations for one rule: DNAT on the way in, masquerade on the way out.
/// Each entry is the rule spec without its `-A`/`-D` chain operation.
pub fn iptables_rules(
    rule_name: &str,
    interface: &str,
    local: IpAddr,
    remote: IpAddr,
    port: u16,
) -> Vec<Vec<String>> {
    let local = local.to_string();
    let remote = remote.to_string();
    let port = port.to_string();
    let destination = format!("{remote}:{port}");
    let comment = ["-m", "comment", "--comment", rule_name];

    let mut dnat: Vec<String> = ["PREROUTING", "-i", interface, "-p", "tcp", "-d", local.as_str(), "--dport", port.as_str()]
        .map(String::from)
        .to_vec();
    dnat.extend(comment.map(String::from));
    dnat.extend(["-j", "DNAT", "--to-destination", destination.as_str()].map(String::from));

    let mut masquerade: Vec<String> = ["POSTROUTING", "-p", "tcp", "-d", remote.as_str(), "--dport", port.as_str()]
        .map(String::from)
        .to_vec();
    masquerade.extend(comment.map(String::from));
    masquerade.extend(["-j", "MASQUERADE"].map(String::from));

    vec![dnat, masquerade]
}

/// NAT backend driving `pfctl` or `iptables`.
pub struct PacketFilter {
    flavor: NatBackendKind,
    interface: String,
    /// iptables rule specs by rule name, needed to delete them again
    installed: Mutex<HashMap<String, Vec<Vec<String>>>>,
}

impl PacketFilter {
    pub fn new(flavor: NatBackendKind, interface: impl Into<String>) -> Self {
        Self {
            flavor,
            interface: interface.into(),
            installed: Mutex::new(HashMap::new()),
        }
    }

    async fn run(program: &str, args: &[String], stdin: Option<&str>) -> anyhow::Result<()> {
        debug!(program, ?args, "Running packet filter command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", program, e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // Close stdin so the command sees EOF
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed ({}): {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn with_operation(op: &str, spec: &[String]) -> Vec<String> {
        let mut args = vec!["-t".to_string(), "nat".to_string(), op.to_string()];
        args.extend(spec.iter().cloned());
        args
    }
}

#[async_trait]
impl NatBackend for PacketFilter {
    async fn add_forwarding_rule(
        &self,
        rule_name: &str,
        local: IpAddr,
        remote: IpAddr,
        port: u16,
    ) -> anyhow::Result<()> {
        match self.flavor {
            NatBackendKind::Pf => {
                // Loading an anchor replaces whatever it held
                let rule = pf_rule(&self.interface, local, remote, port);
                let args = ["-a".to_string(), pf_anchor(rule_name), "-f".to_string(), "-".to_string()];
                Self::run("pfctl", &args, Some(&rule)).await?;
            }
            NatBackendKind::Iptables => {
                self.remove_forwarding_rule(rule_name).await?;
                let specs = iptables_rules(rule_name, &self.interface, local, remote, port);
                for spec in &specs {
                    Self::run("iptables", &Self::with_operation("-A", spec), None).await?;
                }
                self.installed.lock().insert(rule_name.to_string(), specs);
            }
        }

        info!(rule = rule_name, %local, %remote, port, "Installed forwarding rule");
        Ok(())
    }

    async fn remove_forwarding_rule(&self, rule_name: &str) -> anyhow::Result<()> {
        match self.flavor {
            NatBackendKind::Pf => {
                let args = ["-a".to_string(), pf_anchor(rule_name), "-F".to_string(), "all".to_string()];
                Self::run("pfctl", &args, None).await?;
            }
            NatBackendKind::Iptables => {
                let specs = self.installed.lock().remove(rule_name);
                let Some(specs) = specs else {
                    return Ok(());
                };
                for spec in &specs {
                    Self::run("iptables", &Self::with_operation("-D", spec), None).await?;
                }
                info!(rule = rule_name, "Removed forwarding rule");
            }
        }
        Ok(())
    }
}
