use clap::{Parser, ValueEnum};
use dospin::admin::{AdminServer, PKG_NAME, VERSION};
use dospin::api::{ComputeApi, DigitalOceanClient};
use dospin::compute::{DropletHandler, LifecycleBackend, PollIntervals};
use dospin::config::Config;
use dospin::controller::{ControllerSettings, ServerManager, ServerRegistry};
use dospin::forward::Forwarder;
use dospin::listener;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long controllers get to finish their current event on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Start all listeners and run until signalled
    Serve,
    /// Spin down every configured server once and exit
    Spindownall,
}

/// Spin droplets up when clients connect and down when they go idle
#[derive(Debug, Parser)]
#[command(name = "dospin", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/dospin.toml")]
    config: PathBuf,

    /// What to do
    #[arg(long, value_enum, default_value_t = Mode::Serve)]
    cmd: Mode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dospin=debug".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %cli.config.display(), servers = config.servers.len(), "Configuration loaded");

    let client = match config.server.api_url.as_deref() {
        Some(url) => DigitalOceanClient::with_base_url(config.api_token()?, url),
        None => DigitalOceanClient::new(config.api_token()?),
    };
    debug!(api_url = client.base_url(), "Using compute API");
    let api: Arc<dyn ComputeApi> = Arc::new(client);
    let backend = Arc::new(DropletHandler::new(
        api,
        config.servers.clone(),
        PollIntervals::from_defaults(&config.defaults),
    ));

    match cli.cmd {
        Mode::Serve => serve(config, backend).await,
        Mode::Spindownall => spindown_all(&config, backend.as_ref()).await,
    }
}

/// Spin down every configured server, one at a time.
async fn spindown_all(config: &Config, backend: &dyn LifecycleBackend) -> anyhow::Result<()> {
    let mut names: Vec<&String> = config.servers.keys().collect();
    names.sort();

    let mut failed = Vec::new();
    for name in names {
        info!(server = %name, "Spinning down");
        match backend.spindown(name).await {
            Ok(()) => info!(server = %name, "Spin-down complete"),
            Err(e) => {
                error!(server = %name, error = %e, "Spin-down failed");
                failed.push(name.clone());
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Failed to spin down: {}", failed.join(", "));
    }
    Ok(())
}

async fn serve(config: Config, backend: Arc<DropletHandler>) -> anyhow::Result<()> {
    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let bind: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let forwarder = Forwarder::from_config(&config.server)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut registry = ServerRegistry::new();
    let mut listeners: Vec<JoinHandle<()>> = Vec::new();
    let mut names: Vec<&String> = config.servers.keys().collect();
    names.sort();

    for name in names {
        let definition = &config.servers[name];
        let settings = ControllerSettings {
            idle_timeout: definition.idle_timeout(&config.defaults),
            check_interval: config.defaults.idle_check_interval(),
            pulse_interval: config.defaults.liveness_interval(),
        };
        let backend: Arc<dyn LifecycleBackend> = backend.clone();
        let handle = ServerManager::spawn(
            name.clone(),
            definition.ports.clone(),
            backend,
            forwarder.clone(),
            settings,
        );

        for &port in &definition.ports {
            listeners.push(tokio::spawn(listener::listen(
                bind,
                port,
                handle.clone(),
                shutdown_rx.clone(),
            )));
        }
        registry.insert(handle);
    }
    let registry = Arc::new(registry);

    let admin_task = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });
        let admin_server = AdminServer::new(admin_addr, Arc::clone(&registry), shutdown_rx.clone(), admin_token);
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);

    // Droplets stay up; the next start's idle timer tears them down
    info!("Stopping controllers...");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, registry.stop_all()).await.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "Controllers did not stop in time");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in listeners {
            let _ = handle.await;
        }
        if let Some(handle) = admin_task {
            let _ = handle.await;
        }
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another dospin is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Lock is held for as long as the handle lives
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dospin");
    info!(
        bind = %config.server.bind,
        forwarding = ?config.server.forwarding,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        "Server configuration"
    );

    let mut names: Vec<&String> = config.servers.keys().collect();
    names.sort();
    for name in names {
        let server = &config.servers[name];
        info!(
            server = %name,
            ports = ?server.ports,
            region = %server.region,
            size = %server.size,
            idle_timeout = ?server.idle_timeout(&config.defaults),
            persistent = server.use_persistent_image,
            "Configured server"
        );
    }
}
