use routewatch::admin::{AdminServer, PKG_NAME, VERSION};
use routewatch::config::Config;
use routewatch::prober::HttpProber;
use routewatch::registry::Registry;
use routewatch::scheduler::HealthMonitor;
use routewatch::store::{JsonFileStore, RouteStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "routewatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routewatch=debug".parse()?),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(load_registry(&config)?);
    info!(routes = registry.len(), "Route registry ready");

    let tls = routewatch::tls::connector(
        config.health.tls_verify,
        config.health.tls_ca_file.as_deref(),
    )?;
    let prober = Arc::new(HttpProber::new(tls));
    let monitor = HealthMonitor::new(
        Arc::clone(&registry),
        prober,
        config.health.policy(),
        config.health.scheduler(),
    );

    let monitor_handle = if config.health.enabled {
        let monitor = Arc::clone(&monitor);
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(monitor.run(shutdown)))
    } else {
        info!("Background health monitoring disabled");
        None
    };

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let mut admin_server = AdminServer::new(admin_addr, Arc::clone(&monitor), shutdown_rx.clone());
    match config.server.admin_token.clone() {
        Some(token) => admin_server = admin_server.with_auth_token(token),
        None => warn!("No admin_token configured, route API is unauthenticated"),
    }

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = monitor_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build the registry from persisted routes, falling back to configured seeds
fn load_registry(config: &Config) -> anyhow::Result<Registry> {
    let mut registry = Registry::new(config.policy.clone());

    let Some(path) = config.server.routes_file.as_ref() else {
        seed_routes(&registry, config);
        return Ok(registry);
    };

    let store = Arc::new(JsonFileStore::new(path));
    let persisted = store.load()?;
    let had_file = path.exists();

    if had_file {
        let count = persisted.len();
        let restored = registry.restore(persisted);
        info!(path = %path.display(), restored, skipped = count - restored, "Routes loaded");
        registry = registry.with_store(store);
    } else {
        registry = registry.with_store(store);
        seed_routes(&registry, config);
    }

    Ok(registry)
}

fn seed_routes(registry: &Registry, config: &Config) {
    for spec in &config.routes {
        match registry.create(spec.clone()) {
            Ok(route) => info!(route_id = %route.id, path = %route.path, "Seed route created"),
            Err(e) => error!(path = %spec.path, error = %e, "Failed to create seed route"),
        }
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
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

        // Non-blocking exclusive lock; held for the lifetime of the handle
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
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
    info!(name = PKG_NAME, version = VERSION, "Starting route monitor");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        auth = config.server.admin_token.is_some(),
        routes_file = ?config.server.routes_file,
        "Server configuration"
    );
    info!(
        enabled = config.health.enabled,
        tick_interval_ms = config.health.tick_interval_ms,
        check_interval_secs = config.health.check_interval_secs,
        degraded_threshold_ms = config.health.degraded_threshold_ms,
        failure_threshold = config.health.failure_threshold,
        max_concurrent_probes = config.health.max_concurrent_probes,
        tls_verify = config.health.tls_verify,
        "Health check settings"
    );
    info!(
        private_targets_only = config.policy.private_targets_only,
        seed_routes = config.routes.len(),
        "Route settings"
    );
}
