//! burrowd - the container host daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use burrow::config::DaemonConfig;
use burrow::rootfs::{OverlayProvider, ProviderRegistry};
use burrow::shell::ScriptShell;
use burrow::{Backend, ContainerPool, Server};
use burrow_shared::Transport;

#[derive(Parser, Debug)]
#[command(name = "burrowd", version, about = "Linux container host daemon")]
struct Args {
    /// How to listen on the address (unix, tcp)
    #[arg(long, default_value = "unix")]
    listen_network: String,

    /// Address to listen on
    #[arg(long, default_value = "/tmp/burrow.sock")]
    listen_addr: String,

    /// Directory containing the host scripts (create.sh, destroy.sh, ...)
    #[arg(long)]
    bin: PathBuf,

    /// Directory in which to store container state
    #[arg(long)]
    depot: PathBuf,

    /// Directory in which to store rootfs overlays
    #[arg(long)]
    overlays: PathBuf,

    /// Default base rootfs for containers
    #[arg(long)]
    rootfs: PathBuf,

    /// Directory for container snapshots persisted through restarts; unset
    /// disables persistence
    #[arg(long)]
    snapshots: Option<PathBuf>,

    /// Time after which to destroy idle containers; 0 disables
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    container_grace_time: Duration,

    /// Network pool CIDR for containers; each container gets a /30
    #[arg(long, default_value = "10.254.0.0/22")]
    network_pool: String,

    /// Start of the ephemeral port range used for mapped container ports
    #[arg(long, default_value_t = 61001)]
    port_pool_start: u32,

    /// Size of the port pool used for mapped container ports
    #[arg(long, default_value_t = 5000)]
    port_pool_size: u32,

    /// Start of the per-container user id range
    #[arg(long, default_value_t = 10000)]
    uid_pool_start: u32,

    /// Size of the uid pool
    #[arg(long, default_value_t = 256)]
    uid_pool_size: u32,

    /// Comma-separated CIDR blocks to deny container egress to
    #[arg(long, value_delimiter = ',', default_value = "")]
    deny_networks: Vec<String>,

    /// Comma-separated CIDR blocks to allow container egress to
    #[arg(long, value_delimiter = ',', default_value = "")]
    allow_networks: Vec<String>,

    /// Disable disk quotas
    #[arg(long)]
    disable_quotas: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Server-wide identifier stamped into every host-script environment
    #[arg(long, default_value = "")]
    uniqueness_tag: String,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig, burrow_shared::BurrowError> {
        Ok(DaemonConfig {
            listen: Transport::from_flags(&self.listen_network, &self.listen_addr)?,
            bin_dir: self.bin,
            depot_dir: self.depot,
            overlays_dir: self.overlays,
            rootfs_path: self.rootfs,
            snapshots_dir: self.snapshots,
            cgroup_root: None,
            default_grace_time: self.container_grace_time,
            network_pool: self.network_pool,
            port_pool_start: self.port_pool_start,
            port_pool_size: self.port_pool_size,
            uid_pool_start: self.uid_pool_start,
            uid_pool_size: self.uid_pool_size,
            deny_networks: non_empty(self.deny_networks),
            allow_networks: non_empty(self.allow_networks),
            disable_quotas: self.disable_quotas,
            debug: self.debug,
            uniqueness_tag: self.uniqueness_tag,
        })
    }
}

fn non_empty(networks: Vec<String>) -> Vec<String> {
    networks.into_iter().filter(|n| !n.is_empty()).collect()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    burrow::logging::init(args.debug);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "daemon failed");
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> burrow_shared::BurrowResult<()> {
    let shell: Arc<ScriptShell> = Arc::new(ScriptShell::new(
        &config.bin_dir,
        config.uniqueness_tag.clone(),
        config.debug,
    ));

    let providers = ProviderRegistry::new().register(
        "",
        Arc::new(OverlayProvider::new(
            shell.clone(),
            &config.overlays_dir,
            &config.rootfs_path,
        )),
    );

    let pool = ContainerPool::new(&config, shell.clone(), providers)?;
    let backend = Backend::new(&config, pool, shell);
    backend.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut hangup = signal(SignalKind::hangup()).expect("SIGHUP handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let server = Server::new(backend.clone(), config.listen.clone());
    server.serve(shutdown_rx).await?;

    // Snapshot-and-exit: persistence (when configured) happens here.
    backend.stop().await?;
    tracing::info!("shutdown complete");
    Ok(())
}
