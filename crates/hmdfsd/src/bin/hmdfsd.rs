//! hmdfsd - distributed filesystem daemon
//!
//! Usage:
//!   hmdfsd run [--config <path>] [--user-id <id>]   Run the daemon
//!   hmdfsd sample-config                            Print a config template

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use hmdfsd_core::{Config, DeviceInfo, MountArgumentDescriptors};

use hmdfsd::device_manager::DeviceManagerAgent;
use hmdfsd::devsl::DevslDispatcher;
use hmdfsd::mount_manager::{GroupNotifier, MountManager};
use hmdfsd::mount_point::{HmdfsMounter, MountPoint};
use hmdfsd::network_agent::{NetworkAgent, NetworkAgentOps};
use hmdfsd::platform::{LoggingStorageManager, StaticPlatform, XattrSecurityLabelStore};
use hmdfsd::tcp_link::TcpLinkProvider;

#[derive(Parser)]
#[command(name = "hmdfsd")]
#[command(about = "Distributed filesystem daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Configuration file (default: the platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Mount for this user id instead of the configured one
        #[arg(short, long)]
        user_id: Option<i32>,
    },

    /// Print a sample configuration file
    SampleConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { config, user_id } => run(config, user_id).await,
        Commands::SampleConfig => {
            println!("{}", Config::sample());
            Ok(())
        }
    }
}

fn local_cid(config: &Config) -> String {
    if !config.user.local_cid.is_empty() {
        return config.user.local_cid.clone();
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "hmdfsd-local".into())
}

async fn run(config_path: Option<PathBuf>, user_id: Option<i32>) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load_from(&path).context("loading configuration")?,
        None => Config::load(),
    };
    if let Some(id) = user_id {
        config.user.id = id;
    }

    let cid = local_cid(&config);
    info!("starting hmdfsd as {cid}, user {}", config.user.id);

    let platform = Arc::new(StaticPlatform::new(cid.clone(), 1, config.peers.clone()));
    let local_device = Arc::new(RwLock::new(DeviceInfo::new()));

    let factory = {
        let platform = Arc::clone(&platform);
        let local_device = Arc::clone(&local_device);
        let config = config.clone();
        let cid = cid.clone();
        Box::new(move |mp: Arc<MountPoint>| {
            let provider = TcpLinkProvider::new(
                cid.clone(),
                config.network.listen_port,
                Duration::from_secs(config.network.connect_timeout_secs),
                Arc::clone(&platform) as Arc<dyn hmdfsd::tcp_link::PeerResolver>,
            );
            NetworkAgent::new(
                provider,
                mp,
                Arc::clone(&platform) as _,
                Arc::clone(&local_device),
                &config,
            ) as Arc<dyn NetworkAgentOps>
        })
    };

    let device_manager = DeviceManagerAgent::new(
        Arc::clone(&platform) as _,
        Arc::clone(&platform) as _,
        Arc::new(LoggingStorageManager),
        factory,
        local_device,
        (&config).into(),
    );
    device_manager.start().context("starting device manager")?;

    let devsl = DevslDispatcher::new(
        Arc::clone(&platform) as _,
        Arc::clone(&platform) as _,
        Arc::new(XattrSecurityLabelStore),
    );
    devsl.start().context("starting devsl dispatcher")?;

    let mount_manager = MountManager::new(
        Box::new(HmdfsMounter),
        Arc::clone(&device_manager) as Arc<dyn GroupNotifier>,
    );
    mount_manager
        .mount(MountPoint::new(MountArgumentDescriptors::alpha(
            config.user.id,
            &config.user.account,
        )))
        .context("mounting the default hmdfs instance")?;

    // With a static peer table there is no live device manager to push
    // ready events; announce the configured peers ourselves once the join
    // command has been processed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    platform.announce_peers();

    info!("hmdfsd up; ctrl-c to stop");
    signal::ctrl_c().await.ok();
    info!("shutting down");

    mount_manager.teardown();
    device_manager.stop().await;
    devsl.stop();
    Ok(())
}
