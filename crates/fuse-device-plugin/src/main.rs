use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use utils::version;

use fuse_device_plugin::config::Cli;
use fuse_device_plugin::config::Commands;
use fuse_device_plugin::config::DaemonArgs;
use fuse_device_plugin::config::DiscoverArgs;
use fuse_device_plugin::device_plugin::FuseLister;
use fuse_device_plugin::device_plugin::ResourceLister;
use fuse_device_plugin::logging;
use fuse_device_plugin::manager::ManagerConfig;
use fuse_device_plugin::manager::PluginManager;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
        Commands::Discover(discover_args) => run_discover(discover_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_file.as_ref())?;

    tracing::info!("Starting fuse device plugin {}", &**version::VERSION);

    let lister = FuseLister::new(daemon_args.device_path.clone());
    let manager = PluginManager::new(lister, ManagerConfig::from(&daemon_args));

    let token = CancellationToken::new();
    let manager_task = tokio::spawn(manager.run(token.clone()));

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutdown signal received, stopping device plugins");
    token.cancel();
    manager_task.await?;

    Ok(())
}

fn run_discover(discover_args: DiscoverArgs) -> Result<()> {
    utils::logging::init();

    let lister = FuseLister::new(discover_args.device_path);
    for name in lister.discover() {
        println!("{}/{name}", lister.resource_namespace());
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}
