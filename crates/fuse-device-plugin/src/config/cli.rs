use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::{DaemonArgs, DiscoverArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(DaemonArgs),
    /// Print the resources discovered on this host and exit
    Discover(DiscoverArgs),
}
