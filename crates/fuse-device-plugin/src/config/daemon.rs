use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::device_plugin::DEVICE_PLUGIN_PATH;
use crate::device_plugin::FUSE_PATH;
use crate::device_plugin::KUBELET_SOCKET;
use crate::manager::ManagerConfig;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEVICE_PLUGIN_PATH,
        help = "Directory kubelet watches for device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket, defaults to kubelet.sock inside the device plugin directory"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        env = "FUSE_DEVICE_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = FUSE_PATH,
        help = "FUSE device node to probe and hand out to containers"
    )]
    pub device_path: PathBuf,

    #[arg(
        long,
        env = "RESCAN_INTERVAL_SECS",
        default_value = "30",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between resource discovery runs"
    )]
    pub rescan_interval_secs: u64,

    #[arg(
        long,
        env = "LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily, e.g. /var/log/fuse-device-plugin.log"
    )]
    pub log_file: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.device_plugin_dir.join(KUBELET_SOCKET))
    }
}

impl From<&DaemonArgs> for ManagerConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            device_plugin_dir: args.device_plugin_dir.clone(),
            kubelet_socket: args.kubelet_socket(),
            rescan_interval: Duration::from_secs(args.rescan_interval_secs),
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct DiscoverArgs {
    #[arg(
        long,
        env = "FUSE_DEVICE_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = FUSE_PATH,
        help = "FUSE device node to probe"
    )]
    pub device_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        daemon: DaemonArgs,
    }

    #[test]
    fn defaults_point_at_kubelet_layout() {
        let cli = TestCli::try_parse_from(["test"]).expect("parse");
        let config = ManagerConfig::from(&cli.daemon);

        assert_eq!(
            config.device_plugin_dir,
            PathBuf::from("/var/lib/kubelet/device-plugins")
        );
        assert_eq!(
            config.kubelet_socket,
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
        assert_eq!(config.rescan_interval, Duration::from_secs(30));
        assert_eq!(cli.daemon.device_path, PathBuf::from("/dev/fuse"));
        assert!(cli.daemon.log_file.is_none());
    }

    #[test]
    fn overrides_are_honoured() {
        let cli = TestCli::try_parse_from([
            "test",
            "--device-plugin-dir",
            "/tmp/plugins",
            "--kubelet-socket",
            "/run/kubelet.sock",
            "--rescan-interval-secs",
            "5",
        ])
        .expect("parse");
        let config = ManagerConfig::from(&cli.daemon);

        assert_eq!(config.device_plugin_dir, PathBuf::from("/tmp/plugins"));
        assert_eq!(config.kubelet_socket, PathBuf::from("/run/kubelet.sock"));
        assert_eq!(config.rescan_interval, Duration::from_secs(5));
    }

    #[test]
    fn zero_rescan_interval_is_rejected() {
        assert!(TestCli::try_parse_from(["test", "--rescan-interval-secs", "0"]).is_err());
    }
}
