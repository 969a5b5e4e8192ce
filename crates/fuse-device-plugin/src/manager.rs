//! Device plugin lifecycle management.
//!
//! [`PluginManager`] periodically asks a [`ResourceLister`] which resources
//! exist on the host and keeps exactly one registered [`PluginServer`] per
//! discovered resource. Kubelet wipes the device plugin directory when it
//! restarts, so the manager also watches for `kubelet.sock` being recreated
//! and re-registers every plugin when that happens.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device_plugin::resource_name;
use crate::device_plugin::server::register_with_kubelet;
use crate::device_plugin::socket_name;
use crate::device_plugin::DevicePool;
use crate::device_plugin::PluginError;
use crate::device_plugin::PluginServer;
use crate::device_plugin::ResourceLister;

/// Where plugins live and how often resources are rediscovered.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// directory the plugin sockets are created in
    pub device_plugin_dir: PathBuf,
    /// kubelet registration socket
    pub kubelet_socket: PathBuf,
    pub rescan_interval: Duration,
}

/// Keeps one registered device plugin per discovered resource.
#[derive(Debug)]
pub struct PluginManager<L> {
    lister: L,
    config: ManagerConfig,
    /// pools outlive their servers so unit ids are never reused
    pools: HashMap<String, Arc<DevicePool>>,
    running: HashMap<String, PluginServer>,
}

impl<L: ResourceLister> PluginManager<L> {
    pub fn new(lister: L, config: ManagerConfig) -> Self {
        Self {
            lister,
            config,
            pools: HashMap::new(),
            running: HashMap::new(),
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        info!(
            "Starting device plugin manager in {}",
            self.config.device_plugin_dir.display()
        );

        let (fs_tx, mut fs_rx) = mpsc::channel(16);
        // keep the watcher alive for the whole loop
        let _watcher = match self.watch_kubelet_socket(fs_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Failed to watch for kubelet restarts, relying on rescans only: {e:?}");
                None
            }
        };

        let mut rescan = interval(self.config.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Device plugin manager shutdown requested");
                    break;
                }
                _ = rescan.tick() => {
                    self.reconcile(&cancellation_token).await;
                }
                Some(event) = fs_rx.recv() => {
                    if self.is_kubelet_restart(&event) {
                        info!("kubelet socket recreated, re-registering all device plugins");
                        self.stop_all().await;
                        self.reconcile(&cancellation_token).await;
                    }
                }
            }
        }

        self.stop_all().await;
        info!("Device plugin manager stopped");
    }

    /// brings the running plugins in line with what is discovered on the host
    async fn reconcile(&mut self, cancellation_token: &CancellationToken) {
        let discovered = self.lister.discover();
        debug!("Discovered resources: {discovered:?}");

        let vanished: Vec<String> = self
            .running
            .keys()
            .filter(|name| !discovered.contains(*name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(server) = self.running.remove(&name) {
                info!("Resource {name} disappeared, stopping its device plugin");
                server.stop().await;
            }
        }

        for name in discovered {
            if let Some(server) = self.running.get(&name) {
                if Self::is_serving(server).await {
                    continue;
                }
            }
            if let Some(server) = self.running.remove(&name) {
                warn!("Device plugin {name} lost its socket, restarting");
                server.stop().await;
            }

            if let Err(e) = self.start_plugin(&name, cancellation_token).await {
                error!("Failed to start device plugin {name}: {e:?}");
            }
        }
    }

    async fn start_plugin(
        &mut self,
        name: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<PluginError>> {
        let namespace = self.lister.resource_namespace().to_string();
        let pool = self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.lister.new_plugin(name)))
            .clone();

        let socket_path = self
            .config
            .device_plugin_dir
            .join(socket_name(&namespace, name));
        let server =
            PluginServer::start(socket_path, pool, cancellation_token.child_token()).await?;

        let resource = resource_name(&namespace, name);
        if let Err(e) =
            register_with_kubelet(&self.config.kubelet_socket, &server.endpoint(), &resource).await
        {
            server.stop().await;
            return Err(e);
        }

        self.running.insert(name.to_string(), server);
        Ok(())
    }

    async fn stop_all(&mut self) {
        for (name, server) in self.running.drain() {
            debug!("Stopping device plugin {name}");
            server.stop().await;
        }
    }

    async fn is_serving(server: &PluginServer) -> bool {
        !server.is_finished()
            && tokio::fs::try_exists(server.socket_path())
                .await
                .unwrap_or(false)
    }

    fn is_kubelet_restart(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_))
            && event.paths.iter().any(|p| p == &self.config.kubelet_socket)
    }

    /// set up filesystem watcher for the directory holding the kubelet socket
    fn watch_kubelet_socket(
        &self,
        fs_tx: mpsc::Sender<Event>,
    ) -> Result<RecommendedWatcher, Report<PluginError>> {
        let dir = self
            .config
            .kubelet_socket
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf();
        let watch_error = || PluginError::Watcher {
            path: dir.display().to_string(),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    debug!("Filesystem event: {:?}", event);
                    // a full channel already holds an event to act on
                    let _ = fs_tx.try_send(event);
                }
                Err(e) => {
                    error!("Filesystem watch error: {:?}", e);
                }
            },
            Config::default(),
        )
        .change_context_lazy(watch_error)?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .change_context_lazy(watch_error)?;

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use notify::event::CreateKind;
    use notify::event::RemoveKind;

    use super::*;
    use crate::device_plugin::FuseLister;

    fn manager(dir: &Path) -> PluginManager<FuseLister> {
        PluginManager::new(
            FuseLister::new(dir.join("fuse")),
            ManagerConfig {
                device_plugin_dir: dir.to_path_buf(),
                kubelet_socket: dir.join("kubelet.sock"),
                rescan_interval: Duration::from_millis(50),
            },
        )
    }

    fn event(kind: EventKind, path: PathBuf) -> Event {
        Event::new(kind).add_path(path)
    }

    #[test]
    fn detects_kubelet_socket_creation() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = manager(dir.path());
        let kubelet = dir.path().join("kubelet.sock");

        let created = EventKind::Create(CreateKind::File);
        let removed = EventKind::Remove(RemoveKind::File);

        assert!(manager.is_kubelet_restart(&event(created, kubelet.clone())));
        assert!(!manager.is_kubelet_restart(&event(removed, kubelet)));
        assert!(!manager.is_kubelet_restart(&event(created, dir.path().join("other.sock"))));
    }

    #[test_log::test(tokio::test)]
    async fn failed_registration_leaves_no_plugin_behind() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("fuse"), b"").expect("fake device");
        let mut manager = manager(dir.path());

        // no kubelet is listening, so registration fails
        manager.reconcile(&CancellationToken::new()).await;

        assert!(manager.running.is_empty());
        assert!(!dir.path().join("devices.kubevirt.io_fuse.sock").exists());
        // the pool is kept for the next attempt
        assert_eq!(
            manager.pools.keys().cloned().collect::<BTreeSet<_>>(),
            BTreeSet::from(["fuse".to_string()])
        );
    }

    #[test_log::test(tokio::test)]
    async fn nothing_starts_without_device() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut manager = manager(dir.path());

        manager.reconcile(&CancellationToken::new()).await;

        assert!(manager.running.is_empty());
        assert!(manager.pools.is_empty());
    }
}
