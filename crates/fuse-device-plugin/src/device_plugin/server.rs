use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::error;
use tracing::info;

use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::pool::DevicePool;
use super::service::DevicePluginService;
use super::PluginError;
use super::API_VERSION;

/// gRPC server exposing one device pool on a unix socket
#[derive(Debug)]
pub struct PluginServer {
    /// socket kubelet dials, inside the device plugin directory
    socket_path: PathBuf,
    /// stops the server and every open watch stream
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PluginServer {
    /// start device plugin server
    pub async fn start(
        socket_path: impl Into<PathBuf>,
        pool: Arc<DevicePool>,
        cancellation_token: CancellationToken,
    ) -> Result<Self, Report<PluginError>> {
        let socket_path = socket_path.into();
        let setup_error = || PluginError::SocketSetup {
            path: socket_path.display().to_string(),
        };
        info!("start device plugin server: {}", socket_path.display());

        // clean up old socket file if it exists
        if tokio::fs::try_exists(&socket_path)
            .await
            .change_context_lazy(setup_error)?
        {
            tokio::fs::remove_file(&socket_path)
                .await
                .change_context_lazy(setup_error)
                .attach_printable("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(&socket_path).change_context_lazy(setup_error)?;

        let service = DevicePluginService::new(pool, cancellation_token.clone());
        let server = DevicePluginServer::new(service);

        info!("gRPC server is bound to: {}", socket_path.display());

        let token = cancellation_token.clone();
        let served_path = socket_path.clone();
        let handle = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                        info!("shutting down gRPC server on {}", served_path.display());
                    },
                )
                .await;
            if let Err(e) = result {
                error!("device plugin server failed: {e}");
            }
        });

        Ok(Self {
            socket_path,
            cancellation_token,
            handle,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// file name kubelet resolves against its device plugin directory
    pub fn endpoint(&self) -> String {
        self.socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// whether the serving task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// stop serving and remove the socket file
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            error!("device plugin server task failed: {e}");
        }
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(
                "failed to remove socket {}: {e}",
                self.socket_path.display()
            ),
        }
    }
}

/// register device plugin with kubelet
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
) -> Result<(), Report<PluginError>> {
    info!(
        "registering {resource_name} with kubelet: {}",
        kubelet_socket.display()
    );

    let channel = connect_uds(kubelet_socket).await?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions::default()),
    };

    match client.register(Request::new(request)).await {
        Ok(_) => {
            info!("successfully registered {resource_name} with kubelet");
            Ok(())
        }
        Err(e) => Err(Report::new(PluginError::Registration {
            resource_name: resource_name.to_string(),
            message: e.message().to_string(),
        })),
    }
}

/// create Unix Domain Socket client connection
pub async fn connect_uds(socket_path: &Path) -> Result<Channel, Report<PluginError>> {
    let path = socket_path.to_path_buf();

    // the URI is a placeholder, the connector always dials the socket
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                match UnixStream::connect(path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
        .change_context_lazy(|| PluginError::Connection {
            path: socket_path.display().to_string(),
        })?;

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::device_plugin::api::device_plugin_client::DevicePluginClient;
    use crate::device_plugin::api::Empty;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test_log::test(tokio::test)]
    async fn serves_pool_over_unix_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("devices.kubevirt.io_fuse.sock");
        // a stale socket left behind by a previous run
        std::fs::write(&socket, b"").expect("stale socket");

        let pool = Arc::new(DevicePool::new("fuse", "/dev/fuse"));
        let server = PluginServer::start(&socket, pool, CancellationToken::new())
            .await
            .expect("start server");
        assert_eq!(server.endpoint(), "devices.kubevirt.io_fuse.sock");

        let channel = connect_uds(&socket).await.expect("connect");
        let mut client = DevicePluginClient::new(channel);
        let mut stream = client
            .list_and_watch(Empty {})
            .await
            .expect("list and watch")
            .into_inner();
        let first = timeout(TEST_TIMEOUT, stream.next())
            .await
            .expect("initial list")
            .expect("stream open")
            .expect("status");
        assert_eq!(first.devices.len(), 1);
        assert_eq!(first.devices[0].id, "fuse0");

        server.stop().await;
        assert!(!socket.exists());
    }

    #[test_log::test(tokio::test)]
    async fn registration_fails_without_kubelet() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = register_with_kubelet(
            &dir.path().join("kubelet.sock"),
            "devices.kubevirt.io_fuse.sock",
            "devices.kubevirt.io/fuse",
        )
        .await;

        assert!(result.is_err());
    }
}
