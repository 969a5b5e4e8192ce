//! Kubelet device plugin for the FUSE character device.
//!
//! The plugin advertises `/dev/fuse` as the extended resource
//! `devices.kubevirt.io/fuse` and hands every container that requests it a
//! read-write bind of the host device node.
//!
//! The main components are:
//! - [`FuseLister`]: discovers whether the device node exists on the host
//! - [`DevicePool`]: owns the advertised device units and serves allocations
//! - [`DevicePluginService`]: the `v1beta1.DevicePlugin` gRPC adapter
//! - [`PluginServer`]: serves one pool on a unix socket and registers it with kubelet

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use core::error::Error;

pub mod lister;
pub mod pool;
pub mod server;
pub mod service;

pub use lister::FuseLister;
pub use lister::ResourceLister;
pub use pool::AllocationError;
pub use pool::AllocationGrant;
pub use pool::ContainerGrant;
pub use pool::ContainerRequest;
pub use pool::DevicePool;
pub use pool::DeviceUnit;
pub use pool::Health;
pub use server::PluginServer;
pub use service::DevicePluginService;

/// host path of the FUSE character device
pub const FUSE_PATH: &str = "/dev/fuse";
/// resource name advertised for the FUSE device
pub const FUSE_NAME: &str = "fuse";
/// namespace qualifying every resource name this plugin advertises
pub const NAMESPACE: &str = "devices.kubevirt.io";
/// device plugin API version spoken with kubelet
pub const API_VERSION: &str = "v1beta1";
/// directory kubelet watches for device plugin sockets
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
/// file name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`]
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// fully qualified resource name, e.g. `devices.kubevirt.io/fuse`
pub fn resource_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// socket file name kubelet dials for a resource, e.g. `devices.kubevirt.io_fuse.sock`
pub fn socket_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}.sock")
}

/// Errors raised while serving or registering a device plugin.
#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("Failed to prepare plugin socket {path}")]
    SocketSetup { path: String },
    #[display("Failed to connect to {path}")]
    Connection { path: String },
    #[display("Failed to register {resource_name} with kubelet: {message}")]
    Registration {
        resource_name: String,
        message: String,
    },
    #[display("Failed to watch device plugin directory {path}")]
    Watcher { path: String },
}

impl Error for PluginError {}
