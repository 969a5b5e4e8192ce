//! Pool of logical device units advertised for one resource.
//!
//! The host device supports concurrent opens, so the pool never runs out:
//! every allocation appends fresh units instead of consuming existing ones,
//! which makes the advertised list an append-only ledger of allocations.
//! Unit state lives in a single [`watch`] channel. Writers are serialized by
//! the channel and watchers observe the latest full list without ever
//! blocking an allocation.

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;

use derive_more::Display;
use futures::Stream;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;
use tracing::info;

/// cgroup permissions granted on the device node
pub const DEVICE_PERMISSIONS: &str = "rw";

/// Health of a device unit as reported to kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Health {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// One logical, allocatable instance of the pool's resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUnit {
    /// `<resource><ordinal>`, e.g. `fuse0`
    pub id: String,
    pub health: Health,
}

/// Device node a container runtime should bind into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationGrant {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub permissions: String,
}

/// Devices requested for a single container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    pub device_ids: Vec<String>,
}

/// Result of allocating one [`ContainerRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerGrant {
    /// ids of the units appended to the pool for this container
    pub unit_ids: Vec<String>,
    pub devices: Vec<AllocationGrant>,
}

/// Errors returned by [`DevicePool::allocate`].
#[derive(Debug, Display)]
pub enum AllocationError {
    #[display("Device ordinals exhausted for resource {resource}")]
    OrdinalsExhausted { resource: String },
}

impl Error for AllocationError {}

#[derive(Debug, Clone, Default)]
struct PoolState {
    next_ordinal: u64,
    units: Vec<DeviceUnit>,
}

impl PoolState {
    /// appends `count` healthy units, all or nothing
    fn append(&mut self, resource: &str, count: usize) -> Result<Vec<String>, AllocationError> {
        let exhausted = || AllocationError::OrdinalsExhausted {
            resource: resource.to_string(),
        };
        let count = u64::try_from(count).map_err(|_| exhausted())?;
        let end = self.next_ordinal.checked_add(count).ok_or_else(exhausted)?;

        let ids: Vec<String> = (self.next_ordinal..end)
            .map(|ordinal| format!("{resource}{ordinal}"))
            .collect();
        self.units.extend(ids.iter().map(|id| DeviceUnit {
            id: id.clone(),
            health: Health::Healthy,
        }));
        self.next_ordinal = end;

        Ok(ids)
    }
}

/// Owns the advertised device units for one resource.
#[derive(Debug)]
pub struct DevicePool {
    /// resource name, also the prefix of every unit id
    resource: String,
    /// device node bound into allocated containers
    device_path: PathBuf,
    state: watch::Sender<PoolState>,
}

impl DevicePool {
    pub fn new(resource: impl Into<String>, device_path: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(PoolState::default());
        Self {
            resource: resource.into(),
            device_path: device_path.into(),
            state,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// snapshot of the units currently advertised
    pub fn units(&self) -> Vec<DeviceUnit> {
        self.state.borrow().units.clone()
    }

    /// Streams the full unit list, first immediately and then after every change.
    ///
    /// A pool that has never advertised anything is seeded with one unit so
    /// kubelet sees the resource as schedulable. Changes made in quick
    /// succession may be folded into a single emission, which always carries
    /// the latest list. The stream ends only when the pool is dropped.
    pub fn list_and_watch(&self) -> impl Stream<Item = Vec<DeviceUnit>> + Send + 'static {
        let resource = self.resource.clone();
        self.state.send_if_modified(|state| {
            if !state.units.is_empty() {
                return false;
            }
            // an empty pool starts at ordinal 0, which cannot overflow
            state.append(&resource, 1).is_ok()
        });

        let units = self.state.borrow().units.len();
        info!(resource = %self.resource, "Returning {units} available devices");

        WatchStream::new(self.state.subscribe()).map(|state| state.units)
    }

    /// Grows the pool for every requested unit and grants access to the device node.
    ///
    /// Returns one [`ContainerGrant`] per request, in request order. A
    /// container asking for N devices adds N units (at least one) and gets a
    /// single grant, since the same node is bound once per container.
    pub fn allocate(
        &self,
        requests: &[ContainerRequest],
    ) -> Result<Vec<ContainerGrant>, AllocationError> {
        let counts: Vec<usize> = requests
            .iter()
            .map(|request| request.device_ids.len().max(1))
            .collect();
        let total = counts.iter().sum();

        let mut appended = Ok(Vec::new());
        self.state.send_if_modified(|state| {
            appended = state.append(&self.resource, total);
            matches!(&appended, Ok(ids) if !ids.is_empty())
        });
        let mut ids = appended?.into_iter();

        let grants = counts
            .into_iter()
            .map(|count| {
                let unit_ids: Vec<String> = ids.by_ref().take(count).collect();
                debug!(resource = %self.resource, "Allocated virtual devices {unit_ids:?}");
                ContainerGrant {
                    unit_ids,
                    devices: vec![self.grant()],
                }
            })
            .collect();

        Ok(grants)
    }

    fn grant(&self) -> AllocationGrant {
        AllocationGrant {
            host_path: self.device_path.clone(),
            container_path: self.device_path.clone(),
            permissions: DEVICE_PERMISSIONS.to_string(),
        }
    }
}
