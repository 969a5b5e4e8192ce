use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::ContainerPreferredAllocationResponse;
use super::api::DevicePluginOptions;
use super::api::DeviceSpec;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::pool::AllocationError;
use super::pool::AllocationGrant;
use super::pool::ContainerGrant;
use super::pool::ContainerRequest;
use super::pool::DevicePool;
use super::pool::DeviceUnit;

/// DevicePlugin service implementation
/// exposes a [`DevicePool`] over the kubelet device plugin API
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    pool: Arc<DevicePool>,
    /// ends open watch streams when the server shuts down
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(pool: Arc<DevicePool>, cancellation_token: CancellationToken) -> Self {
        Self {
            pool,
            cancellation_token,
        }
    }
}

impl From<&DeviceUnit> for api::Device {
    fn from(unit: &DeviceUnit) -> Self {
        Self {
            id: unit.id.clone(),
            health: unit.health.to_string(),
            topology: None,
        }
    }
}

impl From<&AllocationGrant> for DeviceSpec {
    fn from(grant: &AllocationGrant) -> Self {
        Self {
            container_path: grant.container_path.to_string_lossy().into_owned(),
            host_path: grant.host_path.to_string_lossy().into_owned(),
            permissions: grant.permissions.clone(),
        }
    }
}

impl From<ContainerGrant> for ContainerAllocateResponse {
    fn from(grant: ContainerGrant) -> Self {
        Self {
            envs: HashMap::new(),
            mounts: Vec::new(),
            devices: grant.devices.iter().map(DeviceSpec::from).collect(),
            annotations: HashMap::new(),
            cdi_devices: Vec::new(),
        }
    }
}

impl From<AllocationError> for Status {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::OrdinalsExhausted { .. } => {
                Status::resource_exhausted(err.to_string())
            }
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// list and watch device state changes
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list of {}", self.pool.resource());

        let stream = self
            .pool
            .list_and_watch()
            .map(|units| {
                debug!("sending {} devices", units.len());
                Ok(ListAndWatchResponse {
                    devices: units.iter().map(api::Device::from).collect(),
                })
            })
            .take_until(self.cancellation_token.clone().cancelled_owned());

        Ok(Response::new(Box::pin(stream)))
    }

    /// get preferred device allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        // every unit is interchangeable, so there is nothing to prefer
        let container_responses = req
            .container_requests
            .iter()
            .map(|_| ContainerPreferredAllocationResponse::default())
            .collect();
        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    /// allocate devices to container
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to container: {:?}", req);

        let requests: Vec<ContainerRequest> = req
            .container_requests
            .into_iter()
            .map(|container_req| ContainerRequest {
                device_ids: container_req.devices_ids,
            })
            .collect();

        let grants = self.pool.allocate(&requests).map_err(|e| {
            error!("failed to allocate {}: {e}", self.pool.resource());
            Status::from(e)
        })?;

        let response = AllocateResponse {
            container_responses: grants
                .into_iter()
                .map(ContainerAllocateResponse::from)
                .collect(),
        };

        info!(
            "device allocation completed, {} now advertises {} devices",
            self.pool.resource(),
            self.pool.units().len()
        );
        Ok(Response::new(response))
    }

    /// pre-start container
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        debug!("pre-start container processing: {:?}", req);

        Ok(Response::new(PreStartContainerResponse {}))
    }
}
