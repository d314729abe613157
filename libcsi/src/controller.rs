//! CSI Controller service.
//!
//! Manages the remote volume lifecycle against the cloud API: create, clone,
//! delete, attach, detach, and expand. The service keeps no state of its own;
//! every call re-reads the volume from the API and converges from there, which
//! is what makes orchestrator retries safe.
//!
//! ```text
//! NonExistent -> Creating -> Active <-> Attached -> NonExistent
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

use crate::cloud::{
    CloudClient, CloudError, CreateVolumeOptions, ListOptions, RemoteVolume, VolumeStatus,
    find_volume_by_label,
};
use crate::config::DriverConfig;
use crate::csi::controller_server::Controller;
use crate::csi::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest, ListVolumesResponse,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    controller_service_capability, list_volumes_response, validate_volume_capabilities_response,
    volume_content_source,
};
use crate::error::CsiError;
use crate::key::{VolumeKey, node_id_as_int, normalized_label, volume_id_as_int};
use crate::metrics::{MetricsSink, observe_rpc};
use crate::poll::{Poller, wait_for_volume_instance, wait_for_volume_status};
use crate::types::{
    CONTEXT_DEVICE_PATH, CONTEXT_PARTITION, PARAM_LUKS_CIPHER, PARAM_LUKS_ENCRYPTED,
    PARAM_LUKS_KEY_SIZE, PARAM_VOLUME_TAGS, gib_to_bytes, is_block, is_single_node_writer,
    region_topology, requested_region, require_single_node_writer, resolve_capacity_gib,
};

/// Controller service backed by a [`CloudClient`].
pub struct ControllerService {
    cloud: Arc<dyn CloudClient>,
    region: String,
    label_prefix: Option<String>,
    poller: Poller,
    metrics: Arc<dyn MetricsSink>,
}

impl ControllerService {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        config: &DriverConfig,
        poller: Poller,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            cloud,
            region: config.region.clone(),
            label_prefix: config.label_prefix().map(str::to_owned),
            poller,
            metrics,
        }
    }

    async fn wait_active(&self, volume_id: u64) -> Result<RemoteVolume, CsiError> {
        wait_for_volume_status(&self.poller, &*self.cloud, volume_id, VolumeStatus::Active).await
    }

    // -----------------------------------------------------------------------
    // CreateVolume
    // -----------------------------------------------------------------------

    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume_inner(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::invalid("volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities are required"));
        }
        for cap in &req.volume_capabilities {
            require_single_node_writer(Some(cap))?;
        }

        let size_gib = resolve_capacity_gib(req.capacity_range.as_ref())?;
        let label = normalized_label(&req.name, self.label_prefix.as_deref());
        let region = requested_region(req.accessibility_requirements.as_ref())
            .unwrap_or_else(|| self.region.clone());
        if region.is_empty() {
            return Err(CsiError::invalid(
                "no region in the topology requirement and none configured",
            ));
        }

        let volume = match find_volume_by_label(&*self.cloud, &label).await? {
            Some(existing) => self.reuse_existing(existing, &region, size_gib).await?,
            None => match req
                .volume_content_source
                .as_ref()
                .and_then(|s| s.r#type.as_ref())
            {
                Some(volume_content_source::Type::Snapshot(_)) => {
                    return Err(CsiError::invalid("snapshot content sources are not supported"));
                }
                Some(volume_content_source::Type::Volume(src)) => {
                    self.clone_from(&src.volume_id, &label, &region, size_gib).await?
                }
                None => {
                    let opts = CreateVolumeOptions {
                        label: label.clone(),
                        region: region.clone(),
                        size_gib,
                        tags: volume_tags(&req.parameters),
                    };
                    let created = self.cloud.create_volume(&opts).await?;
                    info!(volume_id = created.id, %label, size_gib, %region, "volume created");
                    self.wait_active(created.id).await?
                }
            },
        };

        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: gib_to_bytes(volume.size_gib),
                volume_id: VolumeKey::new(volume.id, volume.label.clone()).handle(),
                volume_context: volume_context(&req.parameters),
                content_source: req.volume_content_source,
                accessible_topology: vec![region_topology(&volume.region)],
            }),
        })
    }

    async fn reuse_existing(
        &self,
        existing: RemoteVolume,
        region: &str,
        size_gib: u64,
    ) -> Result<RemoteVolume, CsiError> {
        if existing.region != region {
            return Err(CsiError::VolumeAlreadyExists(format!(
                "{} in region {}, requested {region}",
                existing.label, existing.region
            )));
        }
        if existing.size_gib != size_gib {
            return Err(CsiError::VolumeAlreadyExists(format!(
                "{} with size {} GiB, requested {size_gib} GiB",
                existing.label, existing.size_gib
            )));
        }
        debug!(volume_id = existing.id, status = ?existing.status, "volume already exists");
        if existing.status == VolumeStatus::Active {
            Ok(existing)
        } else {
            self.wait_active(existing.id).await
        }
    }

    async fn clone_from(
        &self,
        source_handle: &str,
        label: &str,
        region: &str,
        size_gib: u64,
    ) -> Result<RemoteVolume, CsiError> {
        let source_key = VolumeKey::parse(source_handle)
            .map_err(|_| CsiError::NotFound(format!("source volume {source_handle}")))?;
        let source = match self.cloud.get_volume(source_key.volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                return Err(CsiError::NotFound(format!("source volume {source_handle}")));
            }
            Err(e) => return Err(e.into()),
        };
        if source.region != region {
            return Err(CsiError::InvalidArgument(format!(
                "source volume is in region {}, clone requested in {region}",
                source.region
            )));
        }
        if size_gib < source.size_gib {
            return Err(CsiError::InvalidArgument(format!(
                "requested {size_gib} GiB is smaller than the {} GiB source",
                source.size_gib
            )));
        }

        let cloned = self.cloud.clone_volume(source.id, label).await?;
        info!(source = source.id, volume_id = cloned.id, %label, "volume cloned");
        let mut volume = self.wait_active(cloned.id).await?;
        if volume.size_gib != size_gib {
            self.cloud.resize_volume(volume.id, size_gib).await?;
            volume = self.wait_active(volume.id).await?;
        }
        Ok(volume)
    }

    // -----------------------------------------------------------------------
    // DeleteVolume
    // -----------------------------------------------------------------------

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume_inner(
        &self,
        req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        let id = volume_id_as_int(&req.volume_id);
        let volume = match self.cloud.get_volume(id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                debug!(id, "volume already gone");
                return Ok(DeleteVolumeResponse {});
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(instance) = volume.attached_instance_id {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {id} is still attached to instance {instance}"
            )));
        }
        match self.cloud.delete_volume(id).await {
            Ok(()) => info!(id, "volume deleted"),
            Err(e) if e.is_not_found() => debug!(id, "volume vanished during delete"),
            Err(e) => return Err(e.into()),
        }
        Ok(DeleteVolumeResponse {})
    }

    // -----------------------------------------------------------------------
    // Publish / unpublish
    // -----------------------------------------------------------------------

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn publish_inner(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        if req.node_id.is_empty() {
            return Err(CsiError::invalid("node id is required"));
        }
        require_single_node_writer(req.volume_capability.as_ref())?;

        let volume_id = volume_id_as_int(&req.volume_id);
        let instance_id = node_id_as_int(&req.node_id);

        let volume = match self.cloud.get_volume(volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Err(CsiError::VolumeNotFound(req.volume_id)),
            Err(e) => return Err(e.into()),
        };
        match volume.attached_instance_id {
            Some(current) if current == instance_id => {
                debug!(volume_id, instance_id, "volume already attached to node");
                return Ok(publish_response(&volume));
            }
            Some(current) => {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {volume_id} is attached to instance {current}"
                )));
            }
            None => {}
        }

        if let Err(e) = self.cloud.get_instance(instance_id).await {
            return Err(if e.is_not_found() {
                CsiError::NotFound(format!("instance {instance_id}"))
            } else {
                e.into()
            });
        }

        match self.cloud.attach_volume(volume_id, instance_id).await {
            Ok(_) => {}
            Err(CloudError::AlreadyAttached(_)) => {
                return Err(CsiError::Unavailable(format!(
                    "volume {volume_id} was attached concurrently, retry"
                )));
            }
            Err(e) if e.is_not_found() => return Err(CsiError::NotFound(e.to_string())),
            Err(e) => return Err(e.into()),
        }

        let attached =
            wait_for_volume_instance(&self.poller, &*self.cloud, volume_id, Some(instance_id))
                .await?;
        info!(volume_id, instance_id, "volume attached");
        Ok(publish_response(&attached))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn unpublish_inner(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        let volume_id = volume_id_as_int(&req.volume_id);
        let volume = match self.cloud.get_volume(volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                debug!(volume_id, "volume gone, nothing to detach");
                return Ok(ControllerUnpublishVolumeResponse {});
            }
            Err(e) => return Err(e.into()),
        };

        let Some(current) = volume.attached_instance_id else {
            debug!(volume_id, "volume not attached");
            return Ok(ControllerUnpublishVolumeResponse {});
        };
        if !req.node_id.is_empty() && current != node_id_as_int(&req.node_id) {
            debug!(volume_id, current, "volume attached to another node, leaving it");
            return Ok(ControllerUnpublishVolumeResponse {});
        }

        match self.cloud.detach_volume(volume_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(ControllerUnpublishVolumeResponse {}),
            Err(e) => return Err(e.into()),
        }
        wait_for_volume_instance(&self.poller, &*self.cloud, volume_id, None).await?;
        info!(volume_id, instance_id = current, "volume detached");
        Ok(ControllerUnpublishVolumeResponse {})
    }

    // -----------------------------------------------------------------------
    // Expand
    // -----------------------------------------------------------------------

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_inner(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        let range = req
            .capacity_range
            .as_ref()
            .ok_or_else(|| CsiError::invalid("capacity range is required"))?;
        let size_gib = resolve_capacity_gib(Some(range))?;
        let volume_id = volume_id_as_int(&req.volume_id);

        let volume = match self.cloud.get_volume(volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Err(CsiError::VolumeNotFound(req.volume_id)),
            Err(e) => return Err(e.into()),
        };
        if size_gib < volume.size_gib {
            return Err(CsiError::Internal(format!(
                "volume {volume_id} is {} GiB and cannot shrink to {size_gib} GiB",
                volume.size_gib
            )));
        }
        if size_gib > volume.size_gib {
            self.cloud.resize_volume(volume_id, size_gib).await?;
            self.wait_active(volume_id).await?;
            info!(volume_id, from = volume.size_gib, to = size_gib, "volume resized");
        } else {
            debug!(volume_id, size_gib, "volume already at requested size");
        }

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: gib_to_bytes(size_gib),
            node_expansion_required: !req.volume_capability.as_ref().is_some_and(is_block),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    async fn list_volumes_inner(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        if req.max_entries < 0 {
            return Err(CsiError::invalid("max_entries must not be negative"));
        }
        let page = if req.starting_token.is_empty() {
            1
        } else {
            req.starting_token.parse::<u32>().map_err(|e| {
                CsiError::Aborted(format!("starting token {:?}: {e}", req.starting_token))
            })?
        };
        let opts = ListOptions {
            page,
            label: None,
            page_size: u32::try_from(req.max_entries).ok().filter(|n| *n > 0),
        };
        let listing = self.cloud.list_volumes(&opts).await?;
        let next_token = listing.next_page().map(|p| p.to_string()).unwrap_or_default();

        let entries = listing
            .data
            .into_iter()
            .map(|v| list_volumes_response::Entry {
                volume: Some(Volume {
                    capacity_bytes: gib_to_bytes(v.size_gib),
                    volume_id: VolumeKey::new(v.id, v.label.clone()).handle(),
                    accessible_topology: vec![region_topology(&v.region)],
                    ..Default::default()
                }),
                status: Some(list_volumes_response::VolumeStatus {
                    published_node_ids: v
                        .attached_instance_id
                        .map(|id| id.to_string())
                        .into_iter()
                        .collect(),
                    volume_condition: None,
                }),
            })
            .collect();
        Ok(ListVolumesResponse { entries, next_token })
    }

    async fn validate_inner(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("volume id is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid("volume capabilities are required"));
        }
        let volume_id = volume_id_as_int(&req.volume_id);
        if let Err(e) = self.cloud.get_volume(volume_id).await {
            return Err(if e.is_not_found() {
                CsiError::VolumeNotFound(req.volume_id)
            } else {
                e.into()
            });
        }

        if req.volume_capabilities.iter().all(is_single_node_writer) {
            Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                    mutable_parameters: HashMap::new(),
                }),
                message: String::new(),
            })
        } else {
            Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "only SINGLE_NODE_WRITER is supported".to_owned(),
            })
        }
    }

    fn capabilities() -> Vec<ControllerServiceCapability> {
        use controller_service_capability::{Rpc, Type, rpc};

        [
            rpc::Type::CreateDeleteVolume,
            rpc::Type::PublishUnpublishVolume,
            rpc::Type::ListVolumes,
            rpc::Type::ListVolumesPublishedNodes,
            rpc::Type::ExpandVolume,
            rpc::Type::CloneVolume,
        ]
        .into_iter()
        .map(|t| ControllerServiceCapability {
            r#type: Some(Type::Rpc(Rpc { r#type: t as i32 })),
        })
        .collect()
    }
}

fn publish_response(volume: &RemoteVolume) -> ControllerPublishVolumeResponse {
    ControllerPublishVolumeResponse {
        publish_context: HashMap::from([(
            CONTEXT_DEVICE_PATH.to_owned(),
            volume.filesystem_path.clone(),
        )]),
    }
}

/// Settings the node needs at stage time, copied from the parameters: the
/// partition to mount, and the LUKS settings when encryption is on.
fn volume_context(parameters: &HashMap<String, String>) -> HashMap<String, String> {
    let encrypted = parameters
        .get(PARAM_LUKS_ENCRYPTED)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let luks: &[&str] = if encrypted {
        &[PARAM_LUKS_ENCRYPTED, PARAM_LUKS_CIPHER, PARAM_LUKS_KEY_SIZE]
    } else {
        &[]
    };
    luks.iter()
        .chain(&[CONTEXT_PARTITION])
        .filter_map(|k| parameters.get(*k).map(|v| ((*k).to_owned(), v.clone())))
        .collect()
}

fn volume_tags(parameters: &HashMap<String, String>) -> Vec<String> {
    parameters
        .get(PARAM_VOLUME_TAGS)
        .map(|tags| {
            tags.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn unsupported(what: &str) -> Status {
    Status::from(CsiError::Unimplemented(what.to_owned()))
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let fut = self.create_volume_inner(request.into_inner());
        observe_rpc(&*self.metrics, "CreateVolume", fut).await
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let fut = self.delete_volume_inner(request.into_inner());
        observe_rpc(&*self.metrics, "DeleteVolume", fut).await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let fut = self.publish_inner(request.into_inner());
        observe_rpc(&*self.metrics, "ControllerPublishVolume", fut).await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let fut = self.unpublish_inner(request.into_inner());
        observe_rpc(&*self.metrics, "ControllerUnpublishVolume", fut).await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let fut = self.validate_inner(request.into_inner());
        observe_rpc(&*self.metrics, "ValidateVolumeCapabilities", fut).await
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let fut = self.list_volumes_inner(request.into_inner());
        observe_rpc(&*self.metrics, "ListVolumes", fut).await
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(unsupported("GetCapacity"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        observe_rpc(&*self.metrics, "ControllerGetCapabilities", async {
            Ok(ControllerGetCapabilitiesResponse {
                capabilities: Self::capabilities(),
            })
        })
        .await
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(unsupported("CreateSnapshot"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(unsupported("DeleteSnapshot"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(unsupported("ListSnapshots"))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let fut = self.expand_inner(request.into_inner());
        observe_rpc(&*self.metrics, "ControllerExpandVolume", fut).await
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        Err(unsupported("ControllerGetVolume"))
    }
}
