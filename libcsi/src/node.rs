//! CSI Node service.
//!
//! Runs on every worker and turns an attached remote volume into something a
//! container can use:
//!
//! ```text
//! Unstaged --stage--> Staged --publish--> Published(1..n)
//!    ^                  |  ^                  |
//!    +-----unstage------+  +----unpublish-----+
//! ```
//!
//! Staging finds the device through its by-id symlink, optionally opens a LUKS
//! mapping on it, formats it if blank and mounts it at the staging path.
//! Publishing bind-mounts the staging path (or the raw device, for block
//! volumes) into the pod. Every mutating RPC holds one node-wide lock so
//! mount-table checks and the mounts that follow them never interleave.

use std::iter;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::cloud::Instance;
use crate::csi::node_server::Node;
use crate::csi::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, VolumeCapability, VolumeCondition,
    VolumeUsage, node_service_capability, volume_usage,
};
use crate::device::DeviceResolver;
use crate::error::CsiError;
use crate::key::VolumeKey;
use crate::luks::{Lifecycle, LuksContext, LuksManager, is_mapper_path, mapper_path};
use crate::metrics::{MetricsSink, observe_rpc};
use crate::mount::{Executor, FileSystem, Mounter};
use crate::types::{
    CONTEXT_DEVICE_PATH, CONTEXT_PARTITION, SECRET_LUKS_KEY, is_block, mount_params,
    region_topology,
};

const MIN_VOLUMES_MEMORY_GIB: u64 = 8;
const MAX_VOLUMES_MEMORY_GIB: u64 = 64;

/// Attachments the node can take: one per GiB of memory within
/// [8, 64], minus the boot disk.
pub fn max_volumes_per_node(memory_bytes: u64) -> i64 {
    let gib = (memory_bytes >> 30).clamp(MIN_VOLUMES_MEMORY_GIB, MAX_VOLUMES_MEMORY_GIB);
    i64::try_from(gib).unwrap_or(0) - 1
}

fn required<'a>(value: &'a str, what: &str) -> Result<&'a str, CsiError> {
    if value.is_empty() {
        Err(CsiError::InvalidArgument(format!("{what} is required")))
    } else {
        Ok(value)
    }
}

fn required_capability(cap: Option<&VolumeCapability>) -> Result<&VolumeCapability, CsiError> {
    cap.ok_or_else(|| CsiError::invalid("volume capability is required"))
}

/// Node service for one instance.
pub struct NodeService {
    instance: Instance,
    mounter: Arc<dyn Mounter>,
    fs: Arc<dyn FileSystem>,
    exec: Arc<dyn Executor>,
    devices: DeviceResolver,
    luks: LuksManager,
    lock: Mutex<()>,
    metrics: Arc<dyn MetricsSink>,
}

impl NodeService {
    pub fn new(
        instance: Instance,
        mounter: Arc<dyn Mounter>,
        fs: Arc<dyn FileSystem>,
        exec: Arc<dyn Executor>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            devices: DeviceResolver::new(fs.clone(), exec.clone()),
            luks: LuksManager::new(exec.clone(), fs.clone()),
            instance,
            mounter,
            fs,
            exec,
            lock: Mutex::new(()),
            metrics,
        }
    }

    async fn resolve_device(
        &self,
        key: &VolumeKey,
        partition: Option<&str>,
    ) -> Result<String, CsiError> {
        let candidates = DeviceResolver::candidate_paths(&key.label, partition);
        self.devices
            .verify_device_path(&candidates)
            .await
            .ok_or_else(|| {
                CsiError::Internal(format!(
                    "no device found for volume {key}, tried {}",
                    candidates.join(", ")
                ))
            })
    }

    fn mkdir(&self, path: &Path) -> Result<(), CsiError> {
        self.fs.mkdir_all(path).map_err(|e| CsiError::MountFailed {
            path: path.display().to_string(),
            reason: format!("create directory: {e}"),
        })
    }

    // -----------------------------------------------------------------------
    // Stage / unstage
    // -----------------------------------------------------------------------

    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, staging = %req.staging_target_path)
    )]
    async fn stage_inner(
        &self,
        req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, CsiError> {
        required(&req.volume_id, "volume id")?;
        let staging = required(&req.staging_target_path, "staging target path")?;
        let cap = required_capability(req.volume_capability.as_ref())?;
        let key = VolumeKey::parse(&req.volume_id)?;

        let luks_ctx = LuksContext::from_request(
            &req.volume_context,
            &req.secrets,
            &key.label,
            Lifecycle::NodeStageVolume,
        );
        if luks_ctx.encryption_enabled && !is_block(cap) {
            luks_ctx.validate()?;
        }

        let _guard = self.lock.lock().await;

        let partition = req.volume_context.get(CONTEXT_PARTITION).map(String::as_str);
        let device = self.resolve_device(&key, partition).await?;

        if self.mounter.is_mount_point(staging).await? {
            debug!(staging, "staging path already mounted");
            return Ok(NodeStageVolumeResponse {});
        }
        if is_block(cap) {
            debug!(%device, "block volume, nothing to stage");
            return Ok(NodeStageVolumeResponse {});
        }

        let source = if luks_ctx.encryption_enabled {
            if !self.luks.is_formatted(&device).await? {
                self.luks.format(&device, &luks_ctx).await?;
            }
            self.luks.open(&device, &luks_ctx).await?
        } else {
            device
        };

        self.mkdir(Path::new(staging))?;
        let (fs_type, flags) = mount_params(cap);
        self.mounter
            .format_and_mount(&source, staging, &fs_type, &flags)
            .await?;
        info!(%source, staging, %fs_type, "volume staged");
        Ok(NodeStageVolumeResponse {})
    }

    /// Fail while anything other than the staging mount still uses the staged
    /// device: a bind of the staging path, or another mount of its source.
    async fn ensure_unpublished(&self, staging: &str, sources: &[String]) -> Result<(), CsiError> {
        for source in sources.iter().map(String::as_str).chain(iter::once(staging)) {
            let users: Vec<String> = self
                .mounter
                .mount_targets(source)
                .await?
                .into_iter()
                .filter(|t| t != staging)
                .collect();
            if !users.is_empty() {
                return Err(CsiError::FailedPrecondition(format!(
                    "{staging} is still published at {}",
                    users.join(", ")
                )));
            }
        }
        Ok(())
    }

    async fn close_mapping(&self, path: &str) {
        match self.luks.is_luks_mapping(path).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(path, error = %e, "cannot inspect device mapping");
                return;
            }
        }
        let name = path.trim_start_matches("/dev/mapper/");
        match self.luks.close(name).await {
            Ok(()) => info!(mapping = name, "luks mapping closed"),
            Err(e) => warn!(mapping = name, error = %e, "closing luks mapping failed"),
        }
    }

    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, staging = %req.staging_target_path)
    )]
    async fn unstage_inner(
        &self,
        req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, CsiError> {
        required(&req.volume_id, "volume id")?;
        let staging = required(&req.staging_target_path, "staging target path")?;
        let key = VolumeKey::parse(&req.volume_id).ok();

        let _guard = self.lock.lock().await;

        let mut mappings = Vec::new();
        if self.mounter.is_mount_point(staging).await? {
            let sources = self.mounter.mount_sources(staging).await?;
            self.ensure_unpublished(staging, &sources).await?;
            self.mounter.unmount(staging).await?;
            info!(staging, "staging path unmounted");
            mappings.extend(sources.into_iter().filter(|s| is_mapper_path(s)));
        } else {
            debug!(staging, "staging path not mounted");
        }

        // A mapping whose close failed earlier outlives the staging mount and
        // can only be found by name.
        if let Some(key) = &key {
            let path = mapper_path(&key.label);
            if !mappings.contains(&path) && self.fs.exists(Path::new(&path)) {
                mappings.push(path);
            }
        }
        for path in &mappings {
            self.close_mapping(path).await;
        }

        info!(staging, "volume unstaged");
        Ok(NodeUnstageVolumeResponse {})
    }

    // -----------------------------------------------------------------------
    // Publish / unpublish
    // -----------------------------------------------------------------------

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_inner(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, CsiError> {
        required(&req.volume_id, "volume id")?;
        let staging = required(&req.staging_target_path, "staging target path")?;
        let target = required(&req.target_path, "target path")?;
        let cap = required_capability(req.volume_capability.as_ref())?;

        let _guard = self.lock.lock().await;

        if self.mounter.is_mount_point(target).await? {
            debug!(target, "target already mounted");
            return Ok(NodePublishVolumeResponse {});
        }

        let mut options = vec!["bind".to_owned()];
        if req.readonly {
            options.push("ro".to_owned());
        }

        if is_block(cap) {
            let device = match req.publish_context.get(CONTEXT_DEVICE_PATH) {
                Some(path) if !path.is_empty() => path.clone(),
                _ => {
                    let key = VolumeKey::parse(&req.volume_id)?;
                    let partition = req.volume_context.get(CONTEXT_PARTITION).map(String::as_str);
                    self.resolve_device(&key, partition).await?
                }
            };
            let target_path = Path::new(target);
            if let Some(parent) = target_path.parent() {
                self.mkdir(parent)?;
            }
            self.fs
                .create_file(target_path)
                .map_err(|e| CsiError::MountFailed {
                    path: target.to_owned(),
                    reason: format!("create block target: {e}"),
                })?;
            self.mounter.mount(&device, target, "", &options).await?;
            info!(%device, target, "block volume published");
        } else {
            self.mkdir(Path::new(target))?;
            let (_, flags) = mount_params(cap);
            options.extend(flags);
            self.mounter.mount(staging, target, "", &options).await?;
            info!(staging, target, read_only = req.readonly, "volume published");
        }
        Ok(NodePublishVolumeResponse {})
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn unpublish_inner(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, CsiError> {
        required(&req.volume_id, "volume id")?;
        let target = required(&req.target_path, "target path")?;

        let _guard = self.lock.lock().await;

        if self.mounter.is_mount_point(target).await? {
            self.mounter.unmount(target).await?;
            info!(target, "volume unpublished");
        } else {
            debug!(target, "target not mounted");
        }
        if let Err(e) = self.fs.remove(Path::new(target)) {
            warn!(target, error = %e, "removing target path failed");
        }
        Ok(NodeUnpublishVolumeResponse {})
    }

    // -----------------------------------------------------------------------
    // Expand / stats
    // -----------------------------------------------------------------------

    async fn fs_type_of(&self, device: &str) -> Result<String, CsiError> {
        let out = self
            .exec
            .run("blkid", &["-p", "-s", "TYPE", "-o", "value", device], None)
            .await
            .map_err(CsiError::internal)?;
        if !out.success() {
            return Err(CsiError::Internal(format!(
                "cannot determine filesystem on {device}: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.trim().to_owned())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, path = %req.volume_path))]
    async fn expand_inner(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        required(&req.volume_id, "volume id")?;
        let volume_path = required(&req.volume_path, "volume path")?;
        let capacity_bytes = req.capacity_range.as_ref().map_or(0, |r| r.required_bytes);

        let _guard = self.lock.lock().await;

        if !self.mounter.is_mount_point(volume_path).await? {
            return Err(CsiError::NotFound(format!("{volume_path} is not mounted")));
        }
        if req.volume_capability.as_ref().is_some_and(is_block) {
            debug!(volume_path, "block volume, nothing to grow");
            return Ok(NodeExpandVolumeResponse { capacity_bytes });
        }

        let device = self
            .mounter
            .mount_sources(volume_path)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CsiError::NotFound(format!("no device mounted at {volume_path}")))?;

        if is_mapper_path(&device) && self.luks.is_luks_mapping(&device).await? {
            let name = device.trim_start_matches("/dev/mapper/");
            let key = req.secrets.get(SECRET_LUKS_KEY).map(String::as_str);
            self.luks.resize(name, key).await?;
        }

        let fs_type = self.fs_type_of(&device).await?;
        let (program, args): (&str, Vec<&str>) = match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => ("resize2fs", vec![device.as_str()]),
            "xfs" => ("xfs_growfs", vec![volume_path]),
            other => {
                return Err(CsiError::Internal(format!(
                    "growing {other:?} filesystems is not supported"
                )));
            }
        };
        let out = self
            .exec
            .run(program, &args, None)
            .await
            .map_err(CsiError::internal)?;
        if !out.success() {
            return Err(CsiError::Internal(format!(
                "{program} {device} failed: {}",
                out.stderr.trim()
            )));
        }
        info!(%device, %fs_type, "filesystem grown");
        Ok(NodeExpandVolumeResponse { capacity_bytes })
    }

    async fn stats_inner(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, CsiError> {
        required(&req.volume_id, "volume id")?;
        let volume_path = required(&req.volume_path, "volume path")?;
        let path = Path::new(volume_path);
        if !self.fs.exists(path) {
            return Err(CsiError::NotFound(format!(
                "volume path {volume_path} does not exist"
            )));
        }

        let stats = self
            .fs
            .statfs(path)
            .map_err(|e| CsiError::Internal(format!("statfs {volume_path}: {e}")))?;
        let mounted = self.mounter.is_mount_point(volume_path).await?;

        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: as_i64(stats.available_bytes),
                    total: as_i64(stats.total_bytes),
                    used: as_i64(stats.used_bytes),
                    unit: volume_usage::Unit::Bytes as i32,
                },
                VolumeUsage {
                    available: as_i64(stats.free_inodes),
                    total: as_i64(stats.total_inodes),
                    used: as_i64(stats.used_inodes),
                    unit: volume_usage::Unit::Inodes as i32,
                },
            ],
            volume_condition: Some(VolumeCondition {
                abnormal: !mounted,
                message: if mounted {
                    "volume is mounted".to_owned()
                } else {
                    format!("{volume_path} is not a mount point")
                },
            }),
        })
    }

    fn capabilities() -> Vec<NodeServiceCapability> {
        use node_service_capability::{Rpc, Type, rpc};

        [
            rpc::Type::StageUnstageVolume,
            rpc::Type::ExpandVolume,
            rpc::Type::GetVolumeStats,
            rpc::Type::VolumeCondition,
        ]
        .into_iter()
        .map(|t| NodeServiceCapability {
            r#type: Some(Type::Rpc(Rpc { r#type: t as i32 })),
        })
        .collect()
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let fut = self.stage_inner(request.into_inner());
        observe_rpc(&*self.metrics, "NodeStageVolume", fut).await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let fut = self.unstage_inner(request.into_inner());
        observe_rpc(&*self.metrics, "NodeUnstageVolume", fut).await
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let fut = self.publish_inner(request.into_inner());
        observe_rpc(&*self.metrics, "NodePublishVolume", fut).await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let fut = self.unpublish_inner(request.into_inner());
        observe_rpc(&*self.metrics, "NodeUnpublishVolume", fut).await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let fut = self.stats_inner(request.into_inner());
        observe_rpc(&*self.metrics, "NodeGetVolumeStats", fut).await
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let fut = self.expand_inner(request.into_inner());
        observe_rpc(&*self.metrics, "NodeExpandVolume", fut).await
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        observe_rpc(&*self.metrics, "NodeGetCapabilities", async {
            Ok(NodeGetCapabilitiesResponse {
                capabilities: Self::capabilities(),
            })
        })
        .await
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        observe_rpc(&*self.metrics, "NodeGetInfo", async {
            Ok(NodeGetInfoResponse {
                node_id: self.instance.id.to_string(),
                max_volumes_per_node: max_volumes_per_node(self.instance.memory_bytes),
                accessible_topology: Some(region_topology(&self.instance.region)),
            })
        })
        .await
    }
}
