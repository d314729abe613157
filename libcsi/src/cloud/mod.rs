//! Cloud block-storage API boundary.
//!
//! [`CloudClient`] is the narrow interface the controller and node bootstrap
//! need from the provider. The remote API is the single source of truth for
//! volume size, status and attachment; the driver never caches any of it.
//! [`http::HttpCloudClient`] is the production binding.

pub mod http;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by the cloud API.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The addressed object does not exist (HTTP 404).
    #[error("{0} not found")]
    NotFound(String),

    /// The volume is already attached somewhere; raced with another attach.
    #[error("volume {0} is already attached")]
    AlreadyAttached(u64),

    /// Any other non-success API response.
    #[error("api returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Reasons reported by the API.
        message: String,
    },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl CloudError {
    /// Whether the API reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Provisioning status of a remote volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    /// Being provisioned.
    Creating,
    /// Ready for use.
    Active,
    /// A resize is in flight.
    Resizing,
    /// The provider needs manual intervention.
    ContactSupport,
    /// Any status this driver does not know about.
    #[serde(other)]
    Other,
}

/// A volume as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolume {
    /// Remote volume ID.
    pub id: u64,
    /// Remote label (the normalized volume name).
    pub label: String,
    /// Size in GiB.
    #[serde(rename = "size")]
    pub size_gib: u64,
    /// Region the volume lives in.
    pub region: String,
    /// Provisioning status.
    pub status: VolumeStatus,
    /// Instance the volume is attached to, if any.
    #[serde(rename = "linode_id", default)]
    pub attached_instance_id: Option<u64>,
    /// Device path the provider reports for the attached volume.
    #[serde(default)]
    pub filesystem_path: String,
    /// Tags set at creation.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A compute instance (a cluster node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Remote instance ID.
    pub id: u64,
    /// Instance label; matched against the node name.
    pub label: String,
    /// Region the instance runs in.
    pub region: String,
    /// Memory size in bytes.
    pub memory_bytes: u64,
}

/// Parameters for creating a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateVolumeOptions {
    /// Remote label.
    pub label: String,
    /// Region to create the volume in.
    pub region: String,
    /// Size in GiB.
    #[serde(rename = "size")]
    pub size_gib: u64,
    /// Tags to set on the volume.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Filter and page selection for list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// 1-based page number; `0` means the first page.
    pub page: u32,
    /// Only return objects with this exact label.
    pub label: Option<String>,
    /// Items per page; the provider default when unset.
    pub page_size: Option<u32>,
}

impl ListOptions {
    /// Select a single page.
    pub fn page(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    /// Filter by label on the first page.
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            page: 1,
            label: Some(label.into()),
            page_size: None,
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page.
    pub data: Vec<T>,
    /// This page's number (1-based).
    pub page: u32,
    /// Total number of pages.
    pub pages: u32,
}

impl<T> Page<T> {
    /// Page number of the following page, if there is one.
    pub fn next_page(&self) -> Option<u32> {
        (self.page < self.pages).then_some(self.page + 1)
    }
}

/// Operations the driver needs from the cloud block-storage API.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// List volumes.
    async fn list_volumes(&self, opts: &ListOptions) -> Result<Page<RemoteVolume>, CloudError>;

    /// Fetch one volume.
    async fn get_volume(&self, volume_id: u64) -> Result<RemoteVolume, CloudError>;

    /// Create a detached volume.
    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<RemoteVolume, CloudError>;

    /// Delete a detached volume.
    async fn delete_volume(&self, volume_id: u64) -> Result<(), CloudError>;

    /// Attach a volume to an instance.
    async fn attach_volume(
        &self,
        volume_id: u64,
        instance_id: u64,
    ) -> Result<RemoteVolume, CloudError>;

    /// Detach a volume from whatever instance holds it.
    async fn detach_volume(&self, volume_id: u64) -> Result<(), CloudError>;

    /// Grow a volume to `size_gib`.
    async fn resize_volume(&self, volume_id: u64, size_gib: u64) -> Result<(), CloudError>;

    /// Clone a volume under a new label.
    async fn clone_volume(&self, volume_id: u64, label: &str) -> Result<RemoteVolume, CloudError>;

    /// List instances.
    async fn list_instances(&self, opts: &ListOptions) -> Result<Page<Instance>, CloudError>;

    /// Fetch one instance.
    async fn get_instance(&self, instance_id: u64) -> Result<Instance, CloudError>;
}

/// Find the first volume carrying exactly `label`.
pub async fn find_volume_by_label(
    client: &dyn CloudClient,
    label: &str,
) -> Result<Option<RemoteVolume>, CloudError> {
    let page = client.list_volumes(&ListOptions::label(label)).await?;
    Ok(page.data.into_iter().find(|v| v.label == label))
}

/// Resolve the instance this node runs on.
///
/// An instance-id file (written by the provider's metadata agent) wins when it
/// is present and parses; otherwise the node name is matched against instance
/// labels page by page.
pub async fn resolve_instance(
    client: &dyn CloudClient,
    node_name: &str,
    instance_id_file: Option<&Path>,
) -> Result<Instance, CloudError> {
    if let Some(path) = instance_id_file {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(id) => {
                    debug!(path = %path.display(), id, "instance id read from file");
                    return client.get_instance(id).await;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "unparsable instance id file");
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "instance id file unavailable");
            }
        }
    }

    let mut opts = ListOptions::label(node_name);
    loop {
        let page = client.list_instances(&opts).await?;
        let next = page.next_page();
        if let Some(instance) = page.data.into_iter().find(|i| i.label == node_name) {
            info!(node_name, id = instance.id, region = %instance.region, "node instance resolved");
            return Ok(instance);
        }
        match next {
            Some(p) => opts.page = p,
            None => return Err(CloudError::NotFound(format!("instance with label {node_name}"))),
        }
    }
}
