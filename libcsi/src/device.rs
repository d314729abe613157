//! Locating the block device behind an attached volume.
//!
//! The cloud provider exposes attached volumes through stable symlinks under
//! `/dev/disk/by-id/` named after the volume label. Freshly attached disks
//! sometimes show up before udev has created those links, so a miss triggers
//! a udev change event for every SCSI disk not seen before and looks again.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::mount::{Executor, FileSystem};

const BY_ID_DIR: &str = "/dev/disk/by-id";
const SCSI_DISK_GLOB: &str = "/dev/sd*";

/// Finds the local device node for a volume label.
pub struct DeviceResolver {
    fs: Arc<dyn FileSystem>,
    exec: Arc<dyn Executor>,
    known: Mutex<HashSet<String>>,
}

impl DeviceResolver {
    pub fn new(fs: Arc<dyn FileSystem>, exec: Arc<dyn Executor>) -> Self {
        Self {
            fs,
            exec,
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Symlinks the provider may create for `label`, most specific first.
    pub fn candidate_paths(label: &str, partition: Option<&str>) -> Vec<String> {
        let suffix = partition
            .filter(|p| !p.is_empty())
            .map(|p| format!("-part{p}"))
            .unwrap_or_default();
        vec![
            format!("{BY_ID_DIR}/linode-{label}{suffix}"),
            format!("{BY_ID_DIR}/scsi-0Linode_Volume_{label}{suffix}"),
        ]
    }

    /// First candidate that exists, resolved to the real device node.
    ///
    /// Returns `None` when nothing shows up even after nudging udev.
    pub async fn verify_device_path(&self, candidates: &[String]) -> Option<String> {
        if let Some(found) = self.first_existing(candidates) {
            return Some(found);
        }
        self.trigger_new_disks().await;
        self.first_existing(candidates)
    }

    fn first_existing(&self, candidates: &[String]) -> Option<String> {
        let path = candidates.iter().find(|c| self.fs.exists(Path::new(c)))?;
        match self.fs.eval_symlinks(Path::new(path)) {
            Ok(real) => Some(real.to_string_lossy().into_owned()),
            Err(e) => {
                debug!(path, error = %e, "cannot resolve device symlink, using it as is");
                Some(path.clone())
            }
        }
    }

    async fn trigger_new_disks(&self) {
        let disks = match self.fs.glob(SCSI_DISK_GLOB) {
            Ok(disks) => disks,
            Err(e) => {
                warn!(error = %e, "listing scsi disks failed");
                return;
            }
        };

        let fresh: Vec<String> = {
            let Ok(mut known) = self.known.lock() else {
                return;
            };
            disks
                .into_iter()
                .map(|d| d.to_string_lossy().into_owned())
                .filter(|d| known.insert(d.clone()))
                .collect()
        };

        for disk in fresh {
            let filter = format!("--property-match=DEVNAME={disk}");
            debug!(%disk, "triggering udev change event");
            match self
                .exec
                .run("udevadm", &["trigger", "--action=change", &filter], None)
                .await
            {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(%disk, stderr = %out.stderr.trim(), "udevadm trigger failed"),
                Err(e) => warn!(%disk, error = %e, "udevadm trigger failed"),
            }
        }
    }
}
