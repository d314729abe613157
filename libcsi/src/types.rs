//! Shared constants and helpers over the generated CSI types.
//!
//! Parameter, secret and context keys live here because the controller writes
//! them and the node reads them back; both sides must agree on spelling.

use std::collections::HashMap;

use crate::csi::{self, CapacityRange, Topology, VolumeCapability, volume_capability};
use crate::error::CsiError;

// ---------------------------------------------------------------------------
// Well-known keys
// ---------------------------------------------------------------------------

/// Default plugin name reported by the Identity service.
pub const DEFAULT_DRIVER_NAME: &str = "blockcsi.rk8s.io";

/// Topology segment key carrying the cloud region.
pub const TOPOLOGY_REGION_KEY: &str = "topology.blockcsi.rk8s.io/region";

/// Storage-class parameter enabling LUKS encryption (`"true"` / `"false"`).
pub const PARAM_LUKS_ENCRYPTED: &str = "blockcsi.rk8s.io/luks-encrypted";
/// Storage-class parameter selecting the LUKS cipher.
pub const PARAM_LUKS_CIPHER: &str = "blockcsi.rk8s.io/luks-cipher";
/// Storage-class parameter selecting the LUKS key size in bits.
pub const PARAM_LUKS_KEY_SIZE: &str = "blockcsi.rk8s.io/luks-key-size";
/// Storage-class parameter with comma separated remote volume tags.
pub const PARAM_VOLUME_TAGS: &str = "blockcsi.rk8s.io/volume-tags";

/// Secret key holding the LUKS passphrase.
pub const SECRET_LUKS_KEY: &str = "luksKey";

/// Publish context key carrying the remote device path.
pub const CONTEXT_DEVICE_PATH: &str = "devicePath";
/// Volume context key selecting a partition of the attached disk.
pub const CONTEXT_PARTITION: &str = "partition";

/// Filesystem used when the capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

/// Bytes per GiB.
pub const GIB: i64 = 1 << 30;

/// Smallest volume the provider will create, in GiB.
pub const MIN_VOLUME_SIZE_GIB: u64 = 10;

/// Convert a byte count into whole GiB, rounding up.
pub fn bytes_to_gib(bytes: i64) -> u64 {
    let bytes = u64::try_from(bytes.max(0)).unwrap_or(0);
    bytes.div_ceil(GIB as u64)
}

/// Convert GiB into bytes.
pub fn gib_to_bytes(gib: u64) -> i64 {
    i64::try_from(gib).unwrap_or(i64::MAX / GIB).saturating_mul(GIB)
}

/// Resolve the size of a volume, in GiB, from an optional capacity range.
///
/// Requests below the provider minimum are rounded up to it.
pub fn resolve_capacity_gib(range: Option<&CapacityRange>) -> Result<u64, CsiError> {
    let Some(range) = range else {
        return Ok(MIN_VOLUME_SIZE_GIB);
    };
    let (required, limit) = (range.required_bytes, range.limit_bytes);
    if required < 0 || limit < 0 {
        return Err(CsiError::invalid("capacity range must not be negative"));
    }
    if required == 0 && limit == 0 {
        return Err(CsiError::invalid(
            "capacity range must set required_bytes or limit_bytes",
        ));
    }
    if limit > 0 && limit < required {
        return Err(CsiError::InvalidArgument(format!(
            "limit_bytes {limit} is below required_bytes {required}"
        )));
    }

    let size = bytes_to_gib(required).max(MIN_VOLUME_SIZE_GIB);
    if limit > 0 && gib_to_bytes(size) > limit {
        return Err(CsiError::InvalidArgument(format!(
            "a {size} GiB volume does not fit under limit_bytes {limit}"
        )));
    }
    Ok(size)
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// The only access mode this driver supports.
pub fn is_single_node_writer(cap: &VolumeCapability) -> bool {
    cap.access_mode.as_ref().is_some_and(|mode| {
        mode.mode() == volume_capability::access_mode::Mode::SingleNodeWriter
    })
}

/// Reject a missing capability or any mode other than single-node-writer.
pub fn require_single_node_writer(
    cap: Option<&VolumeCapability>,
) -> Result<&VolumeCapability, CsiError> {
    let cap = cap.ok_or_else(|| CsiError::invalid("volume capability is required"))?;
    if !is_single_node_writer(cap) {
        return Err(CsiError::invalid(
            "only the SINGLE_NODE_WRITER access mode is supported",
        ));
    }
    Ok(cap)
}

/// Whether the capability asks for a raw block device.
pub fn is_block(cap: &VolumeCapability) -> bool {
    matches!(
        cap.access_type,
        Some(volume_capability::AccessType::Block(_))
    )
}

/// Filesystem type and mount flags requested by a mount capability.
pub fn mount_params(cap: &VolumeCapability) -> (String, Vec<String>) {
    match &cap.access_type {
        Some(volume_capability::AccessType::Mount(mount)) => {
            let fs_type = if mount.fs_type.is_empty() {
                DEFAULT_FS_TYPE.to_owned()
            } else {
                mount.fs_type.clone()
            };
            (fs_type, mount.mount_flags.clone())
        }
        _ => (DEFAULT_FS_TYPE.to_owned(), Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Topology segment naming a region.
pub fn region_topology(region: &str) -> Topology {
    Topology {
        segments: HashMap::from([(TOPOLOGY_REGION_KEY.to_owned(), region.to_owned())]),
    }
}

/// Region requested by accessibility requirements, preferred entries first.
pub fn requested_region(req: Option<&csi::TopologyRequirement>) -> Option<String> {
    let req = req?;
    req.preferred
        .iter()
        .chain(req.requisite.iter())
        .find_map(|t| t.segments.get(TOPOLOGY_REGION_KEY).cloned())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn gib_conversion_rounds_up() {
        assert_eq!(bytes_to_gib(0), 0);
        assert_eq!(bytes_to_gib(1), 1);
        assert_eq!(bytes_to_gib(GIB), 1);
        assert_eq!(bytes_to_gib(GIB + 1), 2);
        assert_eq!(gib_to_bytes(10), 10 * GIB);
    }

    #[test]
    fn capacity_defaults_to_minimum() {
        assert_eq!(resolve_capacity_gib(None).unwrap(), MIN_VOLUME_SIZE_GIB);
    }

    #[test]
    fn capacity_zero_range_is_invalid() {
        assert!(matches!(
            resolve_capacity_gib(Some(&range(0, 0))),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn capacity_below_minimum_rounds_up() {
        assert_eq!(resolve_capacity_gib(Some(&range(GIB, 0))).unwrap(), 10);
        assert_eq!(resolve_capacity_gib(Some(&range(20 * GIB, 0))).unwrap(), 20);
        assert_eq!(resolve_capacity_gib(Some(&range(0, 50 * GIB))).unwrap(), 10);
    }

    #[test]
    fn capacity_limit_is_enforced() {
        assert!(resolve_capacity_gib(Some(&range(0, GIB))).is_err());
        assert!(resolve_capacity_gib(Some(&range(20 * GIB, 10 * GIB))).is_err());
        assert!(resolve_capacity_gib(Some(&range(GIB, 5 * GIB))).is_err());
        assert_eq!(
            resolve_capacity_gib(Some(&range(12 * GIB, 12 * GIB))).unwrap(),
            12
        );
    }

    #[test]
    fn capability_helpers() {
        assert!(is_single_node_writer(&mount_cap("ext4")));
        assert!(!is_single_node_writer(&multi_writer_cap()));
        assert!(require_single_node_writer(None).is_err());
        assert!(is_block(&block_cap()));
        assert_eq!(mount_params(&mount_cap("")).0, "ext4");
        assert_eq!(mount_params(&mount_cap("xfs")).0, "xfs");
    }

    #[test]
    fn requested_region_prefers_preferred() {
        let req = csi::TopologyRequirement {
            requisite: vec![region_topology("us-east")],
            preferred: vec![region_topology("eu-west")],
        };
        assert_eq!(requested_region(Some(&req)).as_deref(), Some("eu-west"));
        assert_eq!(requested_region(None), None);
    }
}
