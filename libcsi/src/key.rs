//! Volume handle encoding.
//!
//! The orchestrator only ever sees an opaque volume handle of the form
//! `"<volume-id>-<label>"`. The numeric part is the remote volume ID; the label
//! is the normalized name used both as the remote label and as the suffix of
//! the device symlink on the node, which is how the node finds the device
//! without talking to the cloud API.

use std::fmt;

use crate::error::CsiError;

/// Maximum length of a remote volume label.
pub const MAX_VOLUME_LABEL_LENGTH: usize = 32;

/// Maximum length of the configurable label prefix.
pub const MAX_VOLUME_LABEL_PREFIX_LENGTH: usize = 12;

/// Decoded volume handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeKey {
    /// Remote volume ID.
    pub volume_id: u64,
    /// Normalized remote label.
    pub label: String,
}

impl VolumeKey {
    /// Build a key from a remote volume ID and its label.
    pub fn new(volume_id: u64, label: impl Into<String>) -> Self {
        Self {
            volume_id,
            label: label.into(),
        }
    }

    /// Decode a volume handle.
    pub fn parse(handle: &str) -> Result<Self, CsiError> {
        let (id, label) = handle.split_once('-').ok_or_else(|| {
            CsiError::InvalidArgument(format!("volume handle {handle:?} has no separator"))
        })?;
        let volume_id = id.parse::<u64>().map_err(|e| {
            CsiError::InvalidArgument(format!("volume handle {handle:?} has bad id: {e}"))
        })?;
        Ok(Self::new(volume_id, label))
    }

    /// Encode the key as the wire handle.
    pub fn handle(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.volume_id, self.label)
    }
}

/// Derive the remote label for a requested volume name.
///
/// Hyphens are stripped so the label never contains the handle separator.
/// Truncation can map two long names onto the same label.
pub fn normalized_label(name: &str, prefix: Option<&str>) -> String {
    let stripped: String = name.chars().filter(|c| *c != '-').collect();
    let label = truncate(&stripped, MAX_VOLUME_LABEL_LENGTH);
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => truncate(&format!("{prefix}{label}"), MAX_VOLUME_LABEL_LENGTH),
        None => label,
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Remote volume ID for an inbound handle.
///
/// Handles that do not parse (conformance suites pass arbitrary strings) are
/// hashed so lookups still hit a stable, almost certainly absent, ID.
pub fn volume_id_as_int(handle: &str) -> u64 {
    match VolumeKey::parse(handle) {
        Ok(key) => key.volume_id,
        Err(_) => u64::from(fnv1a32(handle.as_bytes())),
    }
}

/// Instance ID for an inbound node ID, with the same fallback as
/// [`volume_id_as_int`].
pub fn node_id_as_int(node_id: &str) -> u64 {
    let head = node_id.split_once('-').map_or(node_id, |(id, _)| id);
    match head.parse::<u64>() {
        Ok(id) => id,
        Err(_) => u64::from(fnv1a32(node_id.as_bytes())),
    }
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(PRIME)
    })
}
