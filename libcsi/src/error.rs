//! CSI error types.
//!
//! All errors surfaced by the driver services are represented by the
//! [`CsiError`] enum. Each variant maps onto exactly one gRPC status code at
//! the RPC boundary (see the `From<CsiError> for tonic::Status` impl), so
//! helpers deep in the node or controller paths only need to pick the variant
//! closest to what went wrong.

use thiserror::Error;
use tonic::{Code, Status};

use crate::cloud::CloudError;

/// Unified error type for CSI operations.
#[derive(Debug, Error)]
pub enum CsiError {
    /// The caller supplied a missing or malformed argument, or asked for an
    /// unsupported capability.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote object the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// An object with conflicting properties already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested volume already exists with different properties.
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),

    /// The system is not in a state in which the operation can proceed.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A transient condition; the caller should retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The caller supplied a pagination token that does not parse.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// LUKS configuration or crypto tool failure.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A wait for remote state convergence ran out of time.
    #[error("timed out waiting for {action} on volume {volume_id}")]
    Timeout {
        /// What was being waited on.
        action: String,
        /// Remote volume identifier.
        volume_id: u64,
    },

    /// The cloud API returned an error the caller did not translate.
    #[error("cloud api error: {0}")]
    Cloud(#[from] CloudError),

    /// The operation is not supported by this driver.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// The gRPC socket could not be bound, served or dialed.
    #[error("transport error: {0}")]
    TransportError(String),
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Encryption`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn encryption<E: std::fmt::Display>(e: E) -> Self {
        Self::Encryption(e.to_string())
    }

    /// The gRPC status code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) | Self::VolumeNotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) | Self::VolumeAlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Unavailable(_) | Self::TransportError(_) => Code::Unavailable,
            Self::Aborted(_) => Code::Aborted,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Encryption(_)
            | Self::Timeout { .. }
            | Self::Cloud(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn status_codes() {
        let cases = [
            (CsiError::invalid("x"), Code::InvalidArgument),
            (CsiError::NotFound("x".into()), Code::NotFound),
            (CsiError::AlreadyExists("x".into()), Code::AlreadyExists),
            (CsiError::FailedPrecondition("x".into()), Code::FailedPrecondition),
            (CsiError::Unavailable("x".into()), Code::Unavailable),
            (CsiError::transport("socket gone"), Code::Unavailable),
            (CsiError::encryption("x"), Code::Internal),
            (
                CsiError::Timeout {
                    action: "attach".into(),
                    volume_id: 1,
                },
                Code::Internal,
            ),
            (CsiError::Unimplemented("x".into()), Code::Unimplemented),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn mount_failure_is_internal() {
        let status: Status = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("/mnt/test"));
    }
}
