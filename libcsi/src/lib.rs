//! # libcsi: CSI plugin for cloud block storage
//!
//! `libcsi` implements the [Container Storage Interface][csi] for remote block
//! volumes managed through a REST API. The controller side creates, attaches
//! and resizes volumes through the cloud API; the node side finds the attached
//! disk, optionally wraps it in LUKS, formats and mounts it, and bind-mounts it
//! into pods. Services are tonic gRPC servers on a UNIX socket and follow the
//! RK8s conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`csi`] | Generated CSI v1 protobuf messages and service traits. |
//! | [`types`] | Driver constants, capacity and capability helpers. |
//! | [`key`] | Volume handle encoding and label normalization. |
//! | [`error`] | [`CsiError`] enum and its gRPC status mapping. |
//! | [`config`] | [`DriverConfig`] runtime settings. |
//! | [`cloud`] | [`CloudClient`] trait and its REST implementation. |
//! | [`poll`] | Bounded waits for remote state transitions. |
//! | [`identity`] | [`IdentityService`], plugin discovery and health. |
//! | [`controller`] | [`ControllerService`], volume lifecycle against the API. |
//! | [`node`] | [`NodeService`], stage, publish, expand and stats. |
//! | [`device`] | Device discovery under `/dev/disk/by-id`. |
//! | [`luks`] | LUKS formatting and mappings via `cryptsetup`. |
//! | [`mount`] | Mount, filesystem and command abstractions. |
//! | [`metrics`] | Per-RPC counters and latencies. |
//! | [`transport`] | gRPC server and client over a UNIX socket. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

#[allow(clippy::all)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod cloud;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod identity;
pub mod key;
pub mod luks;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod poll;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use cloud::CloudClient;
pub use config::{DriverConfig, Mode};
pub use controller::ControllerService;
pub use error::CsiError;
pub use identity::IdentityService;
pub use key::VolumeKey;
pub use metrics::{MetricsSink, NoopMetrics, OperationMetrics};
pub use node::NodeService;
pub use transport::{CsiClient, CsiServices};
