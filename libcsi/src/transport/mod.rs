//! gRPC transport over a UNIX domain socket.
//!
//! [`server::serve`] exposes the services to the orchestrator's sidecars;
//! [`client::CsiClient`] dials the same socket for tooling and tests.

pub mod client;
pub mod server;

pub use client::{CsiClient, connect_unix};
pub use server::{CsiServices, serve, socket_path};
