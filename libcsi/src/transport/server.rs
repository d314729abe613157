//! gRPC server on the plugin's UNIX socket.
//!
//! The orchestrator's sidecars dial the socket named by the endpoint; every
//! process serves Identity, and Controller and Node according to its mode.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::error::CsiError;
use crate::identity::IdentityService;
use crate::node::NodeService;

const UNIX_SCHEME: &str = "unix://";

/// Services one plugin process exposes.
pub struct CsiServices {
    pub identity: IdentityService,
    pub controller: Option<ControllerService>,
    pub node: Option<NodeService>,
}

/// Filesystem path of a `unix://` endpoint.
pub fn socket_path(endpoint: &str) -> Result<PathBuf, CsiError> {
    match endpoint.strip_prefix(UNIX_SCHEME) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint:?} is not a unix:// socket"
        ))),
    }
}

async fn prepare_socket(path: &Path) -> Result<(), CsiError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(CsiError::transport)?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CsiError::TransportError(format!(
            "remove stale socket {}: {e}",
            path.display()
        ))),
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Serve `services` on the configured endpoint until `shutdown` turns true.
///
/// In-flight RPCs are allowed to finish; the socket file is removed on exit.
pub async fn serve(
    config: &DriverConfig,
    services: CsiServices,
    shutdown: watch::Receiver<bool>,
) -> Result<(), CsiError> {
    let path = socket_path(&config.endpoint)?;
    prepare_socket(&path).await?;

    let listener = UnixListener::bind(&path).map_err(|e| {
        CsiError::TransportError(format!("bind {}: {e}", path.display()))
    })?;
    info!(
        path = %path.display(),
        driver = %config.driver_name,
        controller = services.controller.is_some(),
        node = services.node.is_some(),
        "CSI gRPC server listening"
    );

    let result = Server::builder()
        .add_service(IdentityServer::new(services.identity))
        .add_optional_service(services.controller.map(ControllerServer::new))
        .add_optional_service(services.node.map(NodeServer::new))
        .serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            wait_for_shutdown(shutdown),
        )
        .await
        .map_err(CsiError::transport);

    if let Err(e) = tokio::fs::remove_file(&path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "removing socket failed");
        }
    }
    info!("CSI gRPC server stopped");
    result
}
