//! gRPC client over the plugin's UNIX socket, for tooling and tests.

use std::io;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::csi::controller_client::ControllerClient;
use crate::csi::identity_client::IdentityClient;
use crate::csi::node_client::NodeClient;
use crate::error::CsiError;

use super::server::socket_path;

/// Open a channel to the plugin listening on `endpoint` (`unix://...`).
pub async fn connect_unix(endpoint: &str) -> Result<Channel, CsiError> {
    let path = socket_path(endpoint)?;
    // The authority is ignored; every connection goes to `path`.
    let channel = Endpoint::try_from("http://[::]:50051")
        .map_err(CsiError::transport)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .map_err(CsiError::transport)?;
    debug!(endpoint, "CSI channel established");
    Ok(channel)
}

/// Clients for all three CSI services sharing one channel.
#[derive(Clone)]
pub struct CsiClient {
    pub identity: IdentityClient<Channel>,
    pub controller: ControllerClient<Channel>,
    pub node: NodeClient<Channel>,
}

impl CsiClient {
    pub async fn connect(endpoint: &str) -> Result<Self, CsiError> {
        let channel = connect_unix(endpoint).await?;
        Ok(Self {
            identity: IdentityClient::new(channel.clone()),
            controller: ControllerClient::new(channel.clone()),
            node: NodeClient::new(channel),
        })
    }
}
