//! CSI Identity service.
//!
//! Lets callers discover the plugin name and capabilities and check health.
//! Every CSI plugin process serves it, whatever its mode.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::csi::identity_server::Identity;
use crate::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse, plugin_capability,
};
use crate::metrics::{MetricsSink, observe_rpc};

/// Identity service: plugin discovery and health probing.
pub struct IdentityService {
    name: String,
    vendor_version: String,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<dyn MetricsSink>,
}

impl IdentityService {
    pub fn new(
        name: impl Into<String>,
        vendor_version: impl Into<String>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            name: name.into(),
            vendor_version: vendor_version.into(),
            shutdown,
            metrics,
        }
    }

    fn capabilities() -> Vec<PluginCapability> {
        use plugin_capability::{Service, Type, VolumeExpansion, service, volume_expansion};

        let service_cap = |t: service::Type| PluginCapability {
            r#type: Some(Type::Service(Service { r#type: t as i32 })),
        };
        vec![
            service_cap(service::Type::ControllerService),
            service_cap(service::Type::VolumeAccessibilityConstraints),
            PluginCapability {
                r#type: Some(Type::VolumeExpansion(VolumeExpansion {
                    r#type: volume_expansion::Type::Online as i32,
                })),
            },
        ]
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    #[instrument(skip_all)]
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        observe_rpc(&*self.metrics, "GetPluginInfo", async {
            Ok(GetPluginInfoResponse {
                name: self.name.clone(),
                vendor_version: self.vendor_version.clone(),
                manifest: HashMap::new(),
            })
        })
        .await
    }

    #[instrument(skip_all)]
    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        observe_rpc(&*self.metrics, "GetPluginCapabilities", async {
            Ok(GetPluginCapabilitiesResponse {
                capabilities: Self::capabilities(),
            })
        })
        .await
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        let ready = !*self.shutdown.borrow();
        observe_rpc(&*self.metrics, "Probe", async {
            Ok(ProbeResponse { ready: Some(ready) })
        })
        .await
    }
}
