//! HTTP binding of [`CloudClient`] for a Linode-style v4 REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    CloudClient, CloudError, CreateVolumeOptions, Instance, ListOptions, Page, RemoteVolume,
};

/// Default API root.
pub const DEFAULT_API_URL: &str = "https://api.linode.com/v4";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloud API client speaking JSON over HTTPS.
pub struct HttpCloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct PageBody<T> {
    data: Vec<T>,
    page: u32,
    pages: u32,
}

#[derive(Deserialize)]
struct InstanceBody {
    id: u64,
    label: String,
    region: String,
    specs: InstanceSpecs,
}

#[derive(Deserialize)]
struct InstanceSpecs {
    /// Memory in MiB.
    memory: u64,
}

impl From<InstanceBody> for Instance {
    fn from(body: InstanceBody) -> Self {
        Self {
            id: body.id,
            label: body.label,
            region: body.region,
            memory_bytes: body.specs.memory << 20,
        }
    }
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Deserialize)]
struct ErrorReason {
    reason: String,
}

#[derive(Serialize)]
struct AttachBody {
    linode_id: u64,
    persist_across_boots: bool,
}

impl HttpCloudClient {
    /// Build a client against `base_url` authenticating with `token`.
    pub fn new(base_url: &str, token: &str, user_agent: &str) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    fn list_request(&self, path: &str, opts: &ListOptions) -> RequestBuilder {
        let mut req = self
            .request(Method::GET, path)
            .query(&[("page", opts.page.max(1))]);
        if let Some(size) = opts.page_size {
            req = req.query(&[("page_size", size)]);
        }
        if let Some(label) = &opts.label {
            req = req.header("X-Filter", json!({ "label": label }).to_string());
        }
        req
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<reqwest::Response, CloudError> {
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(what.to_owned()));
        }

        let body: ErrorBody = resp.json().await.unwrap_or_default();
        let message = body
            .errors
            .into_iter()
            .map(|e| e.reason)
            .collect::<Vec<_>>()
            .join("; ");
        debug!(%status, %message, what, "cloud api request failed");
        Err(CloudError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        what: &str,
    ) -> Result<T, CloudError> {
        self.send(req, what)
            .await?
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }
}

fn volume_ref(volume_id: u64) -> String {
    format!("volume {volume_id}")
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    #[instrument(skip(self))]
    async fn list_volumes(&self, opts: &ListOptions) -> Result<Page<RemoteVolume>, CloudError> {
        let body: PageBody<RemoteVolume> = self
            .send_json(self.list_request("/volumes", opts), "volumes")
            .await?;
        Ok(Page {
            data: body.data,
            page: body.page,
            pages: body.pages,
        })
    }

    #[instrument(skip(self))]
    async fn get_volume(&self, volume_id: u64) -> Result<RemoteVolume, CloudError> {
        self.send_json(
            self.request(Method::GET, &format!("/volumes/{volume_id}")),
            &volume_ref(volume_id),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn create_volume(&self, opts: &CreateVolumeOptions) -> Result<RemoteVolume, CloudError> {
        self.send_json(
            self.request(Method::POST, "/volumes").json(opts),
            "volumes",
        )
        .await
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: u64) -> Result<(), CloudError> {
        self.send(
            self.request(Method::DELETE, &format!("/volumes/{volume_id}")),
            &volume_ref(volume_id),
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self))]
    async fn attach_volume(
        &self,
        volume_id: u64,
        instance_id: u64,
    ) -> Result<RemoteVolume, CloudError> {
        let req = self
            .request(Method::POST, &format!("/volumes/{volume_id}/attach"))
            .json(&AttachBody {
                linode_id: instance_id,
                persist_across_boots: false,
            });
        match self.send_json(req, &volume_ref(volume_id)).await {
            Err(CloudError::Api { status: 400, message })
                if message.to_ascii_lowercase().contains("already attached") =>
            {
                Err(CloudError::AlreadyAttached(volume_id))
            }
            other => other,
        }
    }

    #[instrument(skip(self))]
    async fn detach_volume(&self, volume_id: u64) -> Result<(), CloudError> {
        self.send(
            self.request(Method::POST, &format!("/volumes/{volume_id}/detach")),
            &volume_ref(volume_id),
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self))]
    async fn resize_volume(&self, volume_id: u64, size_gib: u64) -> Result<(), CloudError> {
        self.send(
            self.request(Method::POST, &format!("/volumes/{volume_id}/resize"))
                .json(&json!({ "size": size_gib })),
            &volume_ref(volume_id),
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self))]
    async fn clone_volume(&self, volume_id: u64, label: &str) -> Result<RemoteVolume, CloudError> {
        self.send_json(
            self.request(Method::POST, &format!("/volumes/{volume_id}/clone"))
                .json(&json!({ "label": label })),
            &volume_ref(volume_id),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_instances(&self, opts: &ListOptions) -> Result<Page<Instance>, CloudError> {
        let body: PageBody<InstanceBody> = self
            .send_json(self.list_request("/linode/instances", opts), "instances")
            .await?;
        Ok(Page {
            data: body.data.into_iter().map(Instance::from).collect(),
            page: body.page,
            pages: body.pages,
        })
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: u64) -> Result<Instance, CloudError> {
        let body: InstanceBody = self
            .send_json(
                self.request(Method::GET, &format!("/linode/instances/{instance_id}")),
                &format!("instance {instance_id}"),
            )
            .await?;
        Ok(body.into())
    }
}
