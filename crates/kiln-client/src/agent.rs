//! Client for the per-host agent that owns the virtualization runtime, and
//! the factory that resolves one per host from its registered address.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_domain::HostId;
use kiln_store::ControlStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::ClientError;
use crate::retry::{send_with_retry, RetryPolicy};

/// Everything the host agent needs to materialize one build VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEnsureRequest {
    pub vm_id: String,
    pub label: String,
    pub base_image_id: String,
    pub overlay_path: String,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    /// ISO-8601; the agent kills the VM past this point regardless.
    pub lease_expires_at: String,
    pub connect_deadline: String,
    pub ci_url: String,
    pub ci_node_name: String,
    pub inbound_secret: String,
    /// Base64-encoded first-boot payload that starts the inbound agent.
    pub first_boot_b64: String,
    pub metadata: VmMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetadata {
    pub lease_id: String,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Idempotent create-or-confirm of a VM (PUT).
    async fn ensure_vm(&self, vm_id: &str, req: &VmEnsureRequest) -> Result<Value, ClientError>;

    async fn get_vm(&self, vm_id: &str) -> Result<Value, ClientError>;

    async fn delete_vm(&self, vm_id: &str, reason: &str, force: bool)
        -> Result<Value, ClientError>;

    async fn capacity(&self) -> Result<Value, ClientError>;
}

/// Resolves the agent client for a host, from its registered address.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn agent_for(&self, host_id: &HostId) -> Arc<dyn AgentClient>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct HttpAgentClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpAgentClient {
    pub fn new(base_url: &str, auth_token: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            retry,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn json_body(url: &str, resp: reqwest::Response) -> Result<Value, ClientError> {
        resp.json::<Value>().await.map_err(|e| ClientError::BadResponse {
            url: url.to_string(),
            message: format!("invalid json body: {e}"),
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn ensure_vm(&self, vm_id: &str, req: &VmEnsureRequest) -> Result<Value, ClientError> {
        let url = format!("{}/v1/vms/{}", self.base_url, vm_id);
        let resp = send_with_retry(self.retry, "PUT", &url, || {
            self.request(reqwest::Method::PUT, &url).json(req)
        })
        .await?;
        Self::json_body(&url, resp).await
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Value, ClientError> {
        let url = format!("{}/v1/vms/{}", self.base_url, vm_id);
        let resp =
            send_with_retry(self.retry, "GET", &url, || self.request(reqwest::Method::GET, &url))
                .await?;
        Self::json_body(&url, resp).await
    }

    async fn delete_vm(
        &self,
        vm_id: &str,
        reason: &str,
        force: bool,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/v1/vms/{}", self.base_url, vm_id);
        let resp = send_with_retry(self.retry, "DELETE", &url, || {
            self.request(reqwest::Method::DELETE, &url)
                .query(&[("reason", reason), ("force", if force { "true" } else { "false" })])
        })
        .await?;
        Self::json_body(&url, resp).await
    }

    async fn capacity(&self) -> Result<Value, ClientError> {
        let url = format!("{}/v1/capacity", self.base_url);
        let resp =
            send_with_retry(self.retry, "GET", &url, || self.request(reqwest::Method::GET, &url))
                .await?;
        Self::json_body(&url, resp).await
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Builds per-host clients from the host's registered `addr`, falling back
/// to a fixed URL for hosts that never reported one.
pub struct HttpAgentFactory {
    store: Arc<dyn ControlStore>,
    fallback_url: String,
    auth_token: Option<String>,
    retry: RetryPolicy,
}

impl HttpAgentFactory {
    pub fn new(
        store: Arc<dyn ControlStore>,
        fallback_url: &str,
        auth_token: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            fallback_url: fallback_url.to_string(),
            auth_token,
            retry,
        }
    }

    fn normalize_url(&self, raw_addr: Option<&str>) -> String {
        match raw_addr {
            None | Some("") => self.fallback_url.clone(),
            Some(addr) if addr.starts_with("http://") || addr.starts_with("https://") => {
                addr.to_string()
            }
            Some(addr) => format!("http://{addr}"),
        }
    }
}

#[async_trait]
impl AgentFactory for HttpAgentFactory {
    async fn agent_for(&self, host_id: &HostId) -> Arc<dyn AgentClient> {
        let addr = match self.store.get_host(host_id).await {
            Ok(host) => host.and_then(|h| h.addr),
            Err(e) => {
                warn!(host_id = %host_id, error = %e, "host lookup failed, using fallback agent url");
                None
            }
        };
        let base_url = self.normalize_url(addr.as_deref());
        Arc::new(HttpAgentClient::new(
            &base_url,
            self.auth_token.clone(),
            self.retry,
        ))
    }
}
