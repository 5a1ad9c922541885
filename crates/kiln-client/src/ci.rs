//! Client for the CI system that owns the build queue and the ephemeral
//! node definitions.
//!
//! Mutating endpoints are CSRF-protected: a token is fetched lazily per
//! mutation and attached as a header. Queue items do not always name their
//! label directly, so the snapshot falls back to parsing the item's `why`
//! string (both ASCII and curly quotes occur in the wild).

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use regex_lite::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ClientError;
use crate::retry::{send_with_retry, RetryPolicy};

/// One immutable read of the queue per scaler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Queued item count per capability label.
    pub queued_by_label: HashMap<String, u64>,
    /// Queued item count per node, for items pinned to a known node.
    pub queued_by_node: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRuntimeStatus {
    pub connected: bool,
    pub busy: bool,
}

#[async_trait]
pub trait CiClient: Send + Sync {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot, ClientError>;

    /// Create an exclusive single-executor inbound node. Idempotent by name.
    async fn create_ephemeral_node(&self, node_name: &str, label: &str)
        -> Result<(), ClientError>;

    async fn delete_node(&self, node_name: &str) -> Result<(), ClientError>;

    /// Secret the inbound agent presents when connecting as `node_name`.
    async fn inbound_secret(&self, node_name: &str) -> Result<String, ClientError>;

    async fn node_runtime_status(&self, node_name: &str)
        -> Result<NodeRuntimeStatus, ClientError>;

    /// URL of the build currently occupying the node, if any.
    async fn node_current_build_url(&self, node_name: &str)
        -> Result<Option<String>, ClientError>;

    /// Whether the build at `build_url` is still running. A 404 means the
    /// build is gone, i.e. finished.
    async fn is_build_running(&self, build_url: &str) -> Result<bool, ClientError>;
}

// ── Queue item parsing ────────────────────────────────────────────────────────

fn label_why_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"label ['"]([^'"]+)['"]"#).expect("static regex"))
}

fn waiting_node_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"Waiting for next available executor on ['"]([^'"]+)['"]"#)
            .expect("static regex")
    })
}

fn normalize_quotes(s: &str) -> String {
    s.replace('\u{2018}', "'").replace('\u{2019}', "'")
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

/// Label of a queue item, in priority order: `assignedLabel.name`, the
/// task's `labelExpression`, the task's `assignedLabel.name`, then the
/// quoted label inside the item's `why` string.
fn extract_queue_label(item: &Value) -> Option<String> {
    if let Some(name) = non_empty_str(&item["assignedLabel"]["name"]) {
        return Some(name.to_string());
    }
    if let Some(expr) = non_empty_str(&item["task"]["labelExpression"]) {
        return Some(expr.to_string());
    }
    if let Some(name) = non_empty_str(&item["task"]["assignedLabel"]["name"]) {
        return Some(name.to_string());
    }
    if let Some(why) = item["why"].as_str() {
        if why.contains("label") {
            let normalized = normalize_quotes(why);
            if let Some(caps) = label_why_re().captures(&normalized) {
                let label = caps[1].trim();
                if !label.is_empty() {
                    return Some(label.to_string());
                }
            }
        }
    }
    None
}

/// Node name a queue item is pinned to, parsed from its `why` string.
fn extract_waiting_node(item: &Value) -> Option<String> {
    let why = item["why"].as_str()?;
    let normalized = normalize_quotes(why);
    let caps = waiting_node_re().captures(&normalized)?;
    let node = caps[1].trim();
    (!node.is_empty()).then(|| node.to_string())
}

/// Secret embedded as the first `<argument>` of the inbound-agent descriptor.
fn parse_descriptor_secret(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) if e.name().as_ref() == b"argument" => {
                return reader.read_text(e.name()).ok().map(|t| t.into_owned());
            }
            Ok(XmlEvent::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct HttpCiClient {
    base_url: String,
    user: String,
    api_token: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpCiClient {
    pub fn new(base_url: &str, user: &str, api_token: &str, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            api_token: api_token.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            retry,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .basic_auth(&self.user, Some(&self.api_token))
    }

    async fn get_json(&self, url: &str) -> Result<Value, ClientError> {
        let resp = send_with_retry(self.retry, "GET", url, || self.get(url)).await?;
        resp.json::<Value>().await.map_err(|e| ClientError::BadResponse {
            url: url.to_string(),
            message: format!("invalid json body: {e}"),
        })
    }

    /// POST with a lazily fetched CSRF token. Token fetch failures degrade to
    /// an un-tokened request; servers without CSRF protection accept it.
    async fn post_with_csrf_token(
        &self,
        url: &str,
        form: Option<Vec<(String, String)>>,
    ) -> Result<(), ClientError> {
        let token = match self.fetch_csrf_token().await {
            Ok(pair) => Some(pair),
            Err(e) => {
                debug!(error = %e, "csrf token fetch failed, posting without it");
                None
            }
        };

        send_with_retry(self.retry, "POST", url, || {
            let mut req = self
                .client
                .post(url)
                .basic_auth(&self.user, Some(&self.api_token));
            if let Some((field, value)) = &token {
                req = req.header(field.as_str(), value.as_str());
            }
            if let Some(form) = &form {
                req = req.form(form);
            }
            req
        })
        .await?;
        Ok(())
    }

    async fn fetch_csrf_token(&self) -> Result<(String, String), ClientError> {
        let url = format!("{}/crumbIssuer/api/json", self.base_url);
        let payload = self.get_json(&url).await?;
        let field = non_empty_str(&payload["crumbRequestField"]).ok_or_else(|| {
            ClientError::BadResponse {
                url: url.clone(),
                message: "csrf token field missing".to_string(),
            }
        })?;
        let value = non_empty_str(&payload["crumb"]).ok_or_else(|| ClientError::BadResponse {
            url: url.clone(),
            message: "csrf token value missing".to_string(),
        })?;
        Ok((field.to_string(), value.to_string()))
    }

    fn build_api_json_url(build_url: &str) -> String {
        let root = build_url.split('?').next().unwrap_or(build_url);
        let root = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{root}/")
        };
        format!("{root}api/json?tree=building,result")
    }
}

#[async_trait]
impl CiClient for HttpCiClient {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot, ClientError> {
        let url = format!("{}/queue/api/json?depth=2", self.base_url);
        let data = self.get_json(&url).await?;

        let mut snapshot = QueueSnapshot::default();
        if let Some(items) = data["items"].as_array() {
            for item in items {
                if let Some(label) = extract_queue_label(item) {
                    *snapshot.queued_by_label.entry(label).or_insert(0) += 1;
                } else if let Some(node) = extract_waiting_node(item) {
                    *snapshot.queued_by_node.entry(node).or_insert(0) += 1;
                }
            }
        }
        Ok(snapshot)
    }

    async fn create_ephemeral_node(
        &self,
        node_name: &str,
        label: &str,
    ) -> Result<(), ClientError> {
        let url = format!("{}/computer/doCreateItem", self.base_url);
        let node_definition = json!({
            "name": node_name,
            "nodeDescription": "ephemeral vm node",
            "numExecutors": "1",
            "remoteFS": "/home/builder",
            "labelString": label,
            "mode": "EXCLUSIVE",
            "launcher": {
                "stapler-class": "hudson.slaves.JNLPLauncher",
                "$class": "hudson.slaves.JNLPLauncher",
                "webSocket": true,
            },
            "retentionStrategy": {
                "stapler-class": "hudson.slaves.RetentionStrategy$Always",
                "$class": "hudson.slaves.RetentionStrategy$Always",
            },
            "nodeProperties": {"stapler-class-bag": "true"},
        });
        let form = vec![
            ("name".to_string(), node_name.to_string()),
            (
                "type".to_string(),
                "hudson.slaves.DumbSlave$DescriptorImpl".to_string(),
            ),
            ("json".to_string(), node_definition.to_string()),
        ];
        self.post_with_csrf_token(&url, Some(form)).await
    }

    async fn delete_node(&self, node_name: &str) -> Result<(), ClientError> {
        let url = format!("{}/computer/{}/doDelete", self.base_url, node_name);
        self.post_with_csrf_token(&url, None).await
    }

    async fn inbound_secret(&self, node_name: &str) -> Result<String, ClientError> {
        let api_url = format!(
            "{}/computer/{}/api/json?tree=jnlpMac",
            self.base_url, node_name
        );
        if let Ok(payload) = self.get_json(&api_url).await {
            if let Some(secret) = non_empty_str(&payload["jnlpMac"]) {
                return Ok(secret.to_string());
            }
        }

        // Some CI variants do not expose the secret in the JSON API; fall
        // back to the inbound-agent descriptor.
        let url = format!("{}/computer/{}/slave-agent.jnlp", self.base_url, node_name);
        let resp = send_with_retry(self.retry, "GET", &url, || self.get(&url)).await?;
        let text = resp.text().await.map_err(|e| ClientError::BadResponse {
            url: url.clone(),
            message: format!("unreadable body: {e}"),
        })?;
        parse_descriptor_secret(&text).ok_or_else(|| ClientError::BadResponse {
            url,
            message: format!("could not parse inbound secret for node {node_name}"),
        })
    }

    async fn node_runtime_status(
        &self,
        node_name: &str,
    ) -> Result<NodeRuntimeStatus, ClientError> {
        let url = format!(
            "{}/computer/{}/api/json?tree=offline,idle",
            self.base_url, node_name
        );
        let data = self.get_json(&url).await?;
        let connected = data["offline"] == Value::Bool(false);
        let idle = data["idle"] == Value::Bool(true);
        Ok(NodeRuntimeStatus {
            connected,
            busy: connected && !idle,
        })
    }

    async fn node_current_build_url(
        &self,
        node_name: &str,
    ) -> Result<Option<String>, ClientError> {
        let tree = "offline,executors[currentExecutable[url]],oneOffExecutors[currentExecutable[url]]";
        let url = format!(
            "{}/computer/{}/api/json?tree={}",
            self.base_url, node_name, tree
        );
        let data = self.get_json(&url).await?;
        for key in ["executors", "oneOffExecutors"] {
            let Some(entries) = data[key].as_array() else {
                continue;
            };
            for entry in entries {
                if let Some(build_url) = non_empty_str(&entry["currentExecutable"]["url"]) {
                    return Ok(Some(build_url.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn is_build_running(&self, build_url: &str) -> Result<bool, ClientError> {
        let api_url = Self::build_api_json_url(build_url);
        let resp = send_with_retry(self.retry, "GET", &api_url, || self.get(&api_url)).await;
        let payload = match resp {
            Ok(resp) => resp.json::<Value>().await.map_err(|e| ClientError::BadResponse {
                url: api_url.clone(),
                message: format!("invalid json body: {e}"),
            })?,
            Err(e) if e.status_code() == Some(404) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(payload["building"] == Value::Bool(true))
    }
}
