//! Shared fakes for engine tests: a scriptable CI system and host agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kiln_client::{
    AgentClient, AgentFactory, CiClient, ClientError, NodeRuntimeStatus, QueueSnapshot,
    VmEnsureRequest,
};
use kiln_domain::{Host, HostId, Lease, LeaseId, LeaseState};
use serde_json::{json, Value};

fn refused(method: &str, url: &str) -> ClientError {
    ClientError::RequestFailed {
        method: method.to_string(),
        url: url.to_string(),
        attempts: 1,
        status_code: None,
        detail: "connection refused".to_string(),
        response_text: None,
    }
}

#[derive(Default)]
pub(crate) struct FakeCi {
    pub snapshot: Mutex<QueueSnapshot>,
    pub statuses: Mutex<HashMap<String, NodeRuntimeStatus>>,
    pub current_builds: Mutex<HashMap<String, String>>,
    pub builds_running: Mutex<HashMap<String, bool>>,
    pub created_nodes: Mutex<Vec<(String, String)>>,
    pub deleted_nodes: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_status: AtomicBool,
}

impl FakeCi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(queued_by_label: &[(&str, u64)]) -> Self {
        let ci = Self::default();
        ci.snapshot.lock().unwrap().queued_by_label =
            queued_by_label.iter().map(|(l, n)| (l.to_string(), *n)).collect();
        ci
    }

    pub fn set_status(&self, node: &str, connected: bool, busy: bool) {
        self.statuses
            .lock()
            .unwrap()
            .insert(node.to_string(), NodeRuntimeStatus { connected, busy });
    }
}

#[async_trait]
impl CiClient for FakeCi {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot, ClientError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn create_ephemeral_node(
        &self,
        node_name: &str,
        label: &str,
    ) -> Result<(), ClientError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(refused("POST", "/computer/doCreateItem"));
        }
        self.created_nodes
            .lock()
            .unwrap()
            .push((node_name.to_string(), label.to_string()));
        Ok(())
    }

    async fn delete_node(&self, node_name: &str) -> Result<(), ClientError> {
        self.deleted_nodes.lock().unwrap().push(node_name.to_string());
        Ok(())
    }

    async fn inbound_secret(&self, _node_name: &str) -> Result<String, ClientError> {
        Ok("s3cret".to_string())
    }

    async fn node_runtime_status(
        &self,
        node_name: &str,
    ) -> Result<NodeRuntimeStatus, ClientError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(refused("GET", "/computer"));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(node_name)
            .copied()
            .unwrap_or(NodeRuntimeStatus { connected: false, busy: false }))
    }

    async fn node_current_build_url(
        &self,
        node_name: &str,
    ) -> Result<Option<String>, ClientError> {
        Ok(self.current_builds.lock().unwrap().get(node_name).cloned())
    }

    async fn is_build_running(&self, build_url: &str) -> Result<bool, ClientError> {
        // absent means the build is gone, which probes as finished
        Ok(self
            .builds_running
            .lock()
            .unwrap()
            .get(build_url)
            .copied()
            .unwrap_or(false))
    }
}

#[derive(Default)]
pub(crate) struct FakeAgent {
    pub ensured: Mutex<Vec<(String, VmEnsureRequest)>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub fail_ensure: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn ensure_vm(&self, vm_id: &str, req: &VmEnsureRequest) -> Result<Value, ClientError> {
        if self.fail_ensure.load(Ordering::SeqCst) {
            return Err(ClientError::RequestFailed {
                method: "PUT".to_string(),
                url: format!("/v1/vms/{vm_id}"),
                attempts: 3,
                status_code: Some(503),
                detail: "agent down".to_string(),
                response_text: None,
            });
        }
        self.ensured.lock().unwrap().push((vm_id.to_string(), req.clone()));
        Ok(json!({ "status": "BOOTING" }))
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Value, ClientError> {
        Ok(json!({ "vm_id": vm_id }))
    }

    async fn delete_vm(
        &self,
        vm_id: &str,
        reason: &str,
        _force: bool,
    ) -> Result<Value, ClientError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(refused("DELETE", &format!("/v1/vms/{vm_id}")));
        }
        self.deleted.lock().unwrap().push((vm_id.to_string(), reason.to_string()));
        Ok(json!({ "ok": true }))
    }

    async fn capacity(&self) -> Result<Value, ClientError> {
        Ok(json!({ "cpu_free": 16 }))
    }
}

pub(crate) struct FakeAgentFactory {
    pub agent: Arc<FakeAgent>,
}

impl FakeAgentFactory {
    pub fn new() -> (Self, Arc<FakeAgent>) {
        let agent = Arc::new(FakeAgent::new());
        (Self { agent: agent.clone() }, agent)
    }
}

#[async_trait]
impl AgentFactory for FakeAgentFactory {
    async fn agent_for(&self, _host_id: &HostId) -> Arc<dyn AgentClient> {
        self.agent.clone()
    }
}

// ── Fixture builders ──────────────────────────────────────────────────────────

pub(crate) fn schedulable_host(id: &str) -> Host {
    let mut host = Host::new(HostId::new(id), 16, 32768);
    host.io_pressure = 0.1;
    host.last_seen = Some(Utc::now());
    host.selected_accel = Some("kvm".to_string());
    host.supported_accels = vec!["kvm".to_string(), "tcg".to_string()];
    host.os_family = Some("linux".to_string());
    host
}

pub(crate) fn lease_fixture(id: &str, label: &str, state: LeaseState) -> Lease {
    let now = Utc::now();
    Lease {
        lease_id: LeaseId::new(id),
        vm_id: format!("vm-{id}"),
        node_name: format!("ephemeral-{id}"),
        label: label.to_string(),
        state,
        host_id: HostId::new("h1"),
        created_at: now,
        updated_at: now,
        connect_deadline: now + Duration::seconds(240),
        ttl_deadline: now + Duration::seconds(7200),
        disconnected_at: None,
        bound_build_url: None,
        last_error: None,
    }
}
