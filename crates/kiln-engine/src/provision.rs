//! Turns a `(label, host)` pair into a lease in BOOTING, creating the
//! ephemeral CI node and the VM exactly once.
//!
//! `vm_id` and the node name are derived from the lease id by a stable rule,
//! so a retry with a preassigned lease id produces the same external names
//! and both external calls stay idempotent.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Duration, Utc};
use kiln_client::{AgentClient, CiClient, VmEnsureRequest, VmMetadata};
use kiln_config::Settings;
use kiln_domain::{
    choose_profile, normalize_node_label, EventDraft, Host, Lease, LeaseId, LeaseState,
};
use kiln_store::ControlStore;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProvisionStage, ProvisioningError};

pub struct Provisioner {
    store: Arc<dyn ControlStore>,
    settings: Arc<Settings>,
}

fn derived_names(lease_id: &LeaseId) -> (String, String) {
    let short: String = lease_id.as_str().chars().take(12).collect();
    (format!("vm-{short}"), format!("ephemeral-{short}"))
}

impl Provisioner {
    pub fn new(store: Arc<dyn ControlStore>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Provision one lease. Passing `lease_id` makes the call an idempotent
    /// retry: a lease already at BOOTING or beyond is returned unchanged,
    /// and a REQUESTED/PROVISIONING row resumes where it left off.
    pub async fn provision_one(
        &self,
        label: &str,
        host: &Host,
        ci: &dyn CiClient,
        agent: &dyn AgentClient,
        lease_id: Option<LeaseId>,
    ) -> Result<LeaseId, Box<ProvisioningError>> {
        let lease_id =
            lease_id.unwrap_or_else(|| LeaseId::new(Uuid::new_v4().simple().to_string()));
        let (vm_id, node_name) = derived_names(&lease_id);
        let host_id = host.host_id.clone();
        let profile = choose_profile(label);

        let fail = |stage: ProvisionStage, detail: String| {
            Box::new(ProvisioningError {
                lease_id: lease_id.clone(),
                vm_id: vm_id.clone(),
                host_id: host_id.clone(),
                label: label.to_string(),
                stage,
                detail,
            })
        };

        // Idempotency probe: anything at BOOTING or beyond already had its
        // external side effects; hand it back untouched.
        let existing = self
            .store
            .get_lease(&lease_id)
            .await
            .map_err(|e| fail(ProvisionStage::Commit, e.to_string()))?;
        match existing.as_ref().map(|l| l.state) {
            None => {
                let now = Utc::now();
                let lease = Lease {
                    lease_id: lease_id.clone(),
                    vm_id: vm_id.clone(),
                    node_name: node_name.clone(),
                    label: label.to_string(),
                    state: LeaseState::Requested,
                    host_id: host_id.clone(),
                    created_at: now,
                    updated_at: now,
                    connect_deadline: now + Duration::seconds(self.settings.connect_deadline_sec),
                    ttl_deadline: now + Duration::seconds(self.settings.vm_ttl_sec),
                    disconnected_at: None,
                    bound_build_url: None,
                    last_error: None,
                };
                self.store
                    .create_lease(
                        &lease,
                        EventDraft::for_lease(
                            &lease_id,
                            "lease.created",
                            json!({ "label": label, "host_id": host_id.as_str() }),
                        ),
                    )
                    .await
                    .map_err(|e| fail(ProvisionStage::Commit, e.to_string()))?;
                self.store
                    .cas_lease_state(
                        &lease_id,
                        LeaseState::Requested,
                        LeaseState::Provisioning,
                        None,
                        vec![],
                    )
                    .await
                    .map_err(|e| fail(ProvisionStage::Commit, e.to_string()))?;
            }
            Some(LeaseState::Requested) => {
                self.store
                    .cas_lease_state(
                        &lease_id,
                        LeaseState::Requested,
                        LeaseState::Provisioning,
                        None,
                        vec![],
                    )
                    .await
                    .map_err(|e| fail(ProvisionStage::Commit, e.to_string()))?;
            }
            Some(LeaseState::Provisioning) => {
                debug!(lease_id = %lease_id, "resuming interrupted provisioning");
            }
            Some(_) => return Ok(lease_id),
        }

        match self
            .materialize(&lease_id, &vm_id, &node_name, label, profile, ci, agent)
            .await
        {
            Ok(()) => Ok(lease_id),
            Err((stage, detail)) => {
                let err = fail(stage, detail.clone());
                if let Err(e) = self
                    .store
                    .cas_lease_state(
                        &lease_id,
                        LeaseState::Provisioning,
                        LeaseState::Failed,
                        Some(detail.clone()),
                        vec![EventDraft::for_lease(
                            &lease_id,
                            "lease.failed",
                            json!({ "error": detail, "stage": stage.to_string() }),
                        )],
                    )
                    .await
                {
                    warn!(lease_id = %lease_id, error = %e, "could not record provisioning failure");
                }
                // Best-effort: reap the half-created CI node.
                if let Err(e) = ci.delete_node(&node_name).await {
                    debug!(node = %node_name, error = %e, "ci node cleanup after failure");
                }
                Err(err)
            }
        }
    }

    /// The external side of provisioning. Returns the failed stage on error
    /// so the caller can mark the lease FAILED with context.
    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        lease_id: &LeaseId,
        vm_id: &str,
        node_name: &str,
        label: &str,
        profile: kiln_domain::Profile,
        ci: &dyn CiClient,
        agent: &dyn AgentClient,
    ) -> Result<(), (ProvisionStage, String)> {
        let node_label = normalize_node_label(label);
        ci.create_ephemeral_node(node_name, &node_label)
            .await
            .map_err(|e| (ProvisionStage::CreateNode, e.to_string()))?;

        let secret = ci
            .inbound_secret(node_name)
            .await
            .map_err(|e| (ProvisionStage::FetchSecret, e.to_string()))?;

        let lease = self
            .store
            .get_lease(lease_id)
            .await
            .map_err(|e| (ProvisionStage::Commit, e.to_string()))?
            .ok_or_else(|| (ProvisionStage::Commit, "lease row vanished".to_string()))?;

        let request = VmEnsureRequest {
            vm_id: vm_id.to_string(),
            label: label.to_string(),
            base_image_id: self.settings.base_image_id.clone(),
            overlay_path: format!("{}/{}.qcow2", self.settings.overlay_dir, vm_id),
            vcpu: profile.vcpu,
            ram_mb: profile.ram_mb,
            disk_gb: profile.disk_gb,
            lease_expires_at: lease.ttl_deadline.to_rfc3339(),
            connect_deadline: lease.connect_deadline.to_rfc3339(),
            ci_url: self.settings.ci_url.clone(),
            ci_node_name: node_name.to_string(),
            inbound_secret: secret.clone(),
            first_boot_b64: first_boot_payload(&self.settings.ci_url, node_name, &secret),
            metadata: VmMetadata { lease_id: lease_id.to_string() },
        };
        agent
            .ensure_vm(vm_id, &request)
            .await
            .map_err(|e| (ProvisionStage::EnsureVm, e.to_string()))?;

        let committed = self
            .store
            .cas_lease_state(
                lease_id,
                LeaseState::Provisioning,
                LeaseState::Booting,
                None,
                vec![EventDraft::for_lease(
                    lease_id,
                    "lease.booting",
                    json!({ "host_id": lease.host_id.as_str() }),
                )],
            )
            .await
            .map_err(|e| (ProvisionStage::Commit, e.to_string()))?;
        if !committed {
            return Err((
                ProvisionStage::Commit,
                "lease left PROVISIONING while ensure_vm was in flight".to_string(),
            ));
        }
        Ok(())
    }
}

/// First-boot payload handed to the host agent: a bootstrap script that
/// starts the inbound agent against the CI system, base64-encoded for
/// transport.
fn first_boot_payload(ci_url: &str, node_name: &str, secret: &str) -> String {
    let script = format!(
        "#!/bin/sh\n\
         exec /usr/local/libexec/inbound-agent \\\n\
         \t-url {ci_url} \\\n\
         \t-name {node_name} \\\n\
         \t-secret {secret} \\\n\
         \t-websocket\n"
    );
    BASE64.encode(script.as_bytes())
}
