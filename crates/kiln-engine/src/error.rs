use kiln_domain::{HostId, LeaseId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] kiln_store::StoreError),

    #[error("ci client error: {0}")]
    Ci(#[from] kiln_client::ClientError),

    #[error(transparent)]
    Provisioning(#[from] Box<ProvisioningError>),
}

/// Which external step of provisioning failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    CreateNode,
    FetchSecret,
    EnsureVm,
    Commit,
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionStage::CreateNode => "create_node",
            ProvisionStage::FetchSecret => "fetch_secret",
            ProvisionStage::EnsureVm => "ensure_vm",
            ProvisionStage::Commit => "commit",
        };
        write!(f, "{}", s)
    }
}

/// A provisioning attempt that left its lease in FAILED. The scaler logs it
/// and moves on; the reconciler owns the cleanup.
#[derive(Debug, Error)]
#[error("provisioning lease {lease_id} (vm {vm_id}, label '{label}') on host {host_id} failed at {stage}: {detail}")]
pub struct ProvisioningError {
    pub lease_id: LeaseId,
    pub vm_id: String,
    pub host_id: HostId,
    pub label: String,
    pub stage: ProvisionStage,
    pub detail: String,
}
