use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lease not found: {0}")]
    LeaseNotFound(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("lease already exists: {0}")]
    DuplicateLease(String),

    #[error("vm_id already leased: {0}")]
    DuplicateVmId(String),

    #[error("node name already leased: {0}")]
    DuplicateNodeName(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
