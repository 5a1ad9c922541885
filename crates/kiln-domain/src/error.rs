use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown lease state: {0}")]
    UnknownLeaseState(String),

    #[error("invalid lease id: {0}")]
    InvalidLeaseId(String),
}
