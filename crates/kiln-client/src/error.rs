use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// A request that stayed failed through every retry attempt.
    #[error("{method} {url} failed after {attempts} attempts: {detail}")]
    RequestFailed {
        method: String,
        url: String,
        attempts: u32,
        status_code: Option<u16>,
        detail: String,
        response_text: Option<String>,
    },

    /// 2xx response whose body did not carry what the contract promises.
    #[error("unexpected response from {url}: {message}")]
    BadResponse { url: String, message: String },
}

impl ClientError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::RequestFailed { status_code, .. } => *status_code,
            ClientError::BadResponse { .. } => None,
        }
    }
}
