pub mod agent;
pub mod ci;
pub mod error;
pub mod retry;

pub use agent::{
    AgentClient, AgentFactory, HttpAgentClient, HttpAgentFactory, VmEnsureRequest, VmMetadata,
};
pub use ci::{CiClient, HttpCiClient, NodeRuntimeStatus, QueueSnapshot};
pub use error::ClientError;
pub use retry::RetryPolicy;
