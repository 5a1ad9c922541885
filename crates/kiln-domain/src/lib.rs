pub mod error;
pub mod label;
pub mod state_machine;
pub mod types;

pub use error::DomainError;
pub use label::{
    capability_reject_reason, choose_profile, host_meets_capability, label_requirements,
    normalize_node_label, LabelRequirements, Profile,
};
pub use state_machine::can_transition;
pub use types::{
    Event, EventDraft, Host, HostAvailability, HostId, Lease, LeaseId, LeaseState,
};
