use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn new(s: impl Into<String>) -> Self {
        LeaseId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(s: impl Into<String>) -> Self {
        HostId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Lease lifecycle states ────────────────────────────────────────────────────

/// The lifecycle state of a lease. Allowed transitions are defined in
/// [`crate::state_machine`]; the store rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    /// Row written, no external side effects yet.
    Requested,
    /// External node/VM creation in-flight.
    Provisioning,
    /// VM requested on the host; waiting for the inbound agent.
    Booting,
    /// Inbound agent connected to the CI system, idle.
    Connected,
    /// Node is executing a build.
    Running,
    /// VM delete failed; cleanup retried each tick.
    Terminating,
    /// Cleanup confirmed. Terminal.
    Terminated,
    /// Provisioning failed; cleanup still owed.
    Failed,
    /// Lease lost its external counterpart.
    Orphaned,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Requested => "REQUESTED",
            LeaseState::Provisioning => "PROVISIONING",
            LeaseState::Booting => "BOOTING",
            LeaseState::Connected => "CONNECTED",
            LeaseState::Running => "RUNNING",
            LeaseState::Terminating => "TERMINATING",
            LeaseState::Terminated => "TERMINATED",
            LeaseState::Failed => "FAILED",
            LeaseState::Orphaned => "ORPHANED",
        }
    }

    /// Committed capacity: counted against `global_max_vms`.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LeaseState::Provisioning
                | LeaseState::Booting
                | LeaseState::Connected
                | LeaseState::Running
        )
    }

    /// Committed but not yet productive: counted against `label_max_inflight`.
    pub fn is_inflight(&self) -> bool {
        matches!(
            self,
            LeaseState::Provisioning | LeaseState::Booting | LeaseState::Connected
        )
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LeaseState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(LeaseState::Requested),
            "PROVISIONING" => Ok(LeaseState::Provisioning),
            "BOOTING" => Ok(LeaseState::Booting),
            "CONNECTED" => Ok(LeaseState::Connected),
            "RUNNING" => Ok(LeaseState::Running),
            "TERMINATING" => Ok(LeaseState::Terminating),
            "TERMINATED" => Ok(LeaseState::Terminated),
            "FAILED" => Ok(LeaseState::Failed),
            "ORPHANED" => Ok(LeaseState::Orphaned),
            other => Err(DomainError::UnknownLeaseState(other.to_string())),
        }
    }
}

// ── Lease ─────────────────────────────────────────────────────────────────────

/// The reservation of one ephemeral build node for one label on one host.
///
/// `vm_id` and `node_name` are derived from `lease_id` by a stable rule so
/// retries produce the same external names; both are unique across all leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub vm_id: String,
    /// Name of the ephemeral CI node this lease owns.
    pub node_name: String,
    pub label: String,
    pub state: LeaseState,
    /// Assigned at creation; never changes.
    pub host_id: HostId,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The lease must reach CONNECTED by this time or it is reaped.
    pub connect_deadline: DateTime<Utc>,
    /// Hard lifetime cap regardless of state.
    pub ttl_deadline: DateTime<Utc>,
    /// First time the node was observed offline while RUNNING.
    /// Non-null only while the lease is RUNNING.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// The CI build URL that first claimed the node; stable once set.
    pub bound_build_url: Option<String>,
    pub last_error: Option<String>,
}

// ── Host ──────────────────────────────────────────────────────────────────────

/// A registered machine that can run build VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub host_id: HostId,
    pub enabled: bool,
    /// Address of the host's agent, as reported at registration.
    pub addr: Option<String>,

    pub os_family: Option<String>,
    pub os_flavor: Option<String>,
    pub os_version: Option<String>,
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub supported_accels: Vec<String>,
    pub selected_accel: Option<String>,

    pub cpu_total: u32,
    pub cpu_free: u32,
    pub ram_total_mb: u64,
    pub ram_free_mb: u64,
    pub io_pressure: f64,
    pub last_seen: Option<DateTime<Utc>>,

    /// SHA-256 hex digests only; plaintext tokens are never stored.
    pub bootstrap_token_hash: Option<String>,
    pub session_token_hash: Option<String>,
    pub session_expires_at: Option<DateTime<Utc>>,
}

impl Host {
    pub fn new(host_id: HostId, cpu_total: u32, ram_total_mb: u64) -> Self {
        Self {
            host_id,
            enabled: true,
            addr: None,
            os_family: None,
            os_flavor: None,
            os_version: None,
            cpu_arch: None,
            supported_accels: Vec::new(),
            selected_accel: None,
            cpu_total,
            cpu_free: cpu_total,
            ram_total_mb,
            ram_free_mb: ram_total_mb,
            io_pressure: 0.0,
            last_seen: None,
            bootstrap_token_hash: None,
            session_token_hash: None,
            session_expires_at: None,
        }
    }

    pub fn availability(&self, now: DateTime<Utc>, stale_timeout_sec: i64) -> HostAvailability {
        if !self.enabled {
            return HostAvailability::Disabled;
        }
        let Some(last_seen) = self.last_seen else {
            return HostAvailability::Unavailable;
        };
        if now - last_seen > Duration::seconds(stale_timeout_sec) {
            return HostAvailability::Stale;
        }
        HostAvailability::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostAvailability {
    Disabled,
    Unavailable,
    Stale,
    Available,
}

impl std::fmt::Display for HostAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostAvailability::Disabled => "DISABLED",
            HostAvailability::Unavailable => "UNAVAILABLE",
            HostAvailability::Stale => "STALE",
            HostAvailability::Available => "AVAILABLE",
        };
        write!(f, "{}", s)
    }
}

// ── Audit events ──────────────────────────────────────────────────────────────

/// Append-only audit record. Events explaining a mutation are committed in
/// the same store transaction as the mutation itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub lease_id: Option<LeaseId>,
    /// Dotted type string, e.g. `lease.terminated` or `scale.launch`.
    pub event_type: String,
    pub payload: Value,
}

/// An event yet to be assigned an id and timestamp by the store.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: Value,
    pub lease_id: Option<LeaseId>,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            lease_id: None,
        }
    }

    pub fn for_lease(lease_id: &LeaseId, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            lease_id: Some(lease_id.clone()),
        }
    }
}
