use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_domain::{
    can_transition, Event, EventDraft, Host, HostId, Lease, LeaseId, LeaseState,
};

use crate::error::StoreError;

/// Filter for [`ControlStore::list_leases`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct LeaseFilter {
    pub label: Option<String>,
    pub state: Option<LeaseState>,
    pub host_id: Option<HostId>,
}

impl LeaseFilter {
    pub fn matches(&self, lease: &Lease) -> bool {
        if let Some(label) = &self.label {
            if &lease.label != label {
                return false;
            }
        }
        if let Some(state) = self.state {
            if lease.state != state {
                return false;
            }
        }
        if let Some(host_id) = &self.host_id {
            if &lease.host_id != host_id {
                return false;
            }
        }
        true
    }
}

/// The single owner of persistent control-plane state.
///
/// Every mutation is transactional: the change and the audit events that
/// explain it either both commit or both abort. Lease state changes go
/// through [`ControlStore::cas_lease_state`], which enforces the transition
/// matrix; a failed compare-and-set is a normal `Ok(false)`, not an error.
#[async_trait]
pub trait ControlStore: Send + Sync + 'static {
    // ── Leases ────────────────────────────────────────────────────────────────

    async fn get_lease(&self, id: &LeaseId) -> Result<Option<Lease>, StoreError>;
    async fn lease_by_vm_id(&self, vm_id: &str) -> Result<Option<Lease>, StoreError>;
    async fn lease_by_node_name(&self, node_name: &str) -> Result<Option<Lease>, StoreError>;

    /// All leases matching `filter`, ordered by creation time descending.
    async fn list_leases(&self, filter: &LeaseFilter) -> Result<Vec<Lease>, StoreError>;

    /// Insert a new lease, rejecting duplicate `lease_id`, `vm_id`, or
    /// `node_name`; `event` commits with it.
    async fn create_lease(&self, lease: &Lease, event: EventDraft) -> Result<(), StoreError>;

    /// Compare-and-set the lease state. Returns true iff the stored state
    /// equals `expected` and `expected → target` is a legal transition; on
    /// success the new state, `updated_at`, the optional `last_error`, and
    /// `events` all commit together. Leaving RUNNING clears
    /// `disconnected_at`.
    async fn cas_lease_state(
        &self,
        id: &LeaseId,
        expected: LeaseState,
        target: LeaseState,
        last_error: Option<String>,
        events: Vec<EventDraft>,
    ) -> Result<bool, StoreError>;

    /// Stamp the first offline observation. True only if the lease is
    /// RUNNING and not already stamped.
    async fn mark_disconnected(
        &self,
        id: &LeaseId,
        at: DateTime<Utc>,
        event: EventDraft,
    ) -> Result<bool, StoreError>;

    /// Clear the offline stamp after a recovery. True if it was set.
    async fn clear_disconnected(&self, id: &LeaseId, event: EventDraft)
        -> Result<bool, StoreError>;

    /// Bind the owning build URL. True only if no URL was bound yet; the
    /// binding is never overwritten.
    async fn bind_build_url(
        &self,
        id: &LeaseId,
        url: &str,
        event: EventDraft,
    ) -> Result<bool, StoreError>;

    // ── Events ────────────────────────────────────────────────────────────────

    async fn append_event(&self, event: EventDraft) -> Result<(), StoreError>;

    /// Most recent events first, optionally scoped to one lease.
    async fn list_events(
        &self,
        lease_id: Option<&LeaseId>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError>;

    // ── Hosts ─────────────────────────────────────────────────────────────────

    async fn get_host(&self, id: &HostId) -> Result<Option<Host>, StoreError>;
    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;

    /// Idempotent full-row upsert.
    async fn put_host(&self, host: &Host) -> Result<(), StoreError>;
    async fn put_host_with_event(&self, host: &Host, event: EventDraft)
        -> Result<(), StoreError>;
}

/// Apply the CAS rules to an in-memory lease row. Shared by both store
/// implementations so they cannot drift.
pub(crate) fn apply_cas(
    lease: &mut Lease,
    expected: LeaseState,
    target: LeaseState,
    last_error: Option<String>,
    now: DateTime<Utc>,
) -> bool {
    if lease.state != expected {
        return false;
    }
    if !can_transition(expected, target) {
        return false;
    }
    lease.state = target;
    lease.updated_at = now;
    if let Some(err) = last_error {
        lease.last_error = Some(err);
    }
    if target != LeaseState::Running {
        lease.disconnected_at = None;
    }
    true
}
