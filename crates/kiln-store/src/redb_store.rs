use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_domain::{Event, EventDraft, Host, HostId, Lease, LeaseId, LeaseState};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::error::StoreError;
use crate::store::{apply_cas, ControlStore, LeaseFilter};

const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");
const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
// Secondary indexes enforcing vm_id / node_name uniqueness and serving lookups.
const VM_INDEX: TableDefinition<&str, &str> = TableDefinition::new("lease_vm_index");
const NODE_INDEX: TableDefinition<&str, &str> = TableDefinition::new("lease_node_index");

fn internal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Persistent [`ControlStore`] backed by a redb database file.
///
/// Every mutation runs in a single write transaction, so a lease change and
/// the events explaining it are committed or aborted together.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(internal)?;
            wtxn.open_table(LEASES).map_err(internal)?;
            wtxn.open_table(HOSTS).map_err(internal)?;
            wtxn.open_table(EVENTS).map_err(internal)?;
            wtxn.open_table(META).map_err(internal)?;
            wtxn.open_table(VM_INDEX).map_err(internal)?;
            wtxn.open_table(NODE_INDEX).map_err(internal)?;
            wtxn.commit().map_err(internal)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn push_events(wtxn: &WriteTransaction, drafts: Vec<EventDraft>) -> Result<(), StoreError> {
        if drafts.is_empty() {
            return Ok(());
        }
        let mut meta = wtxn.open_table(META).map_err(internal)?;
        let mut events = wtxn.open_table(EVENTS).map_err(internal)?;
        let mut seq = meta
            .get("event_seq")
            .map_err(internal)?
            .map(|g| g.value())
            .unwrap_or(0);
        for draft in drafts {
            seq += 1;
            let event = Event {
                id: seq,
                timestamp: Utc::now(),
                lease_id: draft.lease_id,
                event_type: draft.event_type,
                payload: draft.payload,
            };
            let bytes = serde_json::to_vec(&event)?;
            events.insert(seq, bytes.as_slice()).map_err(internal)?;
        }
        meta.insert("event_seq", seq).map_err(internal)?;
        Ok(())
    }

    /// Load, mutate, and rewrite one lease inside a single write transaction.
    /// The closure returns the events to append, or `None` to leave the row
    /// untouched (reported as `Ok(false)`).
    fn mutate_lease<F>(&self, id: &LeaseId, mutate: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Lease) -> Option<Vec<EventDraft>>,
    {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let changed = {
            let mut leases = wtxn.open_table(LEASES).map_err(internal)?;
            let bytes = leases
                .get(id.as_str())
                .map_err(internal)?
                .map(|g| g.value().to_vec())
                .ok_or_else(|| StoreError::LeaseNotFound(id.to_string()))?;
            let mut lease: Lease = serde_json::from_slice(&bytes)?;
            match mutate(&mut lease) {
                Some(events) => {
                    let encoded = serde_json::to_vec(&lease)?;
                    leases.insert(id.as_str(), encoded.as_slice()).map_err(internal)?;
                    drop(leases);
                    Self::push_events(&wtxn, events)?;
                    true
                }
                None => false,
            }
        };
        wtxn.commit().map_err(internal)?;
        Ok(changed)
    }

    fn get_lease_sync(&self, id: &LeaseId) -> Result<Option<Lease>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(LEASES).map_err(internal)?;
        match table.get(id.as_str()).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn lease_by_index(
        &self,
        index: TableDefinition<&str, &str>,
        key: &str,
    ) -> Result<Option<Lease>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let idx = rtxn.open_table(index).map_err(internal)?;
        let Some(guard) = idx.get(key).map_err(internal)? else {
            return Ok(None);
        };
        let lease_id = guard.value().to_string();
        drop(guard);
        let table = rtxn.open_table(LEASES).map_err(internal)?;
        match table.get(lease_id.as_str()).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ControlStore for RedbStore {
    async fn get_lease(&self, id: &LeaseId) -> Result<Option<Lease>, StoreError> {
        self.get_lease_sync(id)
    }

    async fn lease_by_vm_id(&self, vm_id: &str) -> Result<Option<Lease>, StoreError> {
        self.lease_by_index(VM_INDEX, vm_id)
    }

    async fn lease_by_node_name(&self, node_name: &str) -> Result<Option<Lease>, StoreError> {
        self.lease_by_index(NODE_INDEX, node_name)
    }

    async fn list_leases(&self, filter: &LeaseFilter) -> Result<Vec<Lease>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(LEASES).map_err(internal)?;
        let mut leases = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            let lease: Lease = serde_json::from_slice(v.value())?;
            if filter.matches(&lease) {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(leases)
    }

    async fn create_lease(&self, lease: &Lease, event: EventDraft) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut leases = wtxn.open_table(LEASES).map_err(internal)?;
            let mut vm_index = wtxn.open_table(VM_INDEX).map_err(internal)?;
            let mut node_index = wtxn.open_table(NODE_INDEX).map_err(internal)?;

            if leases.get(lease.lease_id.as_str()).map_err(internal)?.is_some() {
                return Err(StoreError::DuplicateLease(lease.lease_id.to_string()));
            }
            if vm_index.get(lease.vm_id.as_str()).map_err(internal)?.is_some() {
                return Err(StoreError::DuplicateVmId(lease.vm_id.clone()));
            }
            if node_index.get(lease.node_name.as_str()).map_err(internal)?.is_some() {
                return Err(StoreError::DuplicateNodeName(lease.node_name.clone()));
            }

            let bytes = serde_json::to_vec(lease)?;
            leases
                .insert(lease.lease_id.as_str(), bytes.as_slice())
                .map_err(internal)?;
            vm_index
                .insert(lease.vm_id.as_str(), lease.lease_id.as_str())
                .map_err(internal)?;
            node_index
                .insert(lease.node_name.as_str(), lease.lease_id.as_str())
                .map_err(internal)?;
            drop((leases, vm_index, node_index));
            Self::push_events(&wtxn, vec![event])?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn cas_lease_state(
        &self,
        id: &LeaseId,
        expected: LeaseState,
        target: LeaseState,
        last_error: Option<String>,
        events: Vec<EventDraft>,
    ) -> Result<bool, StoreError> {
        self.mutate_lease(id, |lease| {
            apply_cas(lease, expected, target, last_error, Utc::now()).then_some(events)
        })
    }

    async fn mark_disconnected(
        &self,
        id: &LeaseId,
        at: DateTime<Utc>,
        event: EventDraft,
    ) -> Result<bool, StoreError> {
        self.mutate_lease(id, |lease| {
            if lease.state != LeaseState::Running || lease.disconnected_at.is_some() {
                return None;
            }
            lease.disconnected_at = Some(at);
            lease.updated_at = Utc::now();
            Some(vec![event])
        })
    }

    async fn clear_disconnected(
        &self,
        id: &LeaseId,
        event: EventDraft,
    ) -> Result<bool, StoreError> {
        self.mutate_lease(id, |lease| {
            lease.disconnected_at.take().map(|_| {
                lease.updated_at = Utc::now();
                vec![event]
            })
        })
    }

    async fn bind_build_url(
        &self,
        id: &LeaseId,
        url: &str,
        event: EventDraft,
    ) -> Result<bool, StoreError> {
        self.mutate_lease(id, |lease| {
            if lease.bound_build_url.is_some() {
                return None;
            }
            lease.bound_build_url = Some(url.to_string());
            lease.updated_at = Utc::now();
            Some(vec![event])
        })
    }

    async fn append_event(&self, event: EventDraft) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        Self::push_events(&wtxn, vec![event])?;
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_events(
        &self,
        lease_id: Option<&LeaseId>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(EVENTS).map_err(internal)?;
        let mut events = Vec::new();
        for entry in table.iter().map_err(internal)?.rev() {
            if events.len() >= limit as usize {
                break;
            }
            let (_k, v) = entry.map_err(internal)?;
            let event: Event = serde_json::from_slice(v.value())?;
            if lease_id.map_or(true, |id| event.lease_id.as_ref() == Some(id)) {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn get_host(&self, id: &HostId) -> Result<Option<Host>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(HOSTS).map_err(internal)?;
        match table.get(id.as_str()).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(HOSTS).map_err(internal)?;
        let mut hosts = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            hosts.push(serde_json::from_slice(v.value())?);
        }
        Ok(hosts)
    }

    async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(host)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(HOSTS).map_err(internal)?;
            table
                .insert(host.host_id.as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn put_host_with_event(
        &self,
        host: &Host,
        event: EventDraft,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(host)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(HOSTS).map_err(internal)?;
            table
                .insert(host.host_id.as_str(), bytes.as_slice())
                .map_err(internal)?;
            drop(table);
            Self::push_events(&wtxn, vec![event])?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }
}
