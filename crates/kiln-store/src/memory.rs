use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_domain::{Event, EventDraft, Host, HostId, Lease, LeaseId, LeaseState};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{apply_cas, ControlStore, LeaseFilter};

#[derive(Debug, Default)]
struct Inner {
    leases: HashMap<LeaseId, Lease>,
    hosts: HashMap<HostId, Host>,
    events: Vec<Event>,
    event_seq: u64,
}

impl Inner {
    fn push_event(&mut self, draft: EventDraft) {
        self.event_seq += 1;
        self.events.push(Event {
            id: self.event_seq,
            timestamp: Utc::now(),
            lease_id: draft.lease_id,
            event_type: draft.event_type,
            payload: draft.payload,
        });
    }
}

/// In-memory implementation of [`ControlStore`].
///
/// All data is lost on process exit. Suitable for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlStore for InMemoryStore {
    async fn get_lease(&self, id: &LeaseId) -> Result<Option<Lease>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.leases.get(id).cloned())
    }

    async fn lease_by_vm_id(&self, vm_id: &str) -> Result<Option<Lease>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.leases.values().find(|l| l.vm_id == vm_id).cloned())
    }

    async fn lease_by_node_name(&self, node_name: &str) -> Result<Option<Lease>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.leases.values().find(|l| l.node_name == node_name).cloned())
    }

    async fn list_leases(&self, filter: &LeaseFilter) -> Result<Vec<Lease>, StoreError> {
        let guard = self.inner.read().await;
        let mut leases: Vec<Lease> = guard
            .leases
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        leases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(leases)
    }

    async fn create_lease(&self, lease: &Lease, event: EventDraft) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.leases.contains_key(&lease.lease_id) {
            return Err(StoreError::DuplicateLease(lease.lease_id.to_string()));
        }
        if guard.leases.values().any(|l| l.vm_id == lease.vm_id) {
            return Err(StoreError::DuplicateVmId(lease.vm_id.clone()));
        }
        if guard.leases.values().any(|l| l.node_name == lease.node_name) {
            return Err(StoreError::DuplicateNodeName(lease.node_name.clone()));
        }
        guard.leases.insert(lease.lease_id.clone(), lease.clone());
        guard.push_event(event);
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
        let mut guard = self.inner.write().await;
        let lease = guard
            .leases
            .get_mut(id)
            .ok_or_else(|| StoreError::LeaseNotFound(id.to_string()))?;
        if !apply_cas(lease, expected, target, last_error, Utc::now()) {
            return Ok(false);
        }
        for event in events {
            guard.push_event(event);
        }
        Ok(true)
    }

    async fn mark_disconnected(
        &self,
        id: &LeaseId,
        at: DateTime<Utc>,
        event: EventDraft,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let lease = guard
            .leases
            .get_mut(id)
            .ok_or_else(|| StoreError::LeaseNotFound(id.to_string()))?;
        if lease.state != LeaseState::Running || lease.disconnected_at.is_some() {
            return Ok(false);
        }
        lease.disconnected_at = Some(at);
        lease.updated_at = Utc::now();
        guard.push_event(event);
        Ok(true)
    }

    async fn clear_disconnected(
        &self,
        id: &LeaseId,
        event: EventDraft,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let lease = guard
            .leases
            .get_mut(id)
            .ok_or_else(|| StoreError::LeaseNotFound(id.to_string()))?;
        if lease.disconnected_at.is_none() {
            return Ok(false);
        }
        lease.disconnected_at = None;
        lease.updated_at = Utc::now();
        guard.push_event(event);
        Ok(true)
    }

    async fn bind_build_url(
        &self,
        id: &LeaseId,
        url: &str,
        event: EventDraft,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let lease = guard
            .leases
            .get_mut(id)
            .ok_or_else(|| StoreError::LeaseNotFound(id.to_string()))?;
        if lease.bound_build_url.is_some() {
            return Ok(false);
        }
        lease.bound_build_url = Some(url.to_string());
        lease.updated_at = Utc::now();
        guard.push_event(event);
        Ok(true)
    }

    async fn append_event(&self, event: EventDraft) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.push_event(event);
        Ok(())
    }

    async fn list_events(
        &self,
        lease_id: Option<&LeaseId>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let guard = self.inner.read().await;
        let mut events: Vec<Event> = guard
            .events
            .iter()
            .rev()
            .filter(|ev| lease_id.map_or(true, |id| ev.lease_id.as_ref() == Some(id)))
            .take(limit as usize)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(events)
    }

    async fn get_host(&self, id: &HostId) -> Result<Option<Host>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.hosts.get(id).cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let guard = self.inner.read().await;
        let mut hosts: Vec<Host> = guard.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.host_id.as_str().cmp(b.host_id.as_str()));
        Ok(hosts)
    }

    async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.hosts.insert(host.host_id.clone(), host.clone());
        Ok(())
    }

    async fn put_host_with_event(
        &self,
        host: &Host,
        event: EventDraft,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.hosts.insert(host.host_id.clone(), host.clone());
        guard.push_event(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn lease(id: &str, state: LeaseState) -> Lease {
        let now = Utc::now();
        Lease {
            lease_id: LeaseId::new(id),
            vm_id: format!("vm-{id}"),
            node_name: format!("ephemeral-{id}"),
            label: "linux-medium".to_string(),
            state,
            host_id: HostId::new("h1"),
            created_at: now,
            updated_at: now,
            connect_deadline: now + Duration::seconds(240),
            ttl_deadline: now + Duration::seconds(7200),
            disconnected_at: None,
            bound_build_url: None,
            last_error: None,
        }
    }

    fn created(id: &str) -> EventDraft {
        EventDraft::for_lease(&LeaseId::new(id), "lease.created", json!({}))
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Requested), created("a")).await.unwrap();

        let got = store.get_lease(&LeaseId::new("a")).await.unwrap().unwrap();
        assert_eq!(got.state, LeaseState::Requested);
        assert_eq!(store.list_events(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_vm_id_is_rejected() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Requested), created("a")).await.unwrap();

        let mut dup = lease("b", LeaseState::Requested);
        dup.vm_id = "vm-a".to_string();
        let err = store.create_lease(&dup, created("b")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateVmId(_)));
        // the rejected insert must not leak its event
        assert_eq!(store.list_events(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cas_respects_the_matrix() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Requested), created("a")).await.unwrap();
        let id = LeaseId::new("a");

        // illegal: REQUESTED -> RUNNING
        let ok = store
            .cas_lease_state(&id, LeaseState::Requested, LeaseState::Running, None, vec![])
            .await
            .unwrap();
        assert!(!ok);

        // stale expectation
        let ok = store
            .cas_lease_state(&id, LeaseState::Booting, LeaseState::Connected, None, vec![])
            .await
            .unwrap();
        assert!(!ok);

        let ok = store
            .cas_lease_state(&id, LeaseState::Requested, LeaseState::Provisioning, None, vec![])
            .await
            .unwrap();
        assert!(ok);
        let got = store.get_lease(&id).await.unwrap().unwrap();
        assert_eq!(got.state, LeaseState::Provisioning);
    }

    #[tokio::test]
    async fn failed_cas_appends_no_events() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Requested), created("a")).await.unwrap();
        let id = LeaseId::new("a");

        let ok = store
            .cas_lease_state(
                &id,
                LeaseState::Running,
                LeaseState::Terminating,
                None,
                vec![EventDraft::for_lease(&id, "lease.terminated", json!({}))],
            )
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.list_events(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leaving_running_clears_disconnected_at() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Running), created("a")).await.unwrap();
        let id = LeaseId::new("a");

        let stamped = store
            .mark_disconnected(&id, Utc::now(), EventDraft::for_lease(&id, "lease.disconnected_detected", json!({})))
            .await
            .unwrap();
        assert!(stamped);

        store
            .cas_lease_state(&id, LeaseState::Running, LeaseState::Terminating, None, vec![])
            .await
            .unwrap();
        let got = store.get_lease(&id).await.unwrap().unwrap();
        assert!(got.disconnected_at.is_none());
    }

    #[tokio::test]
    async fn mark_disconnected_requires_running() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Booting), created("a")).await.unwrap();
        let id = LeaseId::new("a");
        let stamped = store
            .mark_disconnected(&id, Utc::now(), EventDraft::new("x", json!({})))
            .await
            .unwrap();
        assert!(!stamped);
    }

    #[tokio::test]
    async fn bind_build_url_is_monotonic() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Running), created("a")).await.unwrap();
        let id = LeaseId::new("a");

        let bound = store
            .bind_build_url(&id, "http://ci/job/x/1/", EventDraft::for_lease(&id, "lease.job_bound", json!({})))
            .await
            .unwrap();
        assert!(bound);

        let rebound = store
            .bind_build_url(&id, "http://ci/job/y/2/", EventDraft::for_lease(&id, "lease.job_bound", json!({})))
            .await
            .unwrap();
        assert!(!rebound);
        let got = store.get_lease(&id).await.unwrap().unwrap();
        assert_eq!(got.bound_build_url.as_deref(), Some("http://ci/job/x/1/"));
    }

    #[tokio::test]
    async fn list_leases_filters_and_orders() {
        let store = InMemoryStore::new();
        let mut a = lease("a", LeaseState::Running);
        a.created_at = Utc::now() - Duration::seconds(60);
        let b = lease("b", LeaseState::Booting);
        store.create_lease(&a, created("a")).await.unwrap();
        store.create_lease(&b, created("b")).await.unwrap();

        let all = store.list_leases(&LeaseFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].lease_id.as_str(), "b", "newest first");

        let running = store
            .list_leases(&LeaseFilter { state: Some(LeaseState::Running), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].lease_id.as_str(), "a");
    }

    #[tokio::test]
    async fn lookup_by_external_names() {
        let store = InMemoryStore::new();
        store.create_lease(&lease("a", LeaseState::Running), created("a")).await.unwrap();

        assert!(store.lease_by_vm_id("vm-a").await.unwrap().is_some());
        assert!(store.lease_by_node_name("ephemeral-a").await.unwrap().is_some());
        assert!(store.lease_by_node_name("ephemeral-zz").await.unwrap().is_none());
    }
}
