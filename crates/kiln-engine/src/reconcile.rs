//! Periodic reconcile pass: drives every live lease through its state
//! machine from external probes, enforces the connect/TTL deadlines and the
//! disconnect grace window, and performs cleanup that survives partial
//! failure of the host agent or the CI system.
//!
//! Probe failures are isolated per lease: the lease is skipped this tick and
//! revisited on the next one. Cleanup that fails midway parks the lease in
//! TERMINATING, which step one of the next tick retries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_client::{AgentClient, AgentFactory, CiClient, NodeRuntimeStatus};
use kiln_config::Settings;
use kiln_domain::{EventDraft, Lease, LeaseState};
use kiln_store::{ControlStore, LeaseFilter};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::metrics::Metrics;

pub struct Reconciler {
    store: Arc<dyn ControlStore>,
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ControlStore>, settings: Arc<Settings>, metrics: Arc<Metrics>) -> Self {
        Self { store, settings, metrics }
    }

    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        ci: &dyn CiClient,
        agents: &dyn AgentFactory,
    ) -> Result<(), EngineError> {
        let leases = self.store.list_leases(&LeaseFilter::default()).await?;
        for lease in leases {
            if lease.state == LeaseState::Terminated {
                continue;
            }
            let agent = agents.agent_for(&lease.host_id).await;
            let lease_id = lease.lease_id.clone();
            if let Err(e) = self.reconcile_lease(now, lease, ci, agent.as_ref()).await {
                debug!(lease_id = %lease_id, error = %e, "lease skipped this tick");
            }
        }
        Ok(())
    }

    async fn reconcile_lease(
        &self,
        now: DateTime<Utc>,
        mut lease: Lease,
        ci: &dyn CiClient,
        agent: &dyn AgentClient,
    ) -> Result<(), EngineError> {
        if lease.state == LeaseState::Terminating {
            return self.terminate_lease(&lease, "terminate_retry", ci, agent).await;
        }

        if now > lease.connect_deadline
            && matches!(
                lease.state,
                LeaseState::Requested | LeaseState::Provisioning | LeaseState::Booting
            )
        {
            return self.terminate_lease(&lease, "never_connected", ci, agent).await;
        }

        if now > lease.ttl_deadline {
            return self.terminate_lease(&lease, "ttl_expired", ci, agent).await;
        }

        if !matches!(
            lease.state,
            LeaseState::Booting | LeaseState::Connected | LeaseState::Running
        ) {
            return Ok(());
        }

        let status = ci.node_runtime_status(&lease.node_name).await?;
        self.apply_runtime_transitions(&mut lease, status).await?;
        if lease.state != LeaseState::Running {
            return Ok(());
        }

        // ── RUNNING policies ─────────────────────────────────────────────────

        if !status.connected {
            return self.handle_disconnect(now, &lease, ci, agent).await;
        }

        if let Some(since) = lease.disconnected_at {
            let offline_for = (now - since).num_seconds().max(0);
            let cleared = self
                .store
                .clear_disconnected(
                    &lease.lease_id,
                    EventDraft::for_lease(
                        &lease.lease_id,
                        "lease.disconnected_recovered",
                        json!({ "node": lease.node_name, "offline_for_sec": offline_for }),
                    ),
                )
                .await?;
            if cleared {
                info!(lease_id = %lease.lease_id, offline_for, "node came back inside grace");
                lease.disconnected_at = None;
            }
        }

        let current_url = ci.node_current_build_url(&lease.node_name).await?;
        let bound_url = match (&lease.bound_build_url, &current_url) {
            (None, Some(url)) => {
                let bound = self
                    .store
                    .bind_build_url(
                        &lease.lease_id,
                        url,
                        EventDraft::for_lease(
                            &lease.lease_id,
                            "lease.job_bound",
                            json!({ "node": lease.node_name, "build_url": url }),
                        ),
                    )
                    .await?;
                if !bound {
                    // lost the race to an earlier bind; keep whatever won
                    match self.store.get_lease(&lease.lease_id).await?.and_then(|l| l.bound_build_url) {
                        Some(url) => url,
                        None => return Ok(()),
                    }
                } else {
                    url.clone()
                }
            }
            (None, None) => return Ok(()),
            (Some(bound), Some(current)) if bound != current => {
                warn!(
                    lease_id = %lease.lease_id,
                    bound = %bound,
                    current = %current,
                    "node picked up a build it is not bound to"
                );
                self.store
                    .append_event(EventDraft::for_lease(
                        &lease.lease_id,
                        "lease.unexpected_reuse",
                        json!({
                            "node": lease.node_name,
                            "bound_build_url": bound,
                            "current_build_url": current,
                        }),
                    ))
                    .await?;
                bound.clone()
            }
            (Some(bound), _) => bound.clone(),
        };

        if !status.busy && !ci.is_build_running(&bound_url).await? {
            self.store
                .append_event(EventDraft::for_lease(
                    &lease.lease_id,
                    "lease.job_terminal_detected",
                    json!({ "node": lease.node_name, "build_url": bound_url }),
                ))
                .await?;
            return self.terminate_lease(&lease, "job_terminal", ci, agent).await;
        }

        Ok(())
    }

    /// CAS the lease forward based on the probed runtime status, appending
    /// the matching events in the same transaction.
    async fn apply_runtime_transitions(
        &self,
        lease: &mut Lease,
        status: NodeRuntimeStatus,
    ) -> Result<(), EngineError> {
        let mut target = lease.state;
        let mut events: Vec<EventDraft> = Vec::new();

        if status.connected && target == LeaseState::Booting {
            target = LeaseState::Connected;
            events.push(EventDraft::for_lease(
                &lease.lease_id,
                "lease.connected",
                json!({ "node": lease.node_name }),
            ));
        }

        if status.connected
            && status.busy
            && matches!(target, LeaseState::Booting | LeaseState::Connected)
        {
            if target == LeaseState::Booting {
                events.push(EventDraft::for_lease(
                    &lease.lease_id,
                    "lease.connected",
                    json!({ "node": lease.node_name }),
                ));
            }
            target = LeaseState::Running;
            events.push(EventDraft::for_lease(
                &lease.lease_id,
                "lease.running",
                json!({ "node": lease.node_name }),
            ));
        }

        if target == lease.state {
            return Ok(());
        }

        // A multi-step advance (BOOTING straight to busy) still walks the
        // matrix one CAS at a time.
        let mut current = lease.state;
        if current == LeaseState::Booting && target == LeaseState::Running {
            if self
                .store
                .cas_lease_state(&lease.lease_id, current, LeaseState::Connected, None, vec![])
                .await?
            {
                current = LeaseState::Connected;
            } else {
                return Ok(());
            }
        }
        if self
            .store
            .cas_lease_state(&lease.lease_id, current, target, None, events)
            .await?
        {
            lease.state = target;
        }
        Ok(())
    }

    /// First offline observation stamps the lease; termination only happens
    /// once the grace window has fully elapsed.
    async fn handle_disconnect(
        &self,
        now: DateTime<Utc>,
        lease: &Lease,
        ci: &dyn CiClient,
        agent: &dyn AgentClient,
    ) -> Result<(), EngineError> {
        let Some(since) = lease.disconnected_at else {
            self.store
                .mark_disconnected(
                    &lease.lease_id,
                    now,
                    EventDraft::for_lease(
                        &lease.lease_id,
                        "lease.disconnected_detected",
                        json!({ "node": lease.node_name }),
                    ),
                )
                .await?;
            return Ok(());
        };

        let offline_for = (now - since).num_seconds().max(0);
        if offline_for < self.settings.disconnected_grace_sec {
            return Ok(());
        }

        self.store
            .append_event(EventDraft::for_lease(
                &lease.lease_id,
                "lease.disconnected_grace_expired",
                json!({ "node": lease.node_name, "offline_for_sec": offline_for }),
            ))
            .await?;
        self.terminate_lease(lease, "unexpected_disconnect", ci, agent).await
    }

    /// Tear down a lease: delete the VM, best-effort delete the CI node,
    /// then walk the state machine to TERMINATED. A failed VM delete parks
    /// the lease in TERMINATING for the next tick. Idempotent.
    pub async fn terminate_lease(
        &self,
        lease: &Lease,
        reason: &str,
        ci: &dyn CiClient,
        agent: &dyn AgentClient,
    ) -> Result<(), EngineError> {
        if lease.state == LeaseState::Terminated {
            return Ok(());
        }

        if let Err(e) = agent.delete_vm(&lease.vm_id, reason, false).await {
            let detail = e.to_string();
            let last_error = format!("{reason}: delete_vm_failed: {detail}");
            let retry_event = EventDraft::for_lease(
                &lease.lease_id,
                "lease.terminate_retry",
                json!({ "reason": reason, "error": detail }),
            );
            let parked = self
                .store
                .cas_lease_state(
                    &lease.lease_id,
                    lease.state,
                    LeaseState::Terminating,
                    Some(last_error.clone()),
                    vec![retry_event.clone()],
                )
                .await?;
            if !parked {
                // REQUESTED/PROVISIONING cannot reach TERMINATING directly;
                // FAILED can, so route through it.
                self.store
                    .cas_lease_state(
                        &lease.lease_id,
                        lease.state,
                        LeaseState::Failed,
                        Some(last_error),
                        vec![retry_event],
                    )
                    .await?;
            }
            warn!(lease_id = %lease.lease_id, reason, error = %detail, "vm delete failed, parked for retry");
            return Ok(());
        }

        if let Err(e) = ci.delete_node(&lease.node_name).await {
            // Orphan node definitions are reaped by downstream CI GC.
            debug!(node = %lease.node_name, error = %e, "ci node delete failed");
        }

        let mut current = lease.state;
        if !matches!(
            current,
            LeaseState::Terminating | LeaseState::Failed | LeaseState::Orphaned
        ) {
            if self
                .store
                .cas_lease_state(&lease.lease_id, current, LeaseState::Terminating, None, vec![])
                .await?
            {
                current = LeaseState::Terminating;
            } else if self
                .store
                .cas_lease_state(&lease.lease_id, current, LeaseState::Failed, None, vec![])
                .await?
            {
                current = LeaseState::Failed;
            } else {
                match self.store.get_lease(&lease.lease_id).await? {
                    Some(l) if l.state != LeaseState::Terminated => current = l.state,
                    _ => return Ok(()),
                }
            }
        }

        let done = self
            .store
            .cas_lease_state(
                &lease.lease_id,
                current,
                LeaseState::Terminated,
                None,
                vec![EventDraft::for_lease(
                    &lease.lease_id,
                    "lease.terminated",
                    json!({ "reason": reason }),
                )],
            )
            .await?;
        if done {
            self.metrics.inc("leases_terminated_total");
            info!(lease_id = %lease.lease_id, reason, "lease terminated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{lease_fixture, FakeAgentFactory, FakeCi};
    use chrono::Duration;
    use kiln_domain::LeaseId;
    use kiln_store::InMemoryStore;

    struct Rig {
        store: Arc<InMemoryStore>,
        reconciler: Reconciler,
        ci: FakeCi,
        factory: FakeAgentFactory,
        agent: Arc<crate::testutil::FakeAgent>,
    }

    fn rig() -> Rig {
        rig_with(Settings::default())
    }

    fn rig_with(settings: Settings) -> Rig {
        let store = Arc::new(InMemoryStore::new());
        let reconciler =
            Reconciler::new(store.clone(), Arc::new(settings), Arc::new(Metrics::new()));
        let (factory, agent) = FakeAgentFactory::new();
        Rig { store, reconciler, ci: FakeCi::new(), factory, agent }
    }

    async fn seed(rig: &Rig, lease: &kiln_domain::Lease) {
        rig.store
            .create_lease(lease, EventDraft::new("lease.created", json!({})))
            .await
            .unwrap();
    }

    async fn state_of(rig: &Rig, id: &str) -> LeaseState {
        rig.store
            .get_lease(&LeaseId::new(id))
            .await
            .unwrap()
            .unwrap()
            .state
    }

    async fn event_types(rig: &Rig, id: &str) -> Vec<String> {
        rig.store
            .list_events(Some(&LeaseId::new(id)), 50)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn never_connected_lease_is_reaped_at_deadline() {
        let rig = rig();
        let mut lease = lease_fixture("l1", "linux", LeaseState::Booting);
        lease.connect_deadline = Utc::now() - Duration::seconds(5);
        seed(&rig, &lease).await;

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l1").await, LeaseState::Terminated);
        assert_eq!(rig.agent.deleted.lock().unwrap()[0], ("vm-l1".to_string(), "never_connected".to_string()));
        assert_eq!(rig.ci.deleted_nodes.lock().unwrap()[0], "ephemeral-l1");
        assert!(event_types(&rig, "l1").await.contains(&"lease.terminated".to_string()));
    }

    #[tokio::test]
    async fn ttl_expiry_reaps_running_lease() {
        let rig = rig();
        let mut lease = lease_fixture("l1", "linux", LeaseState::Running);
        lease.ttl_deadline = Utc::now() - Duration::seconds(1);
        seed(&rig, &lease).await;

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l1").await, LeaseState::Terminated);
        assert_eq!(rig.agent.deleted.lock().unwrap()[0].1, "ttl_expired");
    }

    #[tokio::test]
    async fn vm_delete_failure_parks_lease_in_terminating() {
        let rig = rig();
        let mut lease = lease_fixture("l2", "linux", LeaseState::Booting);
        lease.connect_deadline = Utc::now() - Duration::seconds(5);
        seed(&rig, &lease).await;
        rig.agent.fail_delete.store(true, std::sync::atomic::Ordering::SeqCst);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l2").await, LeaseState::Terminating);
        let stored = rig.store.get_lease(&LeaseId::new("l2")).await.unwrap().unwrap();
        assert!(stored.last_error.as_deref().unwrap().contains("delete_vm_failed"));
        assert!(rig.ci.deleted_nodes.lock().unwrap().is_empty(), "ci node kept until vm is gone");

        // next tick with a healthy agent finishes the job
        rig.agent.fail_delete.store(false, std::sync::atomic::Ordering::SeqCst);
        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();
        assert_eq!(state_of(&rig, "l2").await, LeaseState::Terminated);
        assert_eq!(rig.agent.deleted.lock().unwrap()[0].1, "terminate_retry");
    }

    #[tokio::test]
    async fn booting_node_coming_online_connects() {
        let rig = rig();
        seed(&rig, &lease_fixture("l4", "linux", LeaseState::Booting)).await;
        rig.ci.set_status("ephemeral-l4", true, false);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l4").await, LeaseState::Connected);
        assert!(event_types(&rig, "l4").await.contains(&"lease.connected".to_string()));
    }

    #[tokio::test]
    async fn connected_node_going_busy_runs() {
        let rig = rig();
        seed(&rig, &lease_fixture("l5", "linux", LeaseState::Connected)).await;
        rig.ci.set_status("ephemeral-l5", true, true);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l5").await, LeaseState::Running);
    }

    #[tokio::test]
    async fn booting_straight_to_busy_emits_both_events() {
        let rig = rig();
        seed(&rig, &lease_fixture("l6", "linux", LeaseState::Booting)).await;
        rig.ci.set_status("ephemeral-l6", true, true);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l6").await, LeaseState::Running);
        let types = event_types(&rig, "l6").await;
        assert!(types.contains(&"lease.connected".to_string()));
        assert!(types.contains(&"lease.running".to_string()));
    }

    #[tokio::test]
    async fn disconnect_grace_tolerates_a_blip() {
        let rig = rig();
        seed(&rig, &lease_fixture("l7", "linux", LeaseState::Running)).await;
        rig.ci.set_status("ephemeral-l7", false, false);

        let t0 = Utc::now();
        rig.reconciler.tick(t0, &rig.ci, &rig.factory).await.unwrap();

        // first observation only stamps
        assert_eq!(state_of(&rig, "l7").await, LeaseState::Running);
        let stored = rig.store.get_lease(&LeaseId::new("l7")).await.unwrap().unwrap();
        assert!(stored.disconnected_at.is_some());
        assert!(rig.agent.deleted.lock().unwrap().is_empty());

        // still inside the grace window
        rig.reconciler.tick(t0 + Duration::seconds(10), &rig.ci, &rig.factory).await.unwrap();
        assert_eq!(state_of(&rig, "l7").await, LeaseState::Running);

        // grace expired
        rig.reconciler.tick(t0 + Duration::seconds(61), &rig.ci, &rig.factory).await.unwrap();
        assert_eq!(state_of(&rig, "l7").await, LeaseState::Terminated);
        assert_eq!(rig.agent.deleted.lock().unwrap()[0].1, "unexpected_disconnect");
        let types = event_types(&rig, "l7").await;
        assert!(types.contains(&"lease.disconnected_detected".to_string()));
        assert!(types.contains(&"lease.disconnected_grace_expired".to_string()));
    }

    #[tokio::test]
    async fn reconnect_inside_grace_recovers() {
        let rig = rig();
        seed(&rig, &lease_fixture("l8", "linux", LeaseState::Running)).await;
        rig.ci.set_status("ephemeral-l8", false, false);

        let t0 = Utc::now();
        rig.reconciler.tick(t0, &rig.ci, &rig.factory).await.unwrap();

        rig.ci.set_status("ephemeral-l8", true, true);
        rig.ci
            .builds_running
            .lock()
            .unwrap()
            .insert("http://ci/job/x/1/".to_string(), true);
        rig.ci
            .current_builds
            .lock()
            .unwrap()
            .insert("ephemeral-l8".to_string(), "http://ci/job/x/1/".to_string());
        rig.reconciler.tick(t0 + Duration::seconds(10), &rig.ci, &rig.factory).await.unwrap();

        let stored = rig.store.get_lease(&LeaseId::new("l8")).await.unwrap().unwrap();
        assert_eq!(stored.state, LeaseState::Running);
        assert!(stored.disconnected_at.is_none());
        assert!(event_types(&rig, "l8").await.contains(&"lease.disconnected_recovered".to_string()));
    }

    #[tokio::test]
    async fn first_build_url_binds_once() {
        let rig = rig();
        seed(&rig, &lease_fixture("l9", "linux", LeaseState::Running)).await;
        rig.ci.set_status("ephemeral-l9", true, true);
        rig.ci
            .current_builds
            .lock()
            .unwrap()
            .insert("ephemeral-l9".to_string(), "http://ci/job/x/1/".to_string());
        rig.ci
            .builds_running
            .lock()
            .unwrap()
            .insert("http://ci/job/x/1/".to_string(), true);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        let stored = rig.store.get_lease(&LeaseId::new("l9")).await.unwrap().unwrap();
        assert_eq!(stored.bound_build_url.as_deref(), Some("http://ci/job/x/1/"));
        assert!(event_types(&rig, "l9").await.contains(&"lease.job_bound".to_string()));

        // a different build appearing later is flagged, not rebound
        rig.ci
            .current_builds
            .lock()
            .unwrap()
            .insert("ephemeral-l9".to_string(), "http://ci/job/y/9/".to_string());
        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        let stored = rig.store.get_lease(&LeaseId::new("l9")).await.unwrap().unwrap();
        assert_eq!(stored.bound_build_url.as_deref(), Some("http://ci/job/x/1/"));
        assert!(event_types(&rig, "l9").await.contains(&"lease.unexpected_reuse".to_string()));
        assert_eq!(stored.state, LeaseState::Running, "reuse alone never terminates");
    }

    #[tokio::test]
    async fn finished_bound_build_terminates_the_lease() {
        let rig = rig();
        let mut lease = lease_fixture("l10", "linux", LeaseState::Running);
        lease.bound_build_url = Some("http://ci/job/x/1/".to_string());
        seed(&rig, &lease).await;
        rig.ci.set_status("ephemeral-l10", true, false);
        // build absent from builds_running probes as finished

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l10").await, LeaseState::Terminated);
        assert_eq!(rig.agent.deleted.lock().unwrap()[0].1, "job_terminal");
        assert!(event_types(&rig, "l10").await.contains(&"lease.job_terminal_detected".to_string()));
    }

    #[tokio::test]
    async fn busy_node_with_live_build_is_left_alone() {
        let rig = rig();
        let mut lease = lease_fixture("l11", "linux", LeaseState::Running);
        lease.bound_build_url = Some("http://ci/job/x/1/".to_string());
        seed(&rig, &lease).await;
        rig.ci.set_status("ephemeral-l11", true, true);
        rig.ci
            .builds_running
            .lock()
            .unwrap()
            .insert("http://ci/job/x/1/".to_string(), true);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l11").await, LeaseState::Running);
        assert!(rig.agent.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn probe_failure_skips_the_lease_without_state_change() {
        let rig = rig();
        seed(&rig, &lease_fixture("l12", "linux", LeaseState::Booting)).await;
        rig.ci.fail_status.store(true, std::sync::atomic::Ordering::SeqCst);

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l12").await, LeaseState::Booting);
        assert!(rig.agent.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let rig = rig();
        let lease = lease_fixture("l13", "linux", LeaseState::Running);
        seed(&rig, &lease).await;

        rig.reconciler.terminate_lease(&lease, "job_terminal", &rig.ci, rig.agent.as_ref()).await.unwrap();
        let after_first = rig.store.get_lease(&LeaseId::new("l13")).await.unwrap().unwrap();
        rig.reconciler
            .terminate_lease(&after_first, "job_terminal", &rig.ci, rig.agent.as_ref())
            .await
            .unwrap();

        let terminated_events = event_types(&rig, "l13")
            .await
            .into_iter()
            .filter(|t| t == "lease.terminated")
            .count();
        assert_eq!(terminated_events, 1);
        assert_eq!(state_of(&rig, "l13").await, LeaseState::Terminated);
    }

    #[tokio::test]
    async fn failed_lease_cleanup_still_runs() {
        let rig = rig();
        let mut lease = lease_fixture("l14", "linux", LeaseState::Failed);
        lease.ttl_deadline = Utc::now() - Duration::seconds(1);
        seed(&rig, &lease).await;

        rig.reconciler.tick(Utc::now(), &rig.ci, &rig.factory).await.unwrap();

        assert_eq!(state_of(&rig, "l14").await, LeaseState::Terminated);
        assert!(!rig.agent.deleted.lock().unwrap().is_empty());
    }
}
