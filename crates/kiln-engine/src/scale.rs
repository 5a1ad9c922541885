//! Periodic scale-up pass: observed queue demand becomes new leases, subject
//! to the global cap, per-label caps, per-label burst, and host eligibility.
//!
//! The cooldown and diagnostic-throttle tables live inside the `Scaler`
//! value owned by the loop driver; only the scaling worker touches them.
//! Running two schedulers against one store multiplies launches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use kiln_client::{AgentFactory, CiClient};
use kiln_config::Settings;
use kiln_domain::{capability_reject_reason, choose_profile, Host, HostAvailability};
use kiln_store::{ControlStore, LeaseFilter};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::provision::Provisioner;

const DIAG_THROTTLE_SEC: i64 = 30;

pub struct Scaler {
    store: Arc<dyn ControlStore>,
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
    provisioner: Provisioner,
    cooldowns: HashMap<String, DateTime<Utc>>,
    diag_throttle: HashMap<String, DateTime<Utc>>,
}

impl Scaler {
    pub fn new(store: Arc<dyn ControlStore>, settings: Arc<Settings>, metrics: Arc<Metrics>) -> Self {
        let provisioner = Provisioner::new(store.clone(), settings.clone());
        Self {
            store,
            settings,
            metrics,
            provisioner,
            cooldowns: HashMap::new(),
            diag_throttle: HashMap::new(),
        }
    }

    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        ci: &dyn CiClient,
        agents: &dyn AgentFactory,
    ) -> Result<(), EngineError> {
        let snapshot = ci.queue_snapshot().await?;
        let hosts = self.store.list_hosts().await?;

        let leases = self.store.list_leases(&LeaseFilter::default()).await?;
        let mut inflight_by_label: HashMap<String, usize> = HashMap::new();
        let mut active_global = 0usize;
        for lease in leases.iter().filter(|l| l.state.is_active()) {
            active_global += 1;
            if lease.state.is_inflight() {
                *inflight_by_label.entry(lease.label.clone()).or_insert(0) += 1;
            }
        }

        // Demand reported against a specific node is credited back to the
        // label of the lease owning that node.
        let mut queued_by_label = snapshot.queued_by_label.clone();
        for (node_name, count) in &snapshot.queued_by_node {
            match self.store.lease_by_node_name(node_name).await? {
                Some(lease) => *queued_by_label.entry(lease.label).or_insert(0) += count,
                None => warn!(node = %node_name, "queued work waits on a node no lease owns"),
            }
        }

        if queued_by_label.is_empty() {
            self.metrics.inc("scale_no_queue_labels_total");
        }

        let mut demands: Vec<(String, u64)> = queued_by_label.into_iter().collect();
        demands.sort();

        let mut launched_this_tick = 0usize;
        for (label, queued) in demands {
            if queued == 0 {
                continue;
            }
            if self.cooldowns.get(&label).is_some_and(|until| *until > now) {
                self.metrics.inc("scale_cooldown_skip_total");
                self.throttled_diag_event(
                    now,
                    "scale.cooldown_active",
                    json!({ "label": label, "queued": queued }),
                )
                .await;
                continue;
            }

            let inflight = inflight_by_label.get(&label).copied().unwrap_or(0);
            let deficit = queued as i64 - inflight as i64;
            if deficit <= 0 {
                continue;
            }
            if inflight >= self.settings.label_max_inflight {
                self.metrics.inc("scale_inflight_limit_skip_total");
                self.throttled_diag_event(
                    now,
                    "scale.inflight_limit",
                    json!({
                        "label": label,
                        "queued": queued,
                        "inflight": inflight,
                        "max_inflight": self.settings.label_max_inflight,
                    }),
                )
                .await;
                continue;
            }

            let remaining_global = self
                .settings
                .global_max_vms
                .saturating_sub(active_global + launched_this_tick);
            let launchable = (deficit as usize)
                .min(self.settings.label_burst)
                .min(remaining_global)
                .min(self.settings.label_max_inflight - inflight);
            if launchable == 0 {
                self.metrics.inc("scale_global_limit_skip_total");
                self.throttled_diag_event(
                    now,
                    "scale.global_limit",
                    json!({
                        "label": label,
                        "queued": queued,
                        "deficit": deficit,
                        "remaining_global": remaining_global,
                    }),
                )
                .await;
                continue;
            }

            let (candidates, reject_reasons) = self.eligible_hosts(&label, &hosts, now);
            if candidates.is_empty() {
                self.metrics.inc("scale_no_eligible_hosts_total");
                for (reason, count) in &reject_reasons {
                    self.metrics.inc_by(&format!("scale_reject_{reason}_total"), *count);
                }
                let emitted = self
                    .throttled_diag_event(
                        now,
                        "scale.no_eligible_hosts",
                        json!({
                            "label": label,
                            "queued": queued,
                            "inflight": inflight,
                            "host_count": hosts.len(),
                            "reject_reasons": reject_reasons,
                        }),
                    )
                    .await;
                if emitted {
                    warn!(
                        label = %label,
                        queued,
                        inflight,
                        reasons = ?reject_reasons,
                        "no eligible hosts"
                    );
                }
                continue;
            }

            // The same head host is used for the whole burst; free capacity
            // is reconciled by its next heartbeat.
            for _ in 0..launchable {
                let host = &candidates[0];
                let agent = agents.agent_for(&host.host_id).await;
                match self
                    .provisioner
                    .provision_one(&label, host, ci, agent.as_ref(), None)
                    .await
                {
                    Ok(lease_id) => {
                        self.metrics.inc("launch_attempts_total");
                        launched_this_tick += 1;
                        self.store
                            .append_event(kiln_domain::EventDraft::new(
                                "scale.launch",
                                json!({
                                    "label": label,
                                    "host_id": host.host_id.as_str(),
                                    "lease_id": lease_id.as_str(),
                                }),
                            ))
                            .await?;
                    }
                    Err(e) => {
                        self.metrics.inc("scale_launch_failed_total");
                        self.store
                            .append_event(kiln_domain::EventDraft::new(
                                "scale.launch_failed",
                                json!({
                                    "label": label,
                                    "host_id": host.host_id.as_str(),
                                    "error": e.to_string(),
                                }),
                            ))
                            .await?;
                        error!(label = %label, host_id = %host.host_id, error = %e, "launch failed");
                    }
                }
            }

            // Queue counts lag real state; back off this label for a few
            // ticks instead of over-launching against stale demand.
            self.cooldowns.insert(
                label,
                now + Duration::seconds(self.settings.loop_interval_sec * 3),
            );
        }
        Ok(())
    }

    /// Hosts able to take one VM of this label's profile, best first, plus a
    /// histogram of why the others were rejected.
    fn eligible_hosts(
        &self,
        label: &str,
        hosts: &[Host],
        now: DateTime<Utc>,
    ) -> (Vec<Host>, BTreeMap<&'static str, u64>) {
        let profile = choose_profile(label);
        let mut eligible: Vec<Host> = Vec::new();
        let mut reasons: BTreeMap<&'static str, u64> = BTreeMap::new();

        for host in hosts {
            let reason = match host.availability(now, self.settings.host_stale_timeout_sec) {
                HostAvailability::Disabled => Some("disabled"),
                HostAvailability::Unavailable | HostAvailability::Stale => Some("stale"),
                HostAvailability::Available => capability_reject_reason(host, label)
                    .or_else(|| {
                        if host.cpu_free < profile.vcpu {
                            Some("cpu_insufficient")
                        } else if host.ram_free_mb < profile.ram_mb {
                            Some("ram_insufficient")
                        } else {
                            None
                        }
                    }),
            };
            match reason {
                Some(reason) => *reasons.entry(reason).or_insert(0) += 1,
                None => eligible.push(host.clone()),
            }
        }

        eligible.sort_by(|a, b| {
            a.io_pressure
                .total_cmp(&b.io_pressure)
                .then(b.cpu_free.cmp(&a.cpu_free))
                .then(b.ram_free_mb.cmp(&a.ram_free_mb))
        });
        (eligible, reasons)
    }

    /// Audit one diagnostic event per (type, label) per throttle window.
    async fn throttled_diag_event(
        &mut self,
        now: DateTime<Utc>,
        event_type: &str,
        payload: Value,
    ) -> bool {
        let label = payload
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("_");
        let key = format!("{event_type}:{label}");
        if let Some(last) = self.diag_throttle.get(&key) {
            if now - *last < Duration::seconds(DIAG_THROTTLE_SEC) {
                return false;
            }
        }
        self.diag_throttle.insert(key, now);
        if let Err(e) = self
            .store
            .append_event(kiln_domain::EventDraft::new(event_type, payload))
            .await
        {
            warn!(error = %e, "diagnostic event append failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{lease_fixture, schedulable_host, FakeAgentFactory, FakeCi};
    use kiln_domain::{EventDraft, LeaseState};
    use kiln_store::InMemoryStore;

    async fn seed_host(store: &InMemoryStore, host: &Host) {
        store.put_host(host).await.unwrap();
    }

    fn scaler(store: Arc<InMemoryStore>) -> Scaler {
        let settings = Arc::new(Settings::default());
        Scaler::new(store, settings, Arc::new(Metrics::new()))
    }

    fn scaler_with(store: Arc<InMemoryStore>, settings: Settings) -> Scaler {
        Scaler::new(store, Arc::new(settings), Arc::new(Metrics::new()))
    }

    async fn booting_leases(store: &InMemoryStore) -> Vec<kiln_domain::Lease> {
        store
            .list_leases(&LeaseFilter { state: Some(LeaseState::Booting), ..Default::default() })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn queue_demand_produces_booting_leases() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        let ci = FakeCi::with_queue(&[("linux-medium", 10)]);
        let (factory, agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();

        let booting = booting_leases(&store).await;
        assert!(!booting.is_empty());
        assert!(booting.iter().all(|l| l.label == "linux-medium"));

        let ensured = agent.ensured.lock().unwrap();
        assert_eq!(ensured[0].1.vcpu, 4);
        assert_eq!(ensured[0].1.ram_mb, 8192);
    }

    #[tokio::test]
    async fn burst_caps_launches_per_tick() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        let ci = FakeCi::with_queue(&[("linux-medium", 10)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();
        assert_eq!(booting_leases(&store).await.len(), 3, "label_burst default");
    }

    #[tokio::test]
    async fn inflight_cap_holds_back_new_launches() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        for i in 0..5 {
            store
                .create_lease(
                    &lease_fixture(&format!("l{i}"), "linux-medium", LeaseState::Booting),
                    EventDraft::new("lease.created", json!({})),
                )
                .await
                .unwrap();
        }
        let ci = FakeCi::with_queue(&[("linux-medium", 10)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();
        assert_eq!(booting_leases(&store).await.len(), 5, "no launches past label_max_inflight");
    }

    #[tokio::test]
    async fn inflight_cap_bounds_the_burst_itself() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        for i in 0..4 {
            store
                .create_lease(
                    &lease_fixture(&format!("l{i}"), "linux-medium", LeaseState::Booting),
                    EventDraft::new("lease.created", json!({})),
                )
                .await
                .unwrap();
        }
        let ci = FakeCi::with_queue(&[("linux-medium", 10)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();
        // 4 inflight + at most 1 new keeps the label at its cap of 5
        assert_eq!(booting_leases(&store).await.len(), 5);
    }

    #[tokio::test]
    async fn global_cap_stops_launches() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        for i in 0..3 {
            store
                .create_lease(
                    &lease_fixture(&format!("r{i}"), "other", LeaseState::Running),
                    EventDraft::new("lease.created", json!({})),
                )
                .await
                .unwrap();
        }
        let ci = FakeCi::with_queue(&[("linux-medium", 10)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut settings = Settings::default();
        settings.global_max_vms = 3;
        let mut scaler = scaler_with(store.clone(), settings);

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();
        assert!(booting_leases(&store).await.is_empty());
    }

    #[tokio::test]
    async fn cooldown_suppresses_the_next_tick() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        let ci = FakeCi::with_queue(&[("linux-medium", 10)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        let now = Utc::now();
        scaler.tick(now, &ci, &factory).await.unwrap();
        let after_first = booting_leases(&store).await.len();

        scaler.tick(now + Duration::seconds(5), &ci, &factory).await.unwrap();
        assert_eq!(booting_leases(&store).await.len(), after_first, "cooldown holds");

        // past the cooldown window the label is considered again, but the
        // original demand is now covered by inflight leases
        scaler.tick(now + Duration::seconds(16), &ci, &factory).await.unwrap();
    }

    #[tokio::test]
    async fn no_eligible_host_emits_reasons() {
        let store = Arc::new(InMemoryStore::new());
        let mut host = schedulable_host("h1");
        host.last_seen = Some(Utc::now() - Duration::seconds(3600));
        seed_host(&store, &host).await;
        let ci = FakeCi::with_queue(&[("linux-medium", 2)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();

        assert!(booting_leases(&store).await.is_empty());
        let events = store.list_events(None, 20).await.unwrap();
        let diag = events
            .iter()
            .find(|e| e.event_type == "scale.no_eligible_hosts")
            .expect("diagnostic event");
        assert_eq!(diag.payload["reject_reasons"]["stale"], 1);
        assert_eq!(scaler.metrics.snapshot()["scale_reject_stale_total"], 1);
    }

    #[tokio::test]
    async fn capability_mismatch_is_counted() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await; // kvm/linux host
        let ci = FakeCi::with_queue(&[("dragonflybsd-nvmm", 1)]);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();
        assert!(booting_leases(&store).await.is_empty());
        assert_eq!(scaler.metrics.snapshot()["scale_reject_accel_mismatch_total"], 1);
    }

    #[tokio::test]
    async fn node_wait_demand_is_credited_to_the_lease_label() {
        let store = Arc::new(InMemoryStore::new());
        let mut host = schedulable_host("h1");
        host.selected_accel = Some("nvmm".to_string());
        host.supported_accels = vec!["nvmm".to_string(), "tcg".to_string()];
        host.os_family = Some("bsd".to_string());
        host.os_flavor = Some("dragonflybsd".to_string());
        seed_host(&store, &host).await;

        let mut running = lease_fixture("abc123", "dragonflybsd-nvmm", LeaseState::Running);
        running.node_name = "ephemeral-abc".to_string();
        store
            .create_lease(&running, EventDraft::new("lease.created", json!({})))
            .await
            .unwrap();

        let ci = FakeCi::new();
        ci.snapshot
            .lock()
            .unwrap()
            .queued_by_node
            .insert("ephemeral-abc".to_string(), 1);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();

        let booting = booting_leases(&store).await;
        assert_eq!(booting.len(), 1);
        assert_eq!(booting[0].label, "dragonflybsd-nvmm");
    }

    #[tokio::test]
    async fn launch_failure_is_isolated_and_audited() {
        let store = Arc::new(InMemoryStore::new());
        seed_host(&store, &schedulable_host("h1")).await;
        let ci = FakeCi::with_queue(&[("linux-medium", 1)]);
        ci.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
        let (factory, _agent) = FakeAgentFactory::new();
        let mut scaler = scaler(store.clone());

        scaler.tick(Utc::now(), &ci, &factory).await.unwrap();

        let events = store.list_events(None, 20).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "scale.launch_failed"));
        assert_eq!(scaler.metrics.snapshot()["scale_launch_failed_total"], 1);
        // the failed label still enters cooldown
        assert!(scaler.cooldowns.contains_key("linux-medium"));
    }

    #[tokio::test]
    async fn host_ordering_prefers_low_pressure_then_capacity() {
        let store = Arc::new(InMemoryStore::new());
        let mut busy = schedulable_host("busy");
        busy.io_pressure = 0.9;
        let mut idle = schedulable_host("idle");
        idle.io_pressure = 0.05;
        seed_host(&store, &busy).await;
        seed_host(&store, &idle).await;

        let scaler = scaler(store.clone());
        let (eligible, _) =
            scaler.eligible_hosts("linux-medium", &[busy.clone(), idle.clone()], Utc::now());
        assert_eq!(eligible[0].host_id.as_str(), "idle");
    }
}
