use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use kiln_config::Settings;
use kiln_domain::EventDraft;
use kiln_store::ControlStore;
use serde_json::json;

use crate::error::EngineError;

/// Periodic sweep auditing enabled hosts whose heartbeat went quiet.
pub struct HostGc {
    store: Arc<dyn ControlStore>,
    settings: Arc<Settings>,
}

impl HostGc {
    pub fn new(store: Arc<dyn ControlStore>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let cutoff = now - Duration::seconds(self.settings.host_stale_timeout_sec);
        for host in self.store.list_hosts().await? {
            if !host.enabled {
                continue;
            }
            let Some(last_seen) = host.last_seen else {
                continue;
            };
            if last_seen < cutoff {
                self.store
                    .append_event(EventDraft::new(
                        "host.stale",
                        json!({
                            "host_id": host.host_id.as_str(),
                            "last_seen": last_seen.to_rfc3339(),
                        }),
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::schedulable_host;
    use kiln_store::InMemoryStore;

    #[tokio::test]
    async fn stale_enabled_host_is_flagged() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();

        let fresh = schedulable_host("fresh");
        let mut stale = schedulable_host("stale");
        stale.last_seen = Some(now - Duration::seconds(3600));
        let mut disabled = schedulable_host("disabled");
        disabled.enabled = false;
        disabled.last_seen = Some(now - Duration::seconds(3600));
        let mut silent = schedulable_host("silent");
        silent.last_seen = None;

        for host in [&fresh, &stale, &disabled, &silent] {
            store.put_host(host).await.unwrap();
        }

        let gc = HostGc::new(store.clone(), Arc::new(kiln_config::Settings::default()));
        gc.tick(now).await.unwrap();

        let events = store.list_events(None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "host.stale");
        assert_eq!(events[0].payload["host_id"], "stale");
    }
}
