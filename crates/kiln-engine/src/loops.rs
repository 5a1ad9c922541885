//! Owns the two background workers: the scaling worker (scaler tick, then
//! reconciler tick, in sequence so neither observes the other's half-done
//! state) and the GC worker. Tick failures are logged and never crash a
//! worker; shutdown is cooperative and joined under a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_client::{AgentFactory, CiClient};
use kiln_config::Settings;
use kiln_store::ControlStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::gc::HostGc;
use crate::metrics::Metrics;
use crate::reconcile::Reconciler;
use crate::scale::Scaler;

pub struct LoopDriver {
    shutdown_tx: watch::Sender<bool>,
    scaling: JoinHandle<()>,
    gc: JoinHandle<()>,
}

impl LoopDriver {
    pub fn start(
        store: Arc<dyn ControlStore>,
        settings: Arc<Settings>,
        metrics: Arc<Metrics>,
        ci: Arc<dyn CiClient>,
        agents: Arc<dyn AgentFactory>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scaling = {
            let mut scaler = Scaler::new(store.clone(), settings.clone(), metrics.clone());
            let reconciler = Reconciler::new(store.clone(), settings.clone(), metrics.clone());
            let period = Duration::from_secs(settings.loop_interval_sec as u64);
            let mut rx = shutdown_rx.clone();
            let ci = ci.clone();
            let agents = agents.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = scaler.tick(Utc::now(), ci.as_ref(), agents.as_ref()).await {
                        error!(error = %e, "scale tick failed");
                    }
                    if let Err(e) = reconciler.tick(Utc::now(), ci.as_ref(), agents.as_ref()).await
                    {
                        error!(error = %e, "reconcile tick failed");
                    }
                    if wait_or_shutdown(&mut rx, period).await {
                        info!("scaling worker stopped");
                        return;
                    }
                }
            })
        };

        let gc = {
            let gc = HostGc::new(store, settings.clone());
            let period = Duration::from_secs(settings.gc_interval_sec as u64);
            let mut rx = shutdown_rx;
            tokio::spawn(async move {
                loop {
                    if let Err(e) = gc.tick(Utc::now()).await {
                        error!(error = %e, "gc tick failed");
                    }
                    if wait_or_shutdown(&mut rx, period).await {
                        info!("gc worker stopped");
                        return;
                    }
                }
            })
        };

        Self { shutdown_tx, scaling, gc }
    }

    /// Signal both workers and join them, giving in-flight work a bounded
    /// chance to finish. The reconciler's TERMINATING retry covers anything
    /// cut off here.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let join_both = async {
            let _ = self.scaling.await;
            let _ = self.gc.await;
        };
        if tokio::time::timeout(timeout, join_both).await.is_err() {
            error!("workers did not stop within {timeout:?}");
        }
    }
}

/// Sleep for `period`, waking early on shutdown. Returns true when the
/// worker should exit.
async fn wait_or_shutdown(rx: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => *rx.borrow(),
        changed = rx.changed() => changed.is_err() || *rx.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeAgentFactory, FakeCi};
    use kiln_store::InMemoryStore;

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let store: Arc<dyn ControlStore> = Arc::new(InMemoryStore::new());
        let settings = Arc::new(Settings::default());
        let metrics = Arc::new(Metrics::new());
        let ci: Arc<dyn CiClient> = Arc::new(FakeCi::new());
        let (factory, _agent) = FakeAgentFactory::new();
        let agents: Arc<dyn AgentFactory> = Arc::new(factory);

        let driver = LoopDriver::start(store, settings, metrics, ci, agents);
        // both workers have run at least their first tick by the time
        // shutdown resolves
        driver.shutdown(Duration::from_secs(5)).await;
    }
}
