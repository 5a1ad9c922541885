use std::collections::BTreeMap;
use std::sync::Mutex;

/// Process-wide counter registry, shared by the engine and the HTTP API.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: &str) {
        self.inc_by(key, 1);
    }

    pub fn inc_by(&self, key: &str, amount: u64) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        *counters.entry(key.to_string()).or_insert(0) += amount;
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().expect("metrics lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let metrics = Metrics::new();
        metrics.inc("leases_terminated_total");
        metrics.inc("leases_terminated_total");
        metrics.inc_by("scale_reject_stale_total", 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["leases_terminated_total"], 2);
        assert_eq!(snapshot["scale_reject_stale_total"], 3);
        assert!(snapshot.get("never_touched").is_none());
    }
}
