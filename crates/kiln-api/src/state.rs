use std::sync::Arc;

use kiln_config::Settings;
use kiln_engine::Metrics;
use kiln_store::ControlStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ControlStore>,
    pub settings: Arc<Settings>,
    pub metrics: Arc<Metrics>,
}
