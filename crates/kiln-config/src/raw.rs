use serde::Deserialize;

/// Raw YAML representation of the settings file. Every field is optional;
/// defaults are applied in the loader so a partial file (or none at all)
/// yields a complete [`crate::Settings`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    pub ci_url: Option<String>,
    pub ci_user: Option<String>,
    pub ci_api_token: Option<String>,

    pub store_path: Option<String>,
    pub bind_addr: Option<String>,

    pub loop_interval_sec: Option<i64>,
    pub gc_interval_sec: Option<i64>,

    pub global_max_vms: Option<usize>,
    pub label_max_inflight: Option<usize>,
    pub label_burst: Option<usize>,

    pub connect_deadline_sec: Option<i64>,
    pub disconnected_grace_sec: Option<i64>,
    pub vm_ttl_sec: Option<i64>,
    pub host_stale_timeout_sec: Option<i64>,

    pub retry_attempts: Option<u32>,
    pub retry_sleep_sec: Option<u64>,
    pub allow_unknown_host_registration: Option<bool>,

    pub agent_url: Option<String>,
    pub agent_auth_token: Option<String>,

    pub base_image_id: Option<String>,
    pub overlay_dir: Option<String>,
}
