use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawSettings;

/// Validated control-plane settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ci_url: String,
    pub ci_user: String,
    pub ci_api_token: String,

    /// Path of the redb database file.
    pub store_path: String,
    pub bind_addr: String,

    /// Scaling/reconcile tick period.
    pub loop_interval_sec: i64,
    /// Stale-host sweep period.
    pub gc_interval_sec: i64,

    /// Absolute cap on active leases.
    pub global_max_vms: usize,
    /// Cap on non-RUNNING active leases per label.
    pub label_max_inflight: usize,
    /// Max launches per label per tick.
    pub label_burst: usize,

    pub connect_deadline_sec: i64,
    pub disconnected_grace_sec: i64,
    pub vm_ttl_sec: i64,
    pub host_stale_timeout_sec: i64,

    pub retry_attempts: u32,
    pub retry_sleep_sec: u64,
    /// Auto-create a host row on first register instead of returning 404.
    pub allow_unknown_host_registration: bool,

    /// Fallback agent URL for hosts that registered without an address.
    pub agent_url: String,
    pub agent_auth_token: Option<String>,

    pub base_image_id: String,
    pub overlay_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ci_url: "http://localhost:8080".to_string(),
            ci_user: "admin".to_string(),
            ci_api_token: "admin".to_string(),
            store_path: "./kiln.redb".to_string(),
            bind_addr: "127.0.0.1:7070".to_string(),
            loop_interval_sec: 5,
            gc_interval_sec: 30,
            global_max_vms: 100,
            label_max_inflight: 5,
            label_burst: 3,
            connect_deadline_sec: 240,
            disconnected_grace_sec: 60,
            vm_ttl_sec: 7200,
            host_stale_timeout_sec: 20,
            retry_attempts: 3,
            retry_sleep_sec: 10,
            allow_unknown_host_registration: false,
            agent_url: "http://localhost:9000".to_string(),
            agent_auth_token: None,
            base_image_id: "default".to_string(),
            overlay_dir: "/var/lib/kiln".to_string(),
        }
    }
}

/// Load settings from an optional YAML file, falling back to defaults for
/// every absent key, and validate ranges.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let raw = match path {
        Some(path) => {
            debug!("loading settings from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_yaml::from_str::<RawSettings>(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?
        }
        None => RawSettings::default(),
    };

    let defaults = Settings::default();
    let settings = Settings {
        ci_url: raw.ci_url.unwrap_or(defaults.ci_url),
        ci_user: raw.ci_user.unwrap_or(defaults.ci_user),
        ci_api_token: raw.ci_api_token.unwrap_or(defaults.ci_api_token),
        store_path: raw.store_path.unwrap_or(defaults.store_path),
        bind_addr: raw.bind_addr.unwrap_or(defaults.bind_addr),
        loop_interval_sec: raw.loop_interval_sec.unwrap_or(defaults.loop_interval_sec),
        gc_interval_sec: raw.gc_interval_sec.unwrap_or(defaults.gc_interval_sec),
        global_max_vms: raw.global_max_vms.unwrap_or(defaults.global_max_vms),
        label_max_inflight: raw.label_max_inflight.unwrap_or(defaults.label_max_inflight),
        label_burst: raw.label_burst.unwrap_or(defaults.label_burst),
        connect_deadline_sec: raw.connect_deadline_sec.unwrap_or(defaults.connect_deadline_sec),
        disconnected_grace_sec: raw
            .disconnected_grace_sec
            .unwrap_or(defaults.disconnected_grace_sec),
        vm_ttl_sec: raw.vm_ttl_sec.unwrap_or(defaults.vm_ttl_sec),
        host_stale_timeout_sec: raw
            .host_stale_timeout_sec
            .unwrap_or(defaults.host_stale_timeout_sec),
        retry_attempts: raw.retry_attempts.unwrap_or(defaults.retry_attempts),
        retry_sleep_sec: raw.retry_sleep_sec.unwrap_or(defaults.retry_sleep_sec),
        allow_unknown_host_registration: raw
            .allow_unknown_host_registration
            .unwrap_or(defaults.allow_unknown_host_registration),
        agent_url: raw.agent_url.unwrap_or(defaults.agent_url),
        agent_auth_token: raw.agent_auth_token,
        base_image_id: raw.base_image_id.unwrap_or(defaults.base_image_id),
        overlay_dir: raw.overlay_dir.unwrap_or(defaults.overlay_dir),
    };

    validate(&settings)?;
    Ok(settings)
}

fn validate(s: &Settings) -> Result<(), ConfigError> {
    fn at_least(key: &'static str, value: i64, min: i64) -> Result<(), ConfigError> {
        if value < min {
            return Err(ConfigError::Invalid {
                key,
                message: format!("{value} is below the minimum of {min}"),
            });
        }
        Ok(())
    }

    at_least("loop_interval_sec", s.loop_interval_sec, 1)?;
    at_least("gc_interval_sec", s.gc_interval_sec, 5)?;
    at_least("global_max_vms", s.global_max_vms as i64, 1)?;
    at_least("label_max_inflight", s.label_max_inflight as i64, 1)?;
    at_least("label_burst", s.label_burst as i64, 1)?;
    at_least("connect_deadline_sec", s.connect_deadline_sec, 5)?;
    at_least("disconnected_grace_sec", s.disconnected_grace_sec, 5)?;
    at_least("vm_ttl_sec", s.vm_ttl_sec, 60)?;
    at_least("host_stale_timeout_sec", s.host_stale_timeout_sec, 5)?;
    at_least("retry_attempts", s.retry_attempts as i64, 1)?;
    at_least("retry_sleep_sec", s.retry_sleep_sec as i64, 1)?;
    Ok(())
}
