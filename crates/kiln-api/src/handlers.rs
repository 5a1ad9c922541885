use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use kiln_domain::{EventDraft, Host, HostId, LeaseId, LeaseState};
use kiln_store::LeaseFilter;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{bearer_token, hash_token, new_session_token, secure_compare_token};
use crate::error::ApiError;
use crate::state::AppState;

const HEARTBEAT_INTERVAL_SEC: u32 = 5;

// ── Health & metrics ──────────────────────────────────────────────────────────

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.metrics.snapshot()))
}

// ── Host registration & heartbeat ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterHostRequest {
    pub agent_version: String,
    pub cpu_total: u32,
    pub ram_total_mb: u64,
    pub addr: String,
    #[serde(default)]
    pub base_image_ids: Vec<String>,
    pub os_family: Option<String>,
    pub os_flavor: Option<String>,
    pub os_version: Option<String>,
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub supported_accels: Vec<String>,
    pub selected_accel: Option<String>,
}

pub async fn register_host(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RegisterHostRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let host_id = HostId::new(host_id);

    let mut host = match state.store.get_host(&host_id).await? {
        Some(host) => host,
        None => {
            if !state.settings.allow_unknown_host_registration {
                return Err(ApiError::not_found("unknown host"));
            }
            let mut host = Host::new(host_id.clone(), req.cpu_total, req.ram_total_mb);
            host.bootstrap_token_hash = Some(hash_token(token));
            host
        }
    };

    if !host.enabled {
        return Err(ApiError::forbidden("host disabled"));
    }
    if !secure_compare_token(token, host.bootstrap_token_hash.as_deref()) {
        return Err(ApiError::unauthorized("invalid bootstrap token"));
    }

    let (session_token, session_expires_at) = new_session_token(1);
    host.session_token_hash = Some(hash_token(&session_token));
    host.session_expires_at = Some(session_expires_at);
    host.cpu_total = req.cpu_total;
    host.cpu_free = req.cpu_total;
    host.ram_total_mb = req.ram_total_mb;
    host.ram_free_mb = req.ram_total_mb;
    host.addr = Some(req.addr);
    host.os_family = req.os_family;
    host.os_flavor = req.os_flavor;
    host.os_version = req.os_version;
    host.cpu_arch = req.cpu_arch;
    host.supported_accels = req.supported_accels;
    host.selected_accel = req.selected_accel;
    host.last_seen = Some(Utc::now());

    state
        .store
        .put_host_with_event(
            &host,
            EventDraft::new(
                "host.registered",
                json!({ "host_id": host.host_id.as_str(), "agent_version": req.agent_version }),
            ),
        )
        .await?;

    Ok(Json(json!({
        "host_id": host.host_id.as_str(),
        "enabled": host.enabled,
        "session_token": session_token,
        "session_expires_at": session_expires_at.to_rfc3339(),
        "heartbeat_interval_sec": HEARTBEAT_INTERVAL_SEC,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub cpu_free: u32,
    pub ram_free_mb: u64,
    pub io_pressure: f64,
    #[serde(default)]
    pub running_vm_ids: Vec<String>,
    pub os_family: Option<String>,
    pub os_flavor: Option<String>,
    pub os_version: Option<String>,
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub supported_accels: Vec<String>,
    pub selected_accel: Option<String>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let host_id = HostId::new(host_id);
    let mut host = state
        .store
        .get_host(&host_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown host"))?;

    if !host.enabled {
        return Err(ApiError::forbidden("host disabled"));
    }
    match host.session_expires_at {
        Some(expiry) if Utc::now() <= expiry => {}
        _ => return Err(ApiError::unauthorized("session expired")),
    }
    if !secure_compare_token(token, host.session_token_hash.as_deref()) {
        return Err(ApiError::unauthorized("invalid session token"));
    }

    if let Some(selected) = &req.selected_accel {
        if !req.supported_accels.is_empty() && !req.supported_accels.contains(selected) {
            return Err(ApiError::bad_request("selected_accel not supported by host"));
        }
    }

    host.cpu_free = req.cpu_free;
    host.ram_free_mb = req.ram_free_mb;
    host.io_pressure = req.io_pressure;
    host.last_seen = Some(Utc::now());
    host.os_family = req.os_family.or(host.os_family);
    host.os_flavor = req.os_flavor.or(host.os_flavor);
    host.os_version = req.os_version.or(host.os_version);
    host.cpu_arch = req.cpu_arch.or(host.cpu_arch);
    host.selected_accel = req.selected_accel.or(host.selected_accel);
    if !req.supported_accels.is_empty() {
        host.supported_accels = req.supported_accels;
    }

    state
        .store
        .put_host_with_event(
            &host,
            EventDraft::new(
                "host.heartbeat",
                json!({ "host_id": host.host_id.as_str(), "running_vm_ids": req.running_vm_ids }),
            ),
        )
        .await?;

    Ok(Json(json!({ "ok": true })))
}

pub async fn disable_host(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let host_id = HostId::new(host_id);
    let mut host = state
        .store
        .get_host(&host_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown host"))?;

    host.enabled = false;
    host.session_token_hash = None;
    host.session_expires_at = None;
    state
        .store
        .put_host_with_event(
            &host,
            EventDraft::new("host.disabled", json!({ "host_id": host.host_id.as_str() })),
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn enable_host(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let host_id = HostId::new(host_id);
    let mut host = state
        .store
        .get_host(&host_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown host"))?;

    host.enabled = true;
    state
        .store
        .put_host_with_event(
            &host,
            EventDraft::new("host.enabled", json!({ "host_id": host.host_id.as_str() })),
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// Operator view of the fleet. Token hashes stay out of the response; the
/// availability column is derived the same way the scaler sees it.
pub async fn get_hosts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let hosts: Vec<Value> = state
        .store
        .list_hosts()
        .await?
        .into_iter()
        .map(|h| {
            json!({
                "host_id": h.host_id.as_str(),
                "enabled": h.enabled,
                "availability": h
                    .availability(now, state.settings.host_stale_timeout_sec)
                    .to_string(),
                "addr": h.addr,
                "os_family": h.os_family,
                "os_flavor": h.os_flavor,
                "cpu_arch": h.cpu_arch,
                "supported_accels": h.supported_accels,
                "selected_accel": h.selected_accel,
                "cpu_total": h.cpu_total,
                "cpu_free": h.cpu_free,
                "ram_total_mb": h.ram_total_mb,
                "ram_free_mb": h.ram_free_mb,
                "io_pressure": h.io_pressure,
                "last_seen": h.last_seen.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    Ok(Json(json!(hosts)))
}

// ── VM status callback ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VmStatusRequest {
    pub state: String,
    pub reason: Option<String>,
}

/// Agent-reported VM state. The report goes through the same compare-and-set
/// as every other transition; a report the matrix rejects leaves the lease
/// untouched but is still recorded for audit.
pub async fn vm_status(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmStatusRequest>,
) -> Result<Json<Value>, ApiError> {
    let lease = state
        .store
        .lease_by_vm_id(&vm_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown vm"))?;
    let reported: LeaseState = req.state.parse()?;

    let event = EventDraft::for_lease(
        &lease.lease_id,
        "vm.status",
        json!({ "vm_id": vm_id, "state": req.state, "reason": req.reason }),
    );
    let applied = state
        .store
        .cas_lease_state(
            &lease.lease_id,
            lease.state,
            reported,
            req.reason.clone(),
            vec![event.clone()],
        )
        .await?;
    if !applied {
        state.store.append_event(event).await?;
    }
    Ok(Json(json!({ "ok": true, "applied": applied })))
}

// ── Leases ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LeaseQuery {
    pub label: Option<String>,
    pub state: Option<String>,
    pub host_id: Option<String>,
}

pub async fn get_leases(
    State(state): State<AppState>,
    Query(query): Query<LeaseQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = LeaseFilter {
        label: query.label,
        state: query.state.as_deref().map(|s| s.parse::<LeaseState>()).transpose()?,
        host_id: query.host_id.map(HostId::new),
    };
    let leases = state.store.list_leases(&filter).await?;
    Ok(Json(json!(leases)))
}

#[derive(Debug, Deserialize)]
pub struct ManualTerminateRequest {
    #[serde(default = "default_terminate_reason")]
    pub reason: String,
}

fn default_terminate_reason() -> String {
    "manual_terminate".to_string()
}

/// Flag a lease for teardown; the reconciler performs the cleanup on its
/// next tick.
pub async fn terminate_lease(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
    Json(req): Json<ManualTerminateRequest>,
) -> Result<Json<Value>, ApiError> {
    let lease_id = LeaseId::new(lease_id);
    let lease = state
        .store
        .get_lease(&lease_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown lease"))?;

    if lease.state != LeaseState::Terminated {
        let event = EventDraft::for_lease(
            &lease_id,
            "lease.manual_terminate",
            json!({ "reason": req.reason }),
        );
        let flagged = state
            .store
            .cas_lease_state(
                &lease_id,
                lease.state,
                LeaseState::Terminating,
                Some(req.reason.clone()),
                vec![event.clone()],
            )
            .await?;
        if !flagged {
            // REQUESTED/PROVISIONING rows route through FAILED, which the
            // reconciler also cleans up.
            state
                .store
                .cas_lease_state(
                    &lease_id,
                    lease.state,
                    LeaseState::Failed,
                    Some(req.reason),
                    vec![event],
                )
                .await?;
        }
    }
    Ok(Json(json!({ "ok": true })))
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub lease_id: Option<String>,
    pub limit: Option<u32>,
}

pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<Value>, ApiError> {
    let lease_id = query.lease_id.map(LeaseId::new);
    let events = state
        .store
        .list_events(lease_id.as_ref(), query.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!(events)))
}
