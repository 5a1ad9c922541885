use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_api::{build_app, AppState};
use kiln_client::{AgentFactory, CiClient, HttpAgentFactory, HttpCiClient, RetryPolicy};
use kiln_config::load_settings;
use kiln_engine::{LoopDriver, Metrics};
use kiln_store::{ControlStore, RedbStore};
use serde_json::{json, Value};
use tracing::info;

use crate::output;

// ── Serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(config: Option<PathBuf>) -> Result<()> {
    let settings = Arc::new(load_settings(config.as_deref()).context("loading settings")?);

    let store: Arc<dyn ControlStore> = Arc::new(
        RedbStore::open(std::path::Path::new(&settings.store_path))
            .with_context(|| format!("opening store at {}", settings.store_path))?,
    );
    let metrics = Arc::new(Metrics::new());
    let retry = RetryPolicy::new(settings.retry_attempts, settings.retry_sleep_sec);
    let ci: Arc<dyn CiClient> = Arc::new(HttpCiClient::new(
        &settings.ci_url,
        &settings.ci_user,
        &settings.ci_api_token,
        retry,
    ));
    let agents: Arc<dyn AgentFactory> = Arc::new(HttpAgentFactory::new(
        store.clone(),
        &settings.agent_url,
        settings.agent_auth_token.clone(),
        retry,
    ));

    let driver = LoopDriver::start(
        store.clone(),
        settings.clone(),
        metrics.clone(),
        ci,
        agents,
    );

    let app = build_app(AppState {
        store,
        settings: settings.clone(),
        metrics,
    });
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!("kiln listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("shutting down workers");
    driver.shutdown(Duration::from_secs(15)).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ── Remote read commands ──────────────────────────────────────────────────────

pub async fn leases(
    server: String,
    label: Option<String>,
    state: Option<String>,
    host_id: Option<String>,
) -> Result<()> {
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(label) = label {
        query.push(("label", label));
    }
    if let Some(state) = state {
        query.push(("state", state));
    }
    if let Some(host_id) = host_id {
        query.push(("host_id", host_id));
    }
    let leases: Value = get_json(&server, "/v1/leases", &query).await?;
    print!("{}", output::render_leases(&leases));
    Ok(())
}

pub async fn hosts(server: String) -> Result<()> {
    let hosts: Value = get_json(&server, "/v1/hosts", &[]).await?;
    print!("{}", output::render_hosts(&hosts));
    Ok(())
}

pub async fn events(server: String, lease_id: Option<String>, limit: u32) -> Result<()> {
    let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
    if let Some(lease_id) = lease_id {
        query.push(("lease_id", lease_id));
    }
    let events: Value = get_json(&server, "/v1/events", &query).await?;
    print!("{}", output::render_events(&events));
    Ok(())
}

pub async fn terminate(server: String, lease_id: String, reason: String) -> Result<()> {
    let url = format!("{}/v1/leases/{}/terminate", server.trim_end_matches('/'), lease_id);
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&json!({ "reason": reason }))
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    if !resp.status().is_success() {
        anyhow::bail!("{}: {}", resp.status(), resp.text().await.unwrap_or_default());
    }
    println!("lease {lease_id} flagged for termination ({reason})");
    Ok(())
}

async fn get_json(server: &str, path: &str, query: &[(&str, String)]) -> Result<Value> {
    let url = format!("{}{}", server.trim_end_matches('/'), path);
    let resp = reqwest::Client::new()
        .get(&url)
        .query(query)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !resp.status().is_success() {
        anyhow::bail!("{}: {}", resp.status(), resp.text().await.unwrap_or_default());
    }
    resp.json().await.with_context(|| format!("decoding {url}"))
}
