use serde_json::Value;

fn cell(value: &Value, key: &str) -> String {
    match &value[key] {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the lease list as fixed-width text.
pub fn render_leases(leases: &Value) -> String {
    let Some(items) = leases.as_array() else {
        return "No leases.\n".to_string();
    };
    if items.is_empty() {
        return "No leases.\n".to_string();
    }
    let mut out = format!(
        "{:<34} {:<13} {:<22} {:<12} {:<16}\n",
        "LEASE", "STATE", "LABEL", "HOST", "NODE"
    );
    for lease in items {
        out.push_str(&format!(
            "{:<34} {:<13} {:<22} {:<12} {:<16}\n",
            cell(lease, "lease_id"),
            cell(lease, "state"),
            cell(lease, "label"),
            cell(lease, "host_id"),
            cell(lease, "node_name"),
        ));
        if let Some(err) = lease["last_error"].as_str() {
            out.push_str(&format!("    last_error: {err}\n"));
        }
    }
    out
}

pub fn render_hosts(hosts: &Value) -> String {
    let Some(items) = hosts.as_array() else {
        return "No hosts.\n".to_string();
    };
    if items.is_empty() {
        return "No hosts.\n".to_string();
    }
    let mut out = format!(
        "{:<14} {:<12} {:<10} {:<9} {:<11} {:<9}\n",
        "HOST", "AVAILABILITY", "CPU", "RAM_MB", "IO", "ACCEL"
    );
    for host in items {
        out.push_str(&format!(
            "{:<14} {:<12} {:<10} {:<9} {:<11} {:<9}\n",
            cell(host, "host_id"),
            cell(host, "availability"),
            format!("{}/{}", cell(host, "cpu_free"), cell(host, "cpu_total")),
            cell(host, "ram_free_mb"),
            cell(host, "io_pressure"),
            cell(host, "selected_accel"),
        ));
    }
    out
}

pub fn render_events(events: &Value) -> String {
    let Some(items) = events.as_array() else {
        return "No events.\n".to_string();
    };
    if items.is_empty() {
        return "No events.\n".to_string();
    }
    let mut out = String::new();
    for event in items {
        out.push_str(&format!(
            "{:>6}  {:<26} {:<34} {}\n",
            cell(event, "id"),
            cell(event, "timestamp"),
            cell(event, "event_type"),
            event["payload"],
        ));
        if let Some(lease_id) = event["lease_id"].as_str() {
            out.push_str(&format!("        lease: {lease_id}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lease_table_includes_error_line() {
        let leases = json!([{
            "lease_id": "abc",
            "state": "TERMINATING",
            "label": "linux-medium",
            "host_id": "h1",
            "node_name": "ephemeral-abc",
            "last_error": "ttl_expired: delete_vm_failed: connection refused",
        }]);
        let rendered = render_leases(&leases);
        assert!(rendered.contains("TERMINATING"));
        assert!(rendered.contains("delete_vm_failed"));
    }

    #[test]
    fn empty_lists_render_placeholders() {
        assert_eq!(render_leases(&json!([])), "No leases.\n");
        assert_eq!(render_hosts(&json!([])), "No hosts.\n");
        assert_eq!(render_events(&json!([])), "No events.\n");
    }
}
