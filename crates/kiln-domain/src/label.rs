//! Everything derived from a capability label: the VM profile, the node-label
//! normalization applied before creating an ephemeral CI node, and the
//! accelerator/OS requirements used for host selection.
//!
//! Capability inference is substring-based. Hosts are selected from it, so it
//! is part of the contract; a structured label grammar would replace these
//! functions wholesale.

use crate::types::Host;

// ── VM profiles ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub name: &'static str,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

pub const SMALL: Profile = Profile { name: "small", vcpu: 2, ram_mb: 4096, disk_gb: 40 };
pub const MEDIUM: Profile = Profile { name: "medium", vcpu: 4, ram_mb: 8192, disk_gb: 80 };
pub const LARGE: Profile = Profile { name: "large", vcpu: 8, ram_mb: 16384, disk_gb: 120 };

/// Pick the VM profile for a label by substring rule.
pub fn choose_profile(label: &str) -> Profile {
    if label.contains("large") {
        LARGE
    } else if label.contains("medium") {
        MEDIUM
    } else {
        SMALL
    }
}

// ── Node-label normalization ──────────────────────────────────────────────────

const EXPRESSION_KEYWORDS: [&str; 5] = ["and", "or", "not", "true", "false"];

/// Flatten a label expression into the plain space-separated label string a
/// node is created with: expression operators stripped, keyword tokens
/// dropped, duplicates removed preserving first occurrence. An empty result
/// falls back to the literal `ephemeral`.
pub fn normalize_node_label(label: &str) -> String {
    let stripped: String = label
        .chars()
        .map(|c| match c {
            '&' | '|' | '(' | ')' => ' ',
            other => other,
        })
        .collect();

    let mut seen: Vec<&str> = Vec::new();
    for token in stripped.split_whitespace() {
        if EXPRESSION_KEYWORDS.contains(&token.to_ascii_lowercase().as_str()) {
            continue;
        }
        if !seen.contains(&token) {
            seen.push(token);
        }
    }

    if seen.is_empty() {
        "ephemeral".to_string()
    } else {
        seen.join(" ")
    }
}

// ── Capability requirements ───────────────────────────────────────────────────

/// Accelerator and OS constraints implied by a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LabelRequirements {
    pub accel: Option<&'static str>,
    pub os: Option<&'static str>,
}

pub fn label_requirements(label: &str) -> LabelRequirements {
    let lowered = label.to_ascii_lowercase();

    let accel = if lowered.contains("nvmm") {
        Some("nvmm")
    } else if lowered.contains("kvm") {
        Some("kvm")
    } else {
        None
    };

    let os = if lowered.contains("dragonflybsd") || lowered.contains("dfly") {
        Some("dragonflybsd")
    } else if lowered.contains("linux") {
        Some("linux")
    } else {
        None
    };

    LabelRequirements { accel, os }
}

/// Why a host cannot serve a label, capability-wise. `None` means it fits.
///
/// OS matching accepts either `os_family` or `os_flavor`, since hosts report
/// a coarse family ("bsd") alongside the flavor ("dragonflybsd").
pub fn capability_reject_reason(host: &Host, label: &str) -> Option<&'static str> {
    let reqs = label_requirements(label);

    if let Some(selected) = &host.selected_accel {
        if !host.supported_accels.is_empty() && !host.supported_accels.contains(selected) {
            return Some("accel_invalid");
        }
        if let Some(required) = reqs.accel {
            if selected != required {
                return Some("accel_mismatch");
            }
        }
    }

    if let Some(required) = reqs.os {
        let family = host.os_family.as_deref().map(str::to_ascii_lowercase);
        let flavor = host.os_flavor.as_deref().map(str::to_ascii_lowercase);
        let matches = family.as_deref() == Some(required) || flavor.as_deref() == Some(required);
        if (family.is_some() || flavor.is_some()) && !matches {
            return Some("os_mismatch");
        }
    }

    None
}

pub fn host_meets_capability(host: &Host, label: &str) -> bool {
    capability_reject_reason(host, label).is_none()
}
