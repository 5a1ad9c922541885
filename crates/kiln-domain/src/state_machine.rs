use crate::types::LeaseState;

/// Allowed targets for each lease state. TERMINATED is terminal.
///
/// A lease may be torn down from any live state; FAILED is not terminal
/// because cleanup (delete VM, delete CI node) still has to run.
fn allowed_targets(current: LeaseState) -> &'static [LeaseState] {
    use LeaseState::*;
    match current {
        Requested => &[Provisioning, Failed],
        Provisioning => &[Booting, Failed],
        Booting => &[Connected, Terminating, Failed],
        Connected => &[Running, Terminating, Failed],
        Running => &[Terminating, Failed],
        Terminating => &[Terminated, Failed],
        Terminated => &[],
        Failed => &[Terminating, Terminated],
        Orphaned => &[Terminating, Terminated],
    }
}

/// Whether `current → target` is a legal transition. Self-transitions are
/// always allowed and treated as no-ops by callers.
pub fn can_transition(current: LeaseState, target: LeaseState) -> bool {
    if current == target {
        return true;
    }
    allowed_targets(current).contains(&target)
}
