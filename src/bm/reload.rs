use crate::bm::child::{parse_signal, pid_alive, signal_tree, ChildHandle};
use crate::bm::error::BmError;
use crate::bm::events::bm_event;
use crate::bm::service::ServiceState;
use crate::bm::spec::ServiceSpec;
use crate::bm::supervisor::SupervisorHandle;
use nix::sys::signal::Signal;
use std::time::Duration;

/// Readiness poll cadence while `wait_ready` is set.
const READY_POLL: Duration = Duration::from_millis(100);
/// Bound on the readiness wait when the service sets no `listen_timeout`.
const DEFAULT_LISTEN_TIMEOUT_MS: u64 = 3000;
/// Poll cadence while waiting for the old child to die.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Rolling zero-downtime reload over `ids`, in sequence:
/// spawn a replacement into the entry (dual-run), wait readiness, tree-kill
/// the displaced child, pause, continue. A failed replacement aborts the
/// remainder; entries already swapped stay on the new version.
pub async fn rolling_reload(handle: &SupervisorHandle, ids: &[u64]) -> Result<(), BmError> {
    let states = handle.describe_ids(ids.to_vec()).await;
    let live: Vec<_> = states
        .iter()
        .filter(|s| s.status == ServiceState::Online)
        .collect();

    for (pos, st) in live.iter().enumerate() {
        let spec = &st.bm2_env.spec;
        let old = handle.spawn_replacement(st.id).await.map_err(|e| {
            bm_event(
                "reload",
                Some(&st.name),
                format!("aborted remaining={} err={e}", live.len() - pos),
            );
            e
        })?;

        wait_ready(handle, st.id, spec).await;
        kill_displaced(&st.name, old, spec).await;

        if pos + 1 < live.len() {
            tokio::time::sleep(Duration::from_millis(spec.reload_delay)).await;
        }
    }
    Ok(())
}

async fn wait_ready(handle: &SupervisorHandle, id: u64, spec: &ServiceSpec) {
    if spec.wait_ready {
        let budget = spec.listen_timeout.unwrap_or(DEFAULT_LISTEN_TIMEOUT_MS);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(budget);
        // On timeout we proceed as if ready.
        while tokio::time::Instant::now() < deadline {
            if handle.entry_state(id).await == Some(ServiceState::Online) {
                return;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    } else {
        tokio::time::sleep(Duration::from_millis(spec.reload_delay)).await;
    }
}

/// Terminate the child displaced by a swap: the coordinator is its sole
/// owner now. Stop signal first, SIGKILL once the kill timeout elapses.
async fn kill_displaced(name: &str, old: ChildHandle, spec: &ServiceSpec) {
    let sig = spec
        .stop_signal
        .as_deref()
        .and_then(|s| parse_signal(s).ok())
        .unwrap_or(Signal::SIGTERM);
    signal_tree(old.pid, sig, spec.treekill);

    let kt = Duration::from_millis(spec.kill_timeout);
    let deadline = tokio::time::Instant::now() + kt;
    while pid_alive(old.pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(EXIT_POLL).await;
    }
    if pid_alive(old.pid) {
        bm_event(
            "reload",
            Some(name),
            format!("kill_timeout old_pid={} escalate=SIGKILL", old.pid),
        );
        signal_tree(old.pid, Signal::SIGKILL, spec.treekill);
    }
}
