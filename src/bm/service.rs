use crate::bm::child::{ChildHandle, ClusterSlot};
use crate::bm::logs::LogSinks;
use crate::bm::spec::ServiceSpec;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Stopped,
    Launching,
    Online,
    Stopping,
    Errored,
    WaitingRestart,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Launching => "launching",
            ServiceState::Online => "online",
            ServiceState::Stopping => "stopping",
            ServiceState::Errored => "errored",
            ServiceState::WaitingRestart => "waiting-restart",
        }
    }

    /// States in which the entry owns a live OS child.
    pub fn has_child(&self) -> bool {
        matches!(
            self,
            ServiceState::Launching | ServiceState::Online | ServiceState::Stopping
        )
    }

    /// A state the entry can rest in; pending operation replies fire here.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ServiceState::Online | ServiceState::Stopped | ServiceState::Errored
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Latest resource snapshot for one child.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Resident set size in bytes.
    pub rss: u64,
    /// CPU percent over the last sampling window.
    pub cpu: f64,
    /// Open file descriptors; absent on platforms without /proc.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fds: Option<u32>,
    pub ts_ms: i64,
}

/// Why a respawn was requested; decides the restart-counter bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// Operator `restart`: resets the restart counter, re-enables autorestart.
    Operator,
    /// Event-driven (unhealthy, cron, source change, memory cap): counted
    /// against `max_restarts`.
    Auto(&'static str),
}

impl RestartCause {
    pub fn label(&self) -> &'static str {
        match self {
            RestartCause::Operator => "operator",
            RestartCause::Auto(s) => s,
        }
    }
}

/// Handles to the background tasks serving one entry. All of them only post
/// events back to the supervisor inbox.
#[derive(Debug, Default)]
pub struct Timers {
    pub health: Option<JoinHandle<()>>,
    pub cron: Option<JoinHandle<()>>,
    pub watch: Option<JoinHandle<()>>,
    pub restart: Option<JoinHandle<()>>,
    pub kill_escalation: Option<JoinHandle<()>>,
}

impl Timers {
    pub fn cancel_restart(&mut self) {
        if let Some(h) = self.restart.take() {
            h.abort();
        }
    }

    pub fn cancel_kill_escalation(&mut self) {
        if let Some(h) = self.kill_escalation.take() {
            h.abort();
        }
    }

    pub fn cancel_health(&mut self) {
        if let Some(h) = self.health.take() {
            h.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for h in [
            self.health.take(),
            self.cron.take(),
            self.watch.take(),
            self.restart.take(),
            self.kill_escalation.take(),
        ]
        .into_iter()
        .flatten()
        {
            h.abort();
        }
    }
}

/// One supervised service instance: the unit of the registry.
#[derive(Debug)]
pub struct ServiceEntry {
    pub id: u64,
    pub name: String,
    pub namespace: Option<String>,
    pub spec: ServiceSpec,
    pub state: ServiceState,
    pub child: Option<ChildHandle>,
    /// Cluster worker identity; survives respawns so the env contract holds.
    pub slot: Option<ClusterSlot>,
    pub created_at: i64,
    /// ms since epoch of the current child's spawn; 0 when not running.
    pub started_at: i64,
    pub restart_count: u32,
    pub unstable_restarts: u32,
    pub sample: ResourceSample,
    pub health: HealthState,
    pub health_fails: u32,
    /// Bumped on every spawn; events carrying an older epoch are stale.
    pub run_epoch: u64,
    /// Operator stop: disables autorestart until the next start.
    pub stop_requested: bool,
    pub delete_requested: bool,
    /// Armed while a stop is in flight that should be followed by a respawn.
    pub restart_after_stop: Option<RestartCause>,
    pub timers: Timers,
    pub sinks: Option<LogSinks>,
    /// Replies parked until the entry settles (or is removed).
    pub waiters: Vec<oneshot::Sender<()>>,
}

impl ServiceEntry {
    pub fn new(id: u64, spec: ServiceSpec, name: String) -> Self {
        let namespace = spec.namespace.clone();
        Self {
            id,
            name,
            namespace,
            spec,
            state: ServiceState::Stopped,
            child: None,
            slot: None,
            created_at: Utc::now().timestamp_millis(),
            started_at: 0,
            restart_count: 0,
            unstable_restarts: 0,
            sample: ResourceSample::default(),
            health: HealthState::Unknown,
            health_fails: 0,
            run_epoch: 0,
            stop_requested: false,
            delete_requested: false,
            restart_after_stop: None,
            timers: Timers::default(),
            sinks: None,
            waiters: Vec::new(),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.pid)
    }

    pub fn uptime_ms(&self, now_ms: i64) -> i64 {
        if self.state == ServiceState::Online && self.started_at > 0 {
            (now_ms - self.started_at).max(0)
        } else {
            0
        }
    }

    pub fn notify_waiters(&mut self) {
        for w in self.waiters.drain(..) {
            let _ = w.send(());
        }
    }

    /// Wire view of this entry. Field names (`pm_id`, `pm_uptime`, `bm2_env`,
    /// `monit`) are part of the protocol contract.
    pub fn to_process_state(&self) -> ProcessState {
        ProcessState {
            id: self.id,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            status: self.state,
            pid: self.pid(),
            pm_id: self.id,
            monit: Monit {
                memory: self.sample.rss,
                cpu: self.sample.cpu,
                handles: self.sample.fds,
            },
            bm2_env: Bm2Env {
                spec: self.spec.clone(),
                status: self.state,
                pm_uptime: self.started_at,
                restart_time: self.restart_count,
                unstable_restarts: self.unstable_restarts,
                created_at: self.created_at,
                pm_id: self.id,
                health: self.health,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monit {
    pub memory: u64,
    pub cpu: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handles: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm2Env {
    #[serde(flatten)]
    pub spec: ServiceSpec,
    pub status: ServiceState,
    pub pm_uptime: i64,
    pub restart_time: u32,
    pub unstable_restarts: u32,
    pub created_at: i64,
    pub pm_id: u64,
    pub health: HealthState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    pub id: u64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub pm_id: u64,
    pub monit: Monit,
    pub bm2_env: Bm2Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        serde_json::from_str(&format!(r#"{{"name":"{name}","script":"a.js"}}"#)).unwrap()
    }

    #[test]
    fn state_strings_match_wire() {
        assert_eq!(
            serde_json::to_string(&ServiceState::WaitingRestart).unwrap(),
            "\"waiting-restart\""
        );
        assert_eq!(ServiceState::Errored.as_str(), "errored");
    }

    #[test]
    fn child_states() {
        assert!(ServiceState::Online.has_child());
        assert!(ServiceState::Launching.has_child());
        assert!(ServiceState::Stopping.has_child());
        assert!(!ServiceState::WaitingRestart.has_child());
        assert!(!ServiceState::Stopped.has_child());
        assert!(!ServiceState::Errored.has_child());
    }

    #[test]
    fn process_state_wire_fields() {
        let e = ServiceEntry::new(7, spec("api"), "api".to_string());
        let v = serde_json::to_value(e.to_process_state()).unwrap();
        assert_eq!(v["pm_id"], 7);
        assert_eq!(v["id"], 7);
        assert_eq!(v["status"], "stopped");
        assert_eq!(v["bm2_env"]["pm_id"], 7);
        assert_eq!(v["bm2_env"]["restart_time"], 0);
        assert_eq!(v["bm2_env"]["pm_uptime"], 0);
        assert_eq!(v["bm2_env"]["name"], "api");
        assert!(v["monit"]["memory"].is_u64());
    }
}
