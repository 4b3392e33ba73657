use crate::bm::asyncutil::tasks;
use crate::bm::child::{
    self, parse_signal, pid_alive, signal_tree, ChildHandle, ClusterSlot, ExitNotice,
};
use crate::bm::cron;
use crate::bm::error::BmError;
use crate::bm::events::bm_event;
use crate::bm::health::{self, ProbeReport};
use crate::bm::logs::LogSinks;
use crate::bm::monitor::OnlineProc;
use crate::bm::paths::BmHome;
use crate::bm::persist;
use crate::bm::registry::Registry;
use crate::bm::service::{
    HealthState, ProcessState, ResourceSample, RestartCause, ServiceEntry, ServiceState,
};
use crate::bm::spec::{ExecMode, ServiceSpec};
use crate::bm::watcher;
use chrono::Utc;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Operator-facing operations, submitted through the inbox.
#[derive(Debug)]
pub enum Command {
    Start { spec: ServiceSpec },
    Ecosystem { apps: Vec<ServiceSpec> },
    Stop { target: String },
    Restart { target: String },
    Delete { target: String },
    Scale { target: String, count: u32 },
    Signal { target: String, signal: String },
    Reset { target: String },
    List,
    Describe { target: String },
    LogTargets { target: String },
    Flush { target: Option<String> },
    Save,
    Resurrect,
}

/// Log file locations of one entry, for disk-side readers.
#[derive(Debug, Clone)]
pub struct LogTarget {
    pub name: String,
    pub id: u64,
    pub out: PathBuf,
    pub err: PathBuf,
}

#[derive(Debug)]
pub enum Payload {
    States(Vec<ProcessState>),
    LogTargets(Vec<LogTarget>),
    Ack,
}

impl Payload {
    pub fn into_states(self) -> Vec<ProcessState> {
        match self {
            Payload::States(s) => s,
            _ => vec![],
        }
    }
}

type Reply = oneshot::Sender<Result<Payload, BmError>>;

/// The inbox: every registry mutation flows through exactly one of these.
#[derive(Debug)]
pub enum Event {
    Command { cmd: Command, reply: Reply },
    ChildExited(ExitNotice),
    RestartTimerFired { id: u64, epoch: u64 },
    KillEscalate { id: u64, epoch: u64, hard: bool },
    SampleTaken { id: u64, sample: ResourceSample },
    MemoryExceeded { id: u64, rss: u64 },
    HealthReport { id: u64, health: HealthState, fails: u32 },
    Unhealthy { id: u64 },
    CronFired { id: u64 },
    SourceChanged { id: u64 },
    OnlinePids { reply: oneshot::Sender<Vec<OnlineProc>> },
    SpawnReplacement { id: u64, reply: oneshot::Sender<Result<ChildHandle, BmError>> },
    EntryState { id: u64, reply: oneshot::Sender<Option<ServiceState>> },
    DescribeIds { ids: Vec<u64>, reply: oneshot::Sender<Vec<ProcessState>> },
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl SupervisorHandle {
    pub async fn command(&self, cmd: Command) -> Result<Payload, BmError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Event::Command { cmd, reply: tx })
            .map_err(|_| BmError::Internal("supervisor is gone".into()))?;
        rx.await
            .map_err(|_| BmError::Internal("supervisor dropped the reply".into()))?
    }

    pub fn post(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Fire-and-collect snapshot used by the monitor loop.
    pub fn request_online(&self) -> oneshot::Receiver<Vec<OnlineProc>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(Event::OnlinePids { reply: tx });
        rx
    }

    pub async fn entry_state(&self, id: u64) -> Option<ServiceState> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Event::EntryState { id, reply: tx }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn spawn_replacement(&self, id: u64) -> Result<ChildHandle, BmError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Event::SpawnReplacement { id, reply: tx })
            .map_err(|_| BmError::Internal("supervisor is gone".into()))?;
        rx.await
            .map_err(|_| BmError::Internal("supervisor dropped the reply".into()))?
    }

    pub async fn describe_ids(&self, ids: Vec<u64>) -> Vec<ProcessState> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::DescribeIds { ids, reply: tx }).is_err() {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful stop of every entry; resolves when all children are down.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the supervision engine: one worker task owning the registry.
pub fn start(home: BmHome) -> SupervisorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let sup = Supervisor {
        home,
        reg: Registry::new(),
        tx: tx.clone(),
    };
    tasks().spawn(sup.run(rx));
    SupervisorHandle { tx }
}

struct Supervisor {
    home: BmHome,
    reg: Registry,
    tx: mpsc::UnboundedSender<Event>,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(ev) = rx.recv().await {
            match ev {
                Event::Command { cmd, reply } => self.handle_command(cmd, reply).await,
                Event::ChildExited(n) => self.on_child_exited(n),
                Event::RestartTimerFired { id, epoch } => self.on_restart_timer(id, epoch),
                Event::KillEscalate { id, epoch, hard } => self.on_kill_escalate(id, epoch, hard),
                Event::SampleTaken { id, sample } => {
                    if let Some(e) = self.reg.get_mut(id) {
                        e.sample = sample;
                    }
                }
                Event::MemoryExceeded { id, rss } => {
                    if let Some(e) = self.reg.get(id) {
                        bm_event(
                            "supervisor",
                            Some(&e.name),
                            format!("restart cause=memory rss={rss}"),
                        );
                    }
                    self.restart_for_event(id, "memory");
                }
                Event::HealthReport { id, health, fails } => {
                    if let Some(e) = self.reg.get_mut(id) {
                        e.health = health;
                        e.health_fails = fails;
                    }
                }
                Event::Unhealthy { id } => self.restart_for_event(id, "health"),
                Event::CronFired { id } => self.restart_for_event(id, "cron"),
                Event::SourceChanged { id } => self.restart_for_event(id, "watch"),
                Event::OnlinePids { reply } => {
                    let procs: Vec<OnlineProc> = self
                        .reg
                        .iter()
                        .filter(|e| e.state == ServiceState::Online)
                        .filter_map(|e| {
                            e.pid().map(|pid| OnlineProc {
                                id: e.id,
                                name: e.name.clone(),
                                pid,
                                memory_cap: e.spec.max_memory.map(|m| m.bytes()),
                            })
                        })
                        .collect();
                    let _ = reply.send(procs);
                }
                Event::SpawnReplacement { id, reply } => {
                    let _ = reply.send(self.spawn_replacement(id));
                }
                Event::EntryState { id, reply } => {
                    let _ = reply.send(self.reg.get(id).map(|e| e.state));
                }
                Event::DescribeIds { ids, reply } => {
                    let states = ids
                        .iter()
                        .filter_map(|id| self.reg.get(*id))
                        .map(|e| e.to_process_state())
                        .collect();
                    let _ = reply.send(states);
                }
                Event::Shutdown { reply } => self.on_shutdown(reply),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command, reply: Reply) {
        match cmd {
            Command::Start { spec } => {
                let r = self.do_start(spec).map(|ids| {
                    Payload::States(
                        ids.iter()
                            .filter_map(|id| self.reg.get(*id))
                            .map(|e| e.to_process_state())
                            .collect(),
                    )
                });
                let _ = reply.send(r);
            }
            Command::Ecosystem { apps } => {
                let mut created: Vec<u64> = Vec::new();
                let mut first_err: Option<BmError> = None;
                let total = apps.len();
                for spec in apps {
                    match self.do_start(spec) {
                        Ok(ids) => created.extend(ids),
                        Err(e) => {
                            bm_event("supervisor", None, format!("ecosystem_error err={e}"));
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                }
                let r = if created.is_empty() && total > 0 {
                    Err(first_err
                        .unwrap_or_else(|| BmError::Internal("ecosystem created nothing".into())))
                } else {
                    Ok(Payload::States(
                        created
                            .iter()
                            .filter_map(|id| self.reg.get(*id))
                            .map(|e| e.to_process_state())
                            .collect(),
                    ))
                };
                let _ = reply.send(r);
            }
            Command::Stop { target } => {
                let ids = self.reg.resolve(&target);
                let mut receivers = Vec::new();
                for id in &ids {
                    if let Some(rx) = self.initiate_operator_stop(*id) {
                        receivers.push(rx);
                    }
                }
                self.reply_when_settled(ids, receivers, reply);
            }
            Command::Restart { target } => {
                let ids = self.reg.resolve(&target);
                let mut receivers = Vec::new();
                for id in &ids {
                    if let Some(rx) = self.initiate_restart(*id, RestartCause::Operator) {
                        receivers.push(rx);
                    }
                }
                self.reply_when_settled(ids, receivers, reply);
            }
            Command::Delete { target } => {
                let ids = self.reg.resolve(&target);
                // The reply carries the last view of the removed entries.
                let snapshot: Vec<ProcessState> = ids
                    .iter()
                    .filter_map(|id| self.reg.get(*id))
                    .map(|e| e.to_process_state())
                    .collect();
                let mut receivers = Vec::new();
                for id in &ids {
                    if let Some(rx) = self.initiate_delete(*id) {
                        receivers.push(rx);
                    }
                }
                tasks().spawn(async move {
                    for rx in receivers {
                        let _ = rx.await;
                    }
                    let _ = reply.send(Ok(Payload::States(snapshot)));
                });
            }
            Command::Scale { target, count } => self.do_scale(target, count, reply),
            Command::Signal { target, signal } => {
                let sig = match parse_signal(&signal) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = reply.send(Err(BmError::InvalidSpec(e.to_string())));
                        return;
                    }
                };
                let ids = self.reg.resolve(&target);
                if ids.is_empty() {
                    let _ = reply.send(Err(BmError::NotFound(target)));
                    return;
                }
                for id in ids {
                    if let Some(e) = self.reg.get(id) {
                        if let Some(pid) = e.pid() {
                            // Direct child only; tree delivery is reserved for kill.
                            let _ = child::signal_pid(pid, sig);
                        }
                    }
                }
                let _ = reply.send(Ok(Payload::Ack));
            }
            Command::Reset { target } => {
                let ids = self.reg.resolve(&target);
                for id in &ids {
                    if let Some(e) = self.reg.get_mut(*id) {
                        e.restart_count = 0;
                        e.unstable_restarts = 0;
                        bm_event("supervisor", Some(&e.name), "reset counters=restart,unstable");
                    }
                }
                let states = ids
                    .iter()
                    .filter_map(|id| self.reg.get(*id))
                    .map(|e| e.to_process_state())
                    .collect();
                let _ = reply.send(Ok(Payload::States(states)));
            }
            Command::List => {
                let states = self.reg.iter().map(|e| e.to_process_state()).collect();
                let _ = reply.send(Ok(Payload::States(states)));
            }
            Command::Describe { target } => {
                let states = self
                    .reg
                    .resolve(&target)
                    .iter()
                    .filter_map(|id| self.reg.get(*id))
                    .map(|e| e.to_process_state())
                    .collect();
                let _ = reply.send(Ok(Payload::States(states)));
            }
            Command::LogTargets { target } => {
                let targets = self
                    .reg
                    .resolve(&target)
                    .iter()
                    .filter_map(|id| self.reg.get(*id))
                    .map(|e| self.log_target_of(e))
                    .collect();
                let _ = reply.send(Ok(Payload::LogTargets(targets)));
            }
            Command::Flush { target } => {
                let ids = match target {
                    Some(t) => self.reg.resolve(&t),
                    None => self.reg.ids(),
                };
                for id in ids {
                    if let Some(e) = self.reg.get(id) {
                        if let Some(sinks) = &e.sinks {
                            if let Err(er) = sinks.truncate_both().await {
                                bm_event(
                                    "logsink",
                                    Some(&e.name),
                                    format!("flush_error err={er:#}"),
                                );
                            }
                        }
                    }
                }
                let _ = reply.send(Ok(Payload::Ack));
            }
            Command::Save => {
                let r = persist::save(&self.home, self.reg.iter())
                    .await
                    .map(|n| {
                        bm_event("persist", None, format!("saved services={n}"));
                        Payload::Ack
                    });
                let _ = reply.send(r);
            }
            Command::Resurrect => {
                let saved = match persist::load(&self.home).await {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let mut created: Vec<u64> = Vec::new();
                for s in saved {
                    match self.do_start(s.spec) {
                        Ok(ids) => {
                            for id in &ids {
                                if let Some(e) = self.reg.get_mut(*id) {
                                    e.restart_count = s.restart_count;
                                }
                            }
                            created.extend(ids);
                        }
                        Err(e) => {
                            bm_event("persist", None, format!("resurrect_error err={e}"));
                        }
                    }
                }
                let states = created
                    .iter()
                    .filter_map(|id| self.reg.get(*id))
                    .map(|e| e.to_process_state())
                    .collect();
                let _ = reply.send(Ok(Payload::States(states)));
            }
        }
    }

    // ---------------- start / spawn ----------------

    /// Create the entries for one spec (one per resolved instance) and spawn
    /// them. Spawn failures leave the failing entry in `errored`; creation of
    /// all entries is atomic with respect to name conflicts.
    fn do_start(&mut self, spec: ServiceSpec) -> Result<Vec<u64>, BmError> {
        spec.validate()?;
        let n = spec.instances.resolve();
        let names: Vec<String> = if n == 1 {
            vec![spec.name.clone()]
        } else {
            (0..n).map(|i| format!("{}-{i}", spec.name)).collect()
        };
        for name in &names {
            if self.reg.contains_name(name) {
                return Err(BmError::AlreadyExists(name.clone()));
            }
        }

        let mut ids = Vec::with_capacity(n);
        for (i, name) in names.iter().enumerate() {
            let mut worker_spec = spec.clone();
            worker_spec.name = name.clone();
            let id = self.reg.insert(worker_spec, name.clone())?;
            if spec.exec_mode == ExecMode::Cluster {
                if let Some(e) = self.reg.get_mut(id) {
                    e.slot = Some(ClusterSlot {
                        worker_id: i as u32,
                        instances: n as u32,
                    });
                }
            }
            self.arm_background_tasks(id);
            if let Err(e) = self.spawn_entry(id) {
                bm_event("supervisor", Some(name), format!("spawn_error err={e}"));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn log_target_of(&self, e: &ServiceEntry) -> LogTarget {
        LogTarget {
            name: e.name.clone(),
            id: e.id,
            out: e
                .spec
                .log
                .out_file
                .clone()
                .unwrap_or_else(|| self.home.out_log(&e.name, e.id)),
            err: e
                .spec
                .log
                .err_file
                .clone()
                .unwrap_or_else(|| self.home.err_log(&e.name, e.id)),
        }
    }

    /// Cron and watch intents live for the whole entry lifetime.
    fn arm_background_tasks(&mut self, id: u64) {
        let Some(e) = self.reg.get(id) else { return };
        let name = e.name.clone();
        let cron_expr = e.spec.cron_restart.clone();
        let watch = e.spec.watch;
        let mut roots = e.spec.watch_paths.clone();
        if watch && roots.is_empty() {
            roots = vec![e
                .spec
                .cwd
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from("."))];
        }
        let ignores = e.spec.ignore_watch.clone();

        let cron_handle = cron_expr.map(|expr| {
            let tx = self.tx.clone();
            cron::arm(name.clone(), expr, move || {
                let _ = tx.send(Event::CronFired { id });
            })
        });
        let watch_handle = watch.then(|| {
            let tx = self.tx.clone();
            watcher::start_watcher(name.clone(), roots, ignores, move || {
                let _ = tx.send(Event::SourceChanged { id });
            })
        });

        if let Some(e) = self.reg.get_mut(id) {
            e.timers.cron = cron_handle;
            e.timers.watch = watch_handle;
        }
    }

    /// Spawn (or respawn) the child of an entry. On success the entry is
    /// `online`; on failure `errored`.
    fn spawn_entry(&mut self, id: u64) -> Result<(), BmError> {
        let log_target = {
            let Some(e) = self.reg.get(id) else {
                return Err(BmError::NotFound(format!("id {id}")));
            };
            self.log_target_of(e)
        };
        let Some(e) = self.reg.get_mut(id) else {
            return Err(BmError::NotFound(format!("id {id}")));
        };

        e.state = ServiceState::Launching;
        e.run_epoch += 1;
        let epoch = e.run_epoch;

        if e.sinks.is_none() {
            e.sinks = Some(LogSinks::start(
                &e.name,
                log_target.out,
                log_target.err,
                e.spec.log.clone(),
            ));
        }

        let tx = self.tx.clone();
        let Some(sinks) = e.sinks.as_ref() else {
            return Err(BmError::Internal(format!("{}: log sinks missing", e.name)));
        };
        let spawned = child::spawn_service_child(
            &self.home,
            id,
            &e.name,
            epoch,
            &e.spec,
            e.slot,
            sinks,
            move |notice| {
                let _ = tx.send(Event::ChildExited(notice));
            },
        );

        match spawned {
            Ok(handle) => {
                e.child = Some(handle);
                e.started_at = Utc::now().timestamp_millis();
                e.state = ServiceState::Online;
                e.stop_requested = false;
                e.health = HealthState::Unknown;
                e.health_fails = 0;
                e.notify_waiters();
                self.arm_health(id);
                Ok(())
            }
            Err(err) => {
                e.child = None;
                e.started_at = 0;
                e.state = ServiceState::Errored;
                e.notify_waiters();
                Err(err)
            }
        }
    }

    fn arm_health(&mut self, id: u64) {
        let Some(e) = self.reg.get(id) else { return };
        let Some(hc) = e.spec.health_check.clone() else {
            return;
        };
        let name = e.name.clone();
        let tx = self.tx.clone();
        let handle = health::start_prober(name, hc, move |report| {
            let ev = match report {
                ProbeReport::Changed { health, fails } => Event::HealthReport { id, health, fails },
                ProbeReport::Unhealthy => Event::Unhealthy { id },
            };
            let _ = tx.send(ev);
        });
        if let Some(e) = self.reg.get_mut(id) {
            e.timers.cancel_health();
            e.timers.health = Some(handle);
        }
    }

    // ---------------- stop / restart / delete ----------------

    /// Begin terminating a live child: deliver the stop signal (tree-wide
    /// under `treekill`), arm the SIGKILL escalation. The state transition to
    /// `stopped` happens when the exit is observed.
    fn begin_termination(&mut self, id: u64) {
        let Some(e) = self.reg.get_mut(id) else { return };
        let Some(handle) = e.child else { return };
        e.state = ServiceState::Stopping;

        let sig = e
            .spec
            .stop_signal
            .as_deref()
            .and_then(|s| parse_signal(s).ok())
            .unwrap_or(Signal::SIGTERM);
        let treekill = e.spec.treekill;
        let kt = e.spec.kill_timeout_ms();
        signal_tree(handle.pid, sig, treekill);

        e.timers.cancel_kill_escalation();
        let tx = self.tx.clone();
        let epoch = handle.epoch;
        if kt == 0 {
            // Immediate escalation: SIGKILL right behind the stop signal.
            signal_tree(handle.pid, Signal::SIGKILL, treekill);
            e.timers.kill_escalation = Some(tasks().spawn(async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                let _ = tx.send(Event::KillEscalate { id, epoch, hard: true });
            }));
        } else {
            e.timers.kill_escalation = Some(tasks().spawn(async move {
                tokio::time::sleep(Duration::from_millis(kt)).await;
                let _ = tx.send(Event::KillEscalate { id, epoch, hard: false });
            }));
        }
    }

    fn on_kill_escalate(&mut self, id: u64, epoch: u64, hard: bool) {
        let Some(e) = self.reg.get_mut(id) else { return };
        let Some(handle) = e.child else { return };
        if handle.epoch != epoch {
            return;
        }
        if !hard {
            bm_event(
                "supervisor",
                Some(&e.name),
                format!("kill_timeout pid={} escalate=SIGKILL", handle.pid),
            );
            signal_tree(handle.pid, Signal::SIGKILL, e.spec.treekill);
            let tx = self.tx.clone();
            let kt = e.spec.kill_timeout_ms().max(1000);
            e.timers.kill_escalation = Some(tasks().spawn(async move {
                tokio::time::sleep(Duration::from_millis(kt)).await;
                let _ = tx.send(Event::KillEscalate { id, epoch, hard: true });
            }));
        } else if pid_alive(handle.pid) {
            // SIGKILL did not reap within the window: kernel-level wedging.
            bm_event(
                "supervisor",
                Some(&e.name),
                format!(
                    "{}: pid={} survived SIGKILL",
                    BmError::KillTimeout(e.name.clone()).kind(),
                    handle.pid
                ),
            );
        }
    }

    /// Operator stop. Returns a settle receiver when the entry has work to do.
    fn initiate_operator_stop(&mut self, id: u64) -> Option<oneshot::Receiver<()>> {
        let e = self.reg.get_mut(id)?;
        e.restart_after_stop = None;
        match e.state {
            ServiceState::Stopped | ServiceState::Errored => None,
            ServiceState::WaitingRestart => {
                e.timers.cancel_restart();
                e.stop_requested = true;
                e.state = ServiceState::Stopped;
                e.notify_waiters();
                bm_event("supervisor", Some(&e.name), "stopped from=waiting-restart");
                None
            }
            ServiceState::Stopping => {
                // Second stop while one is in flight: observe the same settle.
                let (tx, rx) = oneshot::channel();
                e.stop_requested = true;
                e.waiters.push(tx);
                Some(rx)
            }
            ServiceState::Launching | ServiceState::Online => {
                e.stop_requested = true;
                let (tx, rx) = oneshot::channel();
                e.waiters.push(tx);
                self.begin_termination(id);
                Some(rx)
            }
        }
    }

    /// Restart: stop-then-start for running entries, plain start otherwise.
    fn initiate_restart(&mut self, id: u64, cause: RestartCause) -> Option<oneshot::Receiver<()>> {
        let e = self.reg.get_mut(id)?;
        match e.state {
            ServiceState::Launching | ServiceState::Online | ServiceState::Stopping => {
                e.restart_after_stop = Some(cause);
                let (tx, rx) = oneshot::channel();
                e.waiters.push(tx);
                if e.state != ServiceState::Stopping {
                    self.begin_termination(id);
                }
                Some(rx)
            }
            ServiceState::WaitingRestart | ServiceState::Stopped | ServiceState::Errored => {
                e.timers.cancel_restart();
                match cause {
                    RestartCause::Operator => {
                        e.restart_count = 0;
                        e.stop_requested = false;
                    }
                    RestartCause::Auto(label) => {
                        // An automatic trigger cannot revive a resting entry.
                        bm_event(
                            "supervisor",
                            Some(&e.name),
                            format!("restart_skipped cause={label} state={}", e.state.as_str()),
                        );
                        return None;
                    }
                }
                let (tx, rx) = oneshot::channel();
                e.waiters.push(tx);
                let name = e.name.clone();
                if let Err(err) = self.spawn_entry(id) {
                    bm_event("supervisor", Some(&name), format!("spawn_error err={err}"));
                }
                Some(rx)
            }
        }
    }

    /// Event-driven restart (health, cron, watch, memory cap).
    fn restart_for_event(&mut self, id: u64, label: &'static str) {
        let Some(e) = self.reg.get(id) else { return };
        let name = e.name.clone();
        match e.state {
            ServiceState::Online | ServiceState::Launching => {
                bm_event("supervisor", Some(&name), format!("restart cause={label}"));
                let _ = self.initiate_restart(id, RestartCause::Auto(label));
            }
            _ => {
                bm_event(
                    "supervisor",
                    Some(&name),
                    format!("restart_skipped cause={label} state={}", e.state.as_str()),
                );
            }
        }
    }

    fn initiate_delete(&mut self, id: u64) -> Option<oneshot::Receiver<()>> {
        let e = self.reg.get_mut(id)?;
        e.delete_requested = true;
        e.restart_after_stop = None;
        match e.state {
            ServiceState::Launching | ServiceState::Online => {
                let (tx, rx) = oneshot::channel();
                e.waiters.push(tx);
                self.begin_termination(id);
                Some(rx)
            }
            ServiceState::Stopping => {
                let (tx, rx) = oneshot::channel();
                e.waiters.push(tx);
                Some(rx)
            }
            ServiceState::Stopped | ServiceState::Errored | ServiceState::WaitingRestart => {
                self.finish_delete(id);
                None
            }
        }
    }

    fn finish_delete(&mut self, id: u64) {
        let Some(mut e) = self.reg.remove(id) else { return };
        e.timers.cancel_all();
        e.notify_waiters();
        if let Some(sinks) = e.sinks.take() {
            tasks().spawn(async move {
                sinks.close().await;
            });
        }
        bm_event("supervisor", Some(&e.name), format!("deleted id={id}"));
    }

    // ---------------- exit policy ----------------

    fn on_child_exited(&mut self, n: ExitNotice) {
        let Some(e) = self.reg.get_mut(n.id) else { return };
        if n.epoch != e.run_epoch {
            // A replacement child took over (reload) or the exit raced a respawn.
            return;
        }
        let name = e.name.clone();
        bm_event(
            "supervisor",
            Some(&name),
            format!(
                "exited code={:?} signal={:?} state={}",
                n.code,
                n.signal,
                e.state.as_str()
            ),
        );

        e.child = None;
        e.timers.cancel_kill_escalation();
        e.timers.cancel_health();
        e.health = HealthState::Unknown;
        e.health_fails = 0;
        let uptime_ms = if e.started_at > 0 {
            Utc::now().timestamp_millis() - e.started_at
        } else {
            0
        };
        e.started_at = 0;

        if e.delete_requested {
            self.finish_delete(n.id);
            return;
        }

        if let Some(cause) = e.restart_after_stop.take() {
            match cause {
                RestartCause::Operator => {
                    e.restart_count = 0;
                }
                RestartCause::Auto(label) => {
                    if e.restart_count >= e.spec.max_restarts {
                        e.state = ServiceState::Errored;
                        e.notify_waiters();
                        bm_event(
                            "supervisor",
                            Some(&name),
                            format!(
                                "restart_cap cause={label} restart_count={} max_restarts={}",
                                e.restart_count, e.spec.max_restarts
                            ),
                        );
                        return;
                    }
                    e.restart_count += 1;
                }
            }
            if let Err(err) = self.spawn_entry(n.id) {
                bm_event("supervisor", Some(&name), format!("spawn_error err={err}"));
            }
            return;
        }

        if e.state == ServiceState::Stopping {
            e.state = ServiceState::Stopped;
            e.notify_waiters();
            return;
        }

        // Unexpected exit: evaluate the restart policy.
        if !e.spec.autorestart {
            e.state = if n.code == Some(0) {
                ServiceState::Stopped
            } else {
                ServiceState::Errored
            };
            e.notify_waiters();
            return;
        }
        if e.restart_count >= e.spec.max_restarts {
            e.state = ServiceState::Errored;
            e.notify_waiters();
            bm_event(
                "supervisor",
                Some(&name),
                format!(
                    "restart_cap restart_count={} max_restarts={}",
                    e.restart_count, e.spec.max_restarts
                ),
            );
            return;
        }
        if (uptime_ms as u64) < e.spec.min_uptime {
            e.unstable_restarts += 1;
        }
        e.state = ServiceState::WaitingRestart;
        let delay = e.spec.restart_delay;
        let epoch = e.run_epoch;
        let id = n.id;
        let tx = self.tx.clone();
        e.timers.cancel_restart();
        e.timers.restart = Some(tasks().spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(Event::RestartTimerFired { id, epoch });
        }));
    }

    fn on_restart_timer(&mut self, id: u64, epoch: u64) {
        let Some(e) = self.reg.get_mut(id) else { return };
        if e.state != ServiceState::WaitingRestart || e.run_epoch != epoch {
            return;
        }
        e.restart_count += 1;
        let name = e.name.clone();
        let count = e.restart_count;
        if let Err(err) = self.spawn_entry(id) {
            bm_event("supervisor", Some(&name), format!("spawn_error err={err}"));
        } else {
            bm_event(
                "supervisor",
                Some(&name),
                format!("respawned restart_count={count}"),
            );
        }
    }

    // ---------------- reload swap ----------------

    /// Swap a freshly spawned child into an online entry and hand the old
    /// child back to the reload coordinator. The entry never stops owning
    /// exactly one child; the old one migrates to the caller.
    fn spawn_replacement(&mut self, id: u64) -> Result<ChildHandle, BmError> {
        let Some(e) = self.reg.get_mut(id) else {
            return Err(BmError::NotFound(format!("id {id}")));
        };
        if e.state != ServiceState::Online {
            return Err(BmError::Internal(format!(
                "reload: {} is {} (needs online)",
                e.name,
                e.state.as_str()
            )));
        }
        let Some(old) = e.child.take() else {
            return Err(BmError::Internal(format!("reload: {} has no child", e.name)));
        };
        let name = e.name.clone();
        let old_epoch = e.run_epoch;

        match self.spawn_entry(id) {
            Ok(()) => {
                if let Some(e) = self.reg.get_mut(id) {
                    e.restart_count += 1;
                }
                bm_event(
                    "reload",
                    Some(&name),
                    format!("swapped old_pid={} new", old.pid),
                );
                Ok(old)
            }
            Err(err) => {
                // Put the still-running old child back; the entry stays live.
                if let Some(e) = self.reg.get_mut(id) {
                    e.child = Some(old);
                    e.run_epoch = old_epoch;
                    e.state = ServiceState::Online;
                    e.started_at = Utc::now().timestamp_millis();
                }
                Err(err)
            }
        }
    }

    // ---------------- scale ----------------

    fn do_scale(&mut self, target: String, count: u32, reply: Reply) {
        let workers = self.reg.workers_of(&target);
        if workers.is_empty() {
            let _ = reply.send(Err(BmError::NotFound(target)));
            return;
        }
        let desired = count.max(1) as usize;
        let current = workers.len();

        if desired == current {
            let ids: Vec<u64> = workers.iter().map(|(_, id)| *id).collect();
            let states = ids
                .iter()
                .filter_map(|id| self.reg.get(*id))
                .map(|e| e.to_process_state())
                .collect();
            let _ = reply.send(Ok(Payload::States(states)));
            return;
        }

        if desired > current {
            // A lone unsuffixed entry becomes worker 0 of the cluster.
            if current == 1 {
                let (_, only_id) = workers[0];
                let is_bare = self
                    .reg
                    .get(only_id)
                    .map(|e| e.name == target)
                    .unwrap_or(false);
                if is_bare {
                    let new_name = format!("{target}-0");
                    if let Err(e) = self.reg.rename(only_id, new_name.clone()) {
                        let _ = reply.send(Err(e));
                        return;
                    }
                    if let Some(en) = self.reg.get_mut(only_id) {
                        en.spec.name = new_name;
                    }
                }
            }
            let template = self
                .reg
                .get(self.reg.workers_of(&target)[0].1)
                .map(|e| e.spec.clone());
            let Some(template) = template else {
                let _ = reply.send(Err(BmError::Internal("scale lost its template".into())));
                return;
            };
            let use_slot = template.exec_mode == ExecMode::Cluster;
            let to_add = desired - self.reg.workers_of(&target).len();
            let mut idx = self
                .reg
                .workers_of(&target)
                .iter()
                .map(|(i, _)| *i)
                .max()
                .map(|m| m + 1)
                .unwrap_or(0);
            for _ in 0..to_add {
                while self.reg.contains_name(&format!("{target}-{idx}")) {
                    idx += 1;
                }
                let name = format!("{target}-{idx}");
                let mut spec = template.clone();
                spec.name = name.clone();
                match self.reg.insert(spec, name.clone()) {
                    Ok(id) => {
                        if use_slot {
                            if let Some(e) = self.reg.get_mut(id) {
                                e.slot = Some(ClusterSlot {
                                    worker_id: idx,
                                    instances: desired as u32,
                                });
                            }
                        }
                        self.arm_background_tasks(id);
                        if let Err(e) = self.spawn_entry(id) {
                            bm_event("supervisor", Some(&name), format!("spawn_error err={e}"));
                        }
                    }
                    Err(e) => {
                        bm_event("supervisor", Some(&name), format!("scale_error err={e}"));
                    }
                }
                idx += 1;
            }
            let ids: Vec<u64> = self.reg.workers_of(&target).iter().map(|(_, id)| *id).collect();
            let states = ids
                .iter()
                .filter_map(|id| self.reg.get(*id))
                .map(|e| e.to_process_state())
                .collect();
            let _ = reply.send(Ok(Payload::States(states)));
            return;
        }

        // Scale down: highest worker indices go first; children are reaped.
        let mut by_idx = workers;
        by_idx.sort_unstable();
        let doomed: Vec<u64> = by_idx
            .iter()
            .rev()
            .take(current - desired)
            .map(|(_, id)| *id)
            .collect();
        let mut receivers = Vec::new();
        for id in &doomed {
            if let Some(rx) = self.initiate_delete(*id) {
                receivers.push(rx);
            }
        }
        let survivors: Vec<u64> = by_idx
            .iter()
            .filter(|(_, id)| !doomed.contains(id))
            .map(|(_, id)| *id)
            .collect();
        self.reply_when_settled(survivors, receivers, reply);
    }

    // ---------------- shutdown ----------------

    fn on_shutdown(&mut self, reply: oneshot::Sender<()>) {
        bm_event("supervisor", None, format!("shutdown services={}", self.reg.len()));
        let mut receivers = Vec::new();
        for id in self.reg.ids() {
            if let Some(rx) = self.initiate_operator_stop(id) {
                receivers.push(rx);
            }
        }
        tasks().spawn(async move {
            for rx in receivers {
                let _ = rx.await;
            }
            let _ = reply.send(());
        });
    }

    // ---------------- plumbing ----------------

    /// Answer with the states of `ids` once every receiver has settled.
    fn reply_when_settled(
        &self,
        ids: Vec<u64>,
        receivers: Vec<oneshot::Receiver<()>>,
        reply: Reply,
    ) {
        let tx = self.tx.clone();
        tasks().spawn(async move {
            for rx in receivers {
                let _ = rx.await;
            }
            let (dtx, drx) = oneshot::channel();
            let _ = tx.send(Event::DescribeIds { ids, reply: dtx });
            let states = drx.await.unwrap_or_default();
            let _ = reply.send(Ok(Payload::States(states)));
        });
    }
}
