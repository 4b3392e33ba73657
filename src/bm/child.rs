use crate::bm::asyncutil::tasks;
use crate::bm::error::BmError;
use crate::bm::events::bm_event;
use crate::bm::logs::LogSinks;
use crate::bm::paths::BmHome;
use crate::bm::spec::{resolve_interpreter, ExecMode, ServiceSpec};
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Reference to the live OS child of one entry. The `tokio::process::Child`
/// itself is owned by the exit waiter task; everyone else signals by pid.
#[derive(Debug, Clone, Copy)]
pub struct ChildHandle {
    pub pid: i32,
    pub epoch: u64,
}

/// Cluster slot injected into a worker's environment.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSlot {
    pub worker_id: u32,
    pub instances: u32,
}

/// Exit result delivered to the supervisor inbox.
#[derive(Debug, Clone, Copy)]
pub struct ExitNotice {
    pub id: u64,
    pub epoch: u64,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Accept `SIGTERM`, `TERM` or `15`.
pub fn parse_signal(s: &str) -> anyhow::Result<Signal> {
    let t = s.trim();
    if t.is_empty() {
        anyhow::bail!("empty signal name");
    }
    if let Ok(n) = t.parse::<i32>() {
        return Signal::try_from(n).map_err(|e| anyhow::anyhow!("unknown signal {t:?}: {e}"));
    }
    let upper = t.to_ascii_uppercase();
    let named = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&named).map_err(|e| anyhow::anyhow!("unknown signal {s:?}: {e}"))
}

pub fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

pub fn signal_pid(pid: i32, sig: Signal) -> anyhow::Result<()> {
    kill(Pid::from_raw(pid), sig).map_err(|e| anyhow::anyhow!("kill({pid}, {sig}): {e}"))
}

fn children_via_proc(pid: i32) -> Option<Vec<i32>> {
    let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
    let entries = std::fs::read_dir(&task_dir).ok()?;
    let mut out = Vec::new();
    for e in entries.flatten() {
        let children = e.path().join("children");
        if let Ok(s) = std::fs::read_to_string(&children) {
            for tok in s.split_whitespace() {
                if let Ok(c) = tok.parse::<i32>() {
                    out.push(c);
                }
            }
        }
    }
    Some(out)
}

fn children_via_pgrep(pid: i32) -> Vec<i32> {
    let out = std::process::Command::new("pgrep")
        .arg("-P")
        .arg(pid.to_string())
        .output();
    match out {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
            .split_whitespace()
            .filter_map(|t| t.parse::<i32>().ok())
            .collect(),
        _ => vec![],
    }
}

fn children_of(pid: i32) -> Vec<i32> {
    match children_via_proc(pid) {
        Some(v) => v,
        None => children_via_pgrep(pid),
    }
}

/// The descendant tree rooted at `root`, root first, leaves last.
pub fn process_tree(root: i32) -> Vec<i32> {
    let mut out = vec![root];
    let mut i = 0;
    while i < out.len() {
        let kids = children_of(out[i]);
        for k in kids {
            if !out.contains(&k) {
                out.push(k);
            }
        }
        i += 1;
        if out.len() > 4096 {
            break;
        }
    }
    out
}

/// Deliver `sig` to the child, or to its whole descendant tree when
/// `treekill` (root first, leaves last). Dead pids are skipped quietly.
pub fn signal_tree(root: i32, sig: Signal, treekill: bool) {
    if !treekill {
        let _ = kill(Pid::from_raw(root), sig);
        return;
    }
    for pid in process_tree(root) {
        let _ = kill(Pid::from_raw(pid), sig);
    }
}

fn build_env(
    spec: &ServiceSpec,
    id: u64,
    name: &str,
    cluster: Option<ClusterSlot>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    let mut push = |k: &str, v: String| {
        env.retain(|(ek, _)| ek != k);
        env.push((k.to_string(), v));
    };
    for (k, v) in &spec.env {
        push(k, v.clone());
    }
    push("BM2_ID", id.to_string());
    push("BM2_NAME", name.to_string());
    push("BM2_EXEC_MODE", spec.exec_mode.as_str().to_string());
    if spec.exec_mode == ExecMode::Cluster {
        if let Some(slot) = cluster {
            push("BM2_CLUSTER", "true".to_string());
            push("BM2_WORKER_ID", slot.worker_id.to_string());
            push("BM2_INSTANCES", slot.instances.to_string());
            push("NODE_APP_INSTANCE", slot.worker_id.to_string());
            if let Some(base) = spec.port {
                push("PORT", (base as u32 + slot.worker_id).to_string());
            }
        }
    }
    env
}

/// Spawn the OS child for an entry: stdin silenced, stdout/stderr piped into
/// the log sinks, a pid file under `pids/`, and an exit waiter that joins the
/// pumps before reporting (logs never post-date exit).
pub fn spawn_service_child<F>(
    home: &BmHome,
    id: u64,
    name: &str,
    epoch: u64,
    spec: &ServiceSpec,
    cluster: Option<ClusterSlot>,
    sinks: &LogSinks,
    on_exit: F,
) -> Result<ChildHandle, BmError>
where
    F: FnOnce(ExitNotice) + Send + 'static,
{
    let argv_prefix = resolve_interpreter(spec);
    let (program, pre_args): (&str, &[String]) = match argv_prefix.split_first() {
        Some((p, rest)) => (p.as_str(), rest),
        None => (spec.script.as_str(), &[]),
    };

    let mut cmd = tokio::process::Command::new(program);
    if !argv_prefix.is_empty() {
        cmd.args(pre_args);
        cmd.arg(&spec.script);
    }
    cmd.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd.env_clear();
    cmd.envs(build_env(spec, id, name, cluster));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| BmError::SpawnFailed(format!("{}: exec {program:?}: {e}", name)))?;

    let pid = child.id().map(|p| p as i32).ok_or_else(|| {
        BmError::SpawnFailed(format!("{name}: child exited before pid was known"))
    })?;

    let pid_file = home.child_pid_file(name, id);
    if let Err(e) = std::fs::write(&pid_file, format!("{pid}\n")) {
        bm_event("child", Some(name), format!("pid_file_error path={} err={e}", pid_file.display()));
    }

    let out_pump = child.stdout.take().map(|pipe| {
        let sink = sinks.out.clone();
        tasks().spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.push_line(&line);
            }
        })
    });
    let err_pump = child.stderr.take().map(|pipe| {
        let sink = sinks.err.clone();
        tasks().spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.push_line(&line);
            }
        })
    });

    let svc = name.to_string();
    tasks().spawn(async move {
        let status = child.wait().await;
        // Drain both pipes fully before reporting the exit.
        if let Some(h) = out_pump {
            let _ = h.await;
        }
        if let Some(h) = err_pump {
            let _ = h.await;
        }
        // A reload swap may have written a newer pid into the same file.
        if let Ok(content) = std::fs::read_to_string(&pid_file) {
            if content.trim() == pid.to_string() {
                let _ = std::fs::remove_file(&pid_file);
            }
        }
        let (code, signal) = match status {
            Ok(st) => (st.code(), st.signal()),
            Err(e) => {
                bm_event("child", Some(&svc), format!("wait_error err={e}"));
                (None, None)
            }
        };
        on_exit(ExitNotice {
            id,
            epoch,
            code,
            signal,
        });
    });

    bm_event(
        "child",
        Some(name),
        format!("spawned pid={pid} epoch={epoch} at={}", Utc::now().timestamp_millis()),
    );
    Ok(ChildHandle { pid, epoch })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parsing_accepts_common_forms() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("SIGUSR2").unwrap(), Signal::SIGUSR2);
        assert!(parse_signal("").is_err());
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn env_contract_fork_mode() {
        let spec: ServiceSpec =
            serde_json::from_str(r#"{"name":"api","script":"a.js","env":{"FOO":"bar"}}"#).unwrap();
        let env = build_env(&spec, 3, "api", None);
        let get = |k: &str| env.iter().find(|(ek, _)| ek == k).map(|(_, v)| v.clone());
        assert_eq!(get("BM2_ID").as_deref(), Some("3"));
        assert_eq!(get("BM2_NAME").as_deref(), Some("api"));
        assert_eq!(get("BM2_EXEC_MODE").as_deref(), Some("fork"));
        assert_eq!(get("FOO").as_deref(), Some("bar"));
        assert_eq!(get("BM2_CLUSTER"), None);
    }

    #[test]
    fn env_contract_cluster_mode_with_port() {
        let spec: ServiceSpec = serde_json::from_str(
            r#"{"name":"web","script":"a.js","exec_mode":"cluster","instances":3,"port":8000}"#,
        )
        .unwrap();
        let env = build_env(
            &spec,
            5,
            "web-2",
            Some(ClusterSlot {
                worker_id: 2,
                instances: 3,
            }),
        );
        let get = |k: &str| env.iter().find(|(ek, _)| ek == k).map(|(_, v)| v.clone());
        assert_eq!(get("BM2_CLUSTER").as_deref(), Some("true"));
        assert_eq!(get("BM2_WORKER_ID").as_deref(), Some("2"));
        assert_eq!(get("BM2_INSTANCES").as_deref(), Some("3"));
        assert_eq!(get("NODE_APP_INSTANCE").as_deref(), Some("2"));
        assert_eq!(get("PORT").as_deref(), Some("8002"));
        assert_eq!(get("BM2_EXEC_MODE").as_deref(), Some("cluster"));
    }

    #[test]
    fn process_tree_contains_root_first() {
        let me = std::process::id() as i32;
        let tree = process_tree(me);
        assert_eq!(tree[0], me);
    }
}
