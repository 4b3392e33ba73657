//! End-to-end scenarios against a live daemon in a temporary home, using
//! `/bin/sh` children.

use bm2::bm::cli::Args;
use bm2::bm::daemon::run_daemon;
use bm2::bm::ipc::{client_call, Request, ResponseFrame};
use bm2::bm::paths::BmHome;
use serde_json::{json, Value};
use std::time::Duration;

struct Daemon {
    home: BmHome,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: Option<tempfile::TempDir>,
}

async fn boot() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    boot_at(BmHome::at(dir.path().join("home")), Some(dir)).await
}

async fn boot_at(home: BmHome, dir: Option<tempfile::TempDir>) -> Daemon {
    let args = Args {
        home: Some(home.root().to_path_buf()),
        monitor_interval_ms: 200,
        build_info: false,
    };
    let task = tokio::spawn(run_daemon(home.clone(), args));

    // Wait for the socket to answer ping.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(resp) = client_call(&home.socket(), &Request::Ping, "boot").await {
            if resp.success {
                return Daemon {
                    home,
                    task,
                    _dir: dir,
                };
            }
        }
    }
    panic!("daemon did not come up");
}

impl Daemon {
    async fn call(&self, req: &Request) -> ResponseFrame {
        client_call(&self.home.socket(), req, "t").await.unwrap()
    }

    async fn list(&self) -> Vec<Value> {
        let resp = self.call(&Request::List).await;
        assert!(resp.success, "list failed: {:?}", resp.error);
        resp.data.as_array().cloned().unwrap_or_default()
    }

    async fn wait_until<F>(&self, what: &str, timeout: Duration, pred: F) -> Vec<Value>
    where
        F: Fn(&[Value]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let states = self.list().await;
            if pred(&states) {
                return states;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {what}; states: {states:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn kill(self) {
        let resp = self.call(&Request::Kill).await;
        assert!(resp.success);
        let _ = tokio::time::timeout(Duration::from_secs(10), self.task).await;
    }
}

fn sh_spec(name: &str, command: &str) -> Value {
    json!({
        "name": name,
        "script": "/bin/sh",
        "args": ["-c", command],
        "interpreter": "none",
    })
}

fn spec_req(mut spec: Value, extra: Value) -> Request {
    if let (Some(base), Some(more)) = (spec.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            base.insert(k.clone(), v.clone());
        }
    }
    Request::Start(serde_json::from_value(spec).unwrap())
}

fn by_name<'a>(states: &'a [Value], name: &str) -> Option<&'a Value> {
    states.iter().find(|s| s["name"] == name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_loop_hits_the_restart_cap() {
    let d = boot().await;
    let resp = d
        .call(&spec_req(
            sh_spec("crash", "echo hello; exit 1"),
            json!({
                "max_restarts": 3,
                "min_uptime": 10_000,
                "restart_delay": 100,
            }),
        ))
        .await;
    assert!(resp.success, "start failed: {:?}", resp.error);

    let states = d
        .wait_until("crash to reach errored", Duration::from_secs(5), |s| {
            by_name(s, "crash").map(|e| e["status"] == "errored").unwrap_or(false)
        })
        .await;
    let e = by_name(&states, "crash").unwrap();
    assert_eq!(e["bm2_env"]["restart_time"], 3);
    assert_eq!(e["bm2_env"]["unstable_restarts"], 3);
    assert!(e["pid"].is_null());

    // Give the debounced sink a moment, then the log carries every run.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let logs = d
        .call(&Request::Logs {
            target: "crash".into(),
            lines: 50,
        })
        .await;
    assert!(logs.success);
    let out = logs.data[0]["out"].as_str().unwrap();
    assert!(out.contains("hello"), "missing child output: {out:?}");
    assert!(out.starts_with('['), "missing timestamp prefix: {out:?}");

    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent() {
    let d = boot().await;
    let resp = d.call(&spec_req(sh_spec("svc", "sleep 30"), json!({}))).await;
    assert!(resp.success);
    d.wait_until("svc online", Duration::from_secs(3), |s| {
        by_name(s, "svc").map(|e| e["status"] == "online").unwrap_or(false)
    })
    .await;

    for _ in 0..2 {
        let resp = d
            .call(&Request::Stop {
                target: "svc".into(),
            })
            .await;
        assert!(resp.success, "stop failed: {:?}", resp.error);
        let states = d.list().await;
        let e = by_name(&states, "svc").unwrap();
        assert_eq!(e["status"], "stopped");
        assert!(e["pid"].is_null());
    }

    // Stopping a name that matches nothing is success with an empty result.
    let resp = d
        .call(&Request::Stop {
            target: "ghost".into(),
        })
        .await;
    assert!(resp.success);
    assert_eq!(resp.data.as_array().map(|a| a.len()), Some(0));

    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_start_is_rejected() {
    let d = boot().await;
    assert!(d.call(&spec_req(sh_spec("web", "sleep 30"), json!({}))).await.success);
    let resp = d.call(&spec_req(sh_spec("web", "sleep 30"), json!({}))).await;
    assert!(!resp.success);
    assert!(resp.error.unwrap().starts_with("AlreadyExists"));
    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_gets_a_fresh_pid_and_resets_the_counter() {
    let d = boot().await;
    assert!(d.call(&spec_req(sh_spec("app", "sleep 30"), json!({}))).await.success);
    let states = d
        .wait_until("app online", Duration::from_secs(3), |s| {
            by_name(s, "app").map(|e| e["status"] == "online").unwrap_or(false)
        })
        .await;
    let old_pid = by_name(&states, "app").unwrap()["pid"].as_i64().unwrap();

    let resp = d
        .call(&Request::Restart {
            target: "app".into(),
        })
        .await;
    assert!(resp.success, "restart failed: {:?}", resp.error);
    let states = d
        .wait_until("app online again", Duration::from_secs(5), |s| {
            by_name(s, "app").map(|e| e["status"] == "online").unwrap_or(false)
        })
        .await;
    let e = by_name(&states, "app").unwrap();
    let new_pid = e["pid"].as_i64().unwrap();
    assert_ne!(new_pid, old_pid);
    assert_eq!(e["bm2_env"]["restart_time"], 0);
    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cluster_workers_see_their_slot_env() {
    let d = boot().await;
    let resp = d
        .call(&spec_req(
            sh_spec("api", "echo port=$PORT worker=$BM2_WORKER_ID; sleep 30"),
            json!({
                "exec_mode": "cluster",
                "instances": 2,
                "port": 8000,
            }),
        ))
        .await;
    assert!(resp.success, "start failed: {:?}", resp.error);
    let created = resp.data.as_array().unwrap();
    let mut names: Vec<&str> = created.iter().map(|s| s["name"].as_str().unwrap()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["api-0", "api-1"]);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let logs = d
        .call(&Request::Logs {
            target: "api-1".into(),
            lines: 10,
        })
        .await;
    let out = logs.data[0]["out"].as_str().unwrap();
    assert!(out.contains("port=8001 worker=1"), "worker env: {out:?}");

    // Name-prefix targeting hits both workers.
    let resp = d
        .call(&Request::Describe {
            target: "api".into(),
        })
        .await;
    assert_eq!(resp.data.as_array().unwrap().len(), 2);

    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scale_up_then_down() {
    let d = boot().await;
    assert!(d.call(&spec_req(sh_spec("api", "sleep 60"), json!({}))).await.success);
    d.wait_until("api online", Duration::from_secs(3), |s| {
        by_name(s, "api").map(|e| e["status"] == "online").unwrap_or(false)
    })
    .await;

    let resp = d
        .call(&Request::Scale {
            target: "api".into(),
            count: 4,
        })
        .await;
    assert!(resp.success, "scale up failed: {:?}", resp.error);
    let states = d.list().await;
    let mut names: Vec<&str> = states.iter().map(|s| s["name"].as_str().unwrap()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["api-0", "api-1", "api-2", "api-3"]);

    let resp = d
        .call(&Request::Scale {
            target: "api".into(),
            count: 2,
        })
        .await;
    assert!(resp.success, "scale down failed: {:?}", resp.error);
    let states = d.list().await;
    let mut names: Vec<&str> = states.iter().map(|s| s["name"].as_str().unwrap()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["api-0", "api-1"]);

    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rolling_reload_replaces_pids() {
    let d = boot().await;
    let resp = d
        .call(&spec_req(
            sh_spec("workers", "sleep 60"),
            json!({
                "exec_mode": "cluster",
                "instances": 2,
                "wait_ready": false,
                "reload_delay": 100,
            }),
        ))
        .await;
    assert!(resp.success);
    let states = d
        .wait_until("workers online", Duration::from_secs(3), |s| {
            s.iter()
                .filter(|e| e["name"].as_str().unwrap_or("").starts_with("workers-"))
                .all(|e| e["status"] == "online")
        })
        .await;
    let old_pids: Vec<i64> = states.iter().map(|s| s["pid"].as_i64().unwrap()).collect();

    let resp = d
        .call(&Request::Reload {
            target: "workers".into(),
        })
        .await;
    assert!(resp.success, "reload failed: {:?}", resp.error);
    let after = resp.data.as_array().unwrap();
    assert_eq!(after.len(), 2);
    for s in after {
        assert_eq!(s["status"], "online");
        assert_eq!(s["bm2_env"]["restart_time"], 1);
        let pid = s["pid"].as_i64().unwrap();
        assert!(!old_pids.contains(&pid), "pid {pid} survived the reload");
    }

    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn save_and_resurrect_across_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let home = BmHome::at(dir.path().join("home"));

    let d = boot_at(home.clone(), None).await;
    assert!(d.call(&spec_req(sh_spec("one", "sleep 60"), json!({}))).await.success);
    assert!(d
        .call(&spec_req(
            sh_spec("two", "sleep 60"),
            json!({"namespace": "batch", "max_restarts": 5})
        ))
        .await
        .success);
    assert!(d.call(&Request::Save).await.success);
    assert!(home.dump_file().exists());
    d.kill().await;

    let d = boot_at(home, None).await;
    assert!(d.list().await.is_empty());
    let resp = d.call(&Request::Resurrect).await;
    assert!(resp.success, "resurrect failed: {:?}", resp.error);
    let states = d.list().await;
    let mut names: Vec<&str> = states.iter().map(|s| s["name"].as_str().unwrap()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["one", "two"]);
    let two = by_name(&states, "two").unwrap();
    assert_eq!(two["bm2_env"]["namespace"], "batch");
    assert_eq!(two["bm2_env"]["max_restarts"], 5);

    d.kill().await;
    drop(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metrics_and_prometheus_answer() {
    let d = boot().await;
    assert!(d.call(&spec_req(sh_spec("m", "sleep 30"), json!({}))).await.success);
    d.wait_until("m online", Duration::from_secs(3), |s| {
        by_name(s, "m").map(|e| e["status"] == "online").unwrap_or(false)
    })
    .await;

    // Two monitor ticks at 200 ms.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let resp = d.call(&Request::Metrics).await;
    assert!(resp.success);
    assert!(resp.data["ts_ms"].is_i64(), "no snapshot yet: {:?}", resp.data);

    let resp = d
        .call(&Request::MetricsHistory { seconds: 60 })
        .await;
    assert!(resp.success);
    assert!(!resp.data.as_array().unwrap().is_empty());

    let resp = d.call(&Request::Prometheus).await;
    assert!(resp.success);
    let text = resp.data.as_str().unwrap();
    assert!(text.contains("bm2_process_status{name=\"m\",id=\"0\",status=\"online\"} 1"));

    d.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_removes_the_entry_and_reaps_the_child() {
    let d = boot().await;
    assert!(d.call(&spec_req(sh_spec("gone", "sleep 60"), json!({}))).await.success);
    let states = d
        .wait_until("gone online", Duration::from_secs(3), |s| {
            by_name(s, "gone").map(|e| e["status"] == "online").unwrap_or(false)
        })
        .await;
    let pid = by_name(&states, "gone").unwrap()["pid"].as_i64().unwrap() as i32;

    let resp = d
        .call(&Request::Delete {
            target: "gone".into(),
        })
        .await;
    assert!(resp.success);
    assert!(d.list().await.is_empty());

    // The child is reaped shortly after.
    for _ in 0..40 {
        if !bm2::bm::child::pid_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!bm2::bm::child::pid_alive(pid));

    d.kill().await;
}
