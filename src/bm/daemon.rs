use crate::bm::asyncutil::tasks;
use crate::bm::child::pid_alive;
use crate::bm::cli::Args;
use crate::bm::error::BmError;
use crate::bm::events::{bm_event, start_daemon_log_file};
use crate::bm::ipc::{self, IpcContext, Request};
use crate::bm::monitor::{self, MetricsRing};
use crate::bm::paths::BmHome;
use crate::bm::supervisor::{self, Event};
use std::time::{Duration, Instant};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// Daemon entry point: single-instance guard, home layout, supervision
/// engine, monitor, IPC accept loop, graceful shutdown.
pub async fn run_daemon(home: BmHome, args: Args) -> anyhow::Result<()> {
    if args.build_info {
        println!("{}", crate::bm::build_info::banner());
        return Ok(());
    }

    home.ensure_dirs()?;
    guard_single_instance(&home).await?;
    write_pid_file(&home)?;

    start_daemon_log_file(home.daemon_log());
    bm_event("boot", None, crate::bm::build_info::banner());

    let sock = home.socket();
    let listener = UnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;

    let handle = supervisor::start(home.clone());
    let ring = MetricsRing::new();
    {
        let q_handle = handle.clone();
        let r_handle = handle.clone();
        monitor::start_monitor(
            Duration::from_millis(args.monitor_interval_ms.max(100)),
            ring.clone(),
            move || q_handle.request_online(),
            move |id, sample, over_cap| {
                r_handle.post(Event::SampleTaken { id, sample });
                if let Some(rss) = over_cap {
                    r_handle.post(Event::MemoryExceeded { id, rss });
                }
            },
        );
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    start_signal_listener(shutdown_tx.clone());

    let ctx = IpcContext {
        handle: handle.clone(),
        ring,
        shutdown: shutdown_tx,
        boot: Instant::now(),
    };

    bm_event("rpc", None, format!("listening sock={}", sock.display()));

    loop {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        tasks().spawn(async move {
                            if let Err(e) = ipc::handle_connection(ctx, stream).await {
                                bm_event("rpc", None, format!("connection_error err={e:#}"));
                            }
                        });
                    }
                    Err(e) => {
                        bm_event("rpc", None, format!("accept_error err={e}"));
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    bm_event("shutdown", None, "stopping all services");
    handle.shutdown().await;
    let _ = std::fs::remove_file(&sock);
    let _ = std::fs::remove_file(home.pid_file());
    bm_event("shutdown", None, "done");
    Ok(())
}

fn start_signal_listener(tx: tokio::sync::watch::Sender<bool>) {
    tasks().spawn(async move {
        let Ok(mut term) = unix_signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut int) = unix_signal(SignalKind::interrupt()) else {
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        let _ = tx.send(true);
    });
}

fn write_pid_file(home: &BmHome) -> anyhow::Result<()> {
    let path = home.pid_file();
    std::fs::write(&path, format!("{}\n", std::process::id()))
        .map_err(|e| anyhow::anyhow!("failed to write pid file {}: {e}", path.display()))
}

/// One supervisor per host (per home): if the pid file's process is alive and
/// the socket answers a ping, refuse to start; otherwise clear stale
/// artefacts and continue.
async fn guard_single_instance(home: &BmHome) -> anyhow::Result<()> {
    let pid_path = home.pid_file();
    let sock = home.socket();

    let recorded_pid: Option<i32> = std::fs::read_to_string(&pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok());

    if let Some(pid) = recorded_pid {
        if pid_alive(pid) && sock.exists() {
            let ping = tokio::time::timeout(
                Duration::from_secs(1),
                ipc::client_call(&sock, &Request::Ping, "preflight"),
            )
            .await;
            if matches!(ping, Ok(Ok(resp)) if resp.success) {
                anyhow::bail!(BmError::AlreadyRunning(format!(
                    "pid {pid} holds {} and answers ping",
                    sock.display()
                )));
            }
        }
    }

    // Stale leftovers from an unclean shutdown.
    if sock.exists() {
        std::fs::remove_file(&sock)
            .map_err(|e| anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display()))?;
    }
    if pid_path.exists() {
        let _ = std::fs::remove_file(&pid_path);
    }
    Ok(())
}
