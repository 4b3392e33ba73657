use crate::bm::asyncutil::tasks;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const EVENT_RING_MAX: usize = 5000;
const EARLY_LOG_MAX_LINES: usize = 5000;

// Daemon log file defaults (independent of per-service stdout/stderr logs).
const DAEMON_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DAEMON_LOG_BACKUPS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    #[serde(default)]
    pub service: Option<String>,
    pub message: String,
}

static EVENTS: OnceLock<Mutex<VecDeque<EventEntry>>> = OnceLock::new();
static DAEMON_LOG_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();
static EARLY_DAEMON_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn ring() -> &'static Mutex<VecDeque<EventEntry>> {
    EVENTS.get_or_init(|| Mutex::new(VecDeque::new()))
}

/// Record a structured daemon event: stderr, the in-memory ring, and (once
/// initialised) the daemon log file. Message texture is `key=value` pairs.
pub fn bm_event(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string();
    let line = match service {
        Some(s) => format!("{ts} [{component}] service={s} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");

    if let Some(tx) = DAEMON_LOG_TX.get() {
        let _ = tx.send(line);
    } else {
        let q = EARLY_DAEMON_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_LOG_MAX_LINES {
            g.pop_front();
        }
    }

    let mut q = ring().lock().unwrap_or_else(|p| p.into_inner());
    q.push_back(EventEntry {
        ts,
        component: component.to_string(),
        service: service.map(|s| s.to_string()),
        message: msg.as_ref().to_string(),
    });
    while q.len() > EVENT_RING_MAX {
        q.pop_front();
    }
}

/// Copy-out of the most recent `n` events, optionally filtered by service.
pub fn recent_events(service: Option<&str>, n: usize) -> Vec<EventEntry> {
    let q = ring().lock().unwrap_or_else(|p| p.into_inner());
    let mut matched: Vec<EventEntry> = q
        .iter()
        .filter(|e| match service {
            Some(s) => e.service.as_deref() == Some(s),
            None => true,
        })
        .cloned()
        .collect();
    if matched.len() > n {
        matched.drain(0..matched.len() - n);
    }
    matched
}

/// Start the daemon log file writer. Every `bm_event` line is mirrored here;
/// the file rotates by size with numbered gzip backups like service logs.
pub fn start_daemon_log_file(path: PathBuf) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if DAEMON_LOG_TX.set(tx).is_err() {
        return;
    }

    bm_event(
        "log",
        None,
        format!(
            "daemon_log_file path={} rotate=size max_bytes={DAEMON_LOG_MAX_BYTES} backups={DAEMON_LOG_BACKUPS}",
            path.display()
        ),
    );

    tasks().spawn(async move {
        let mut f = match crate::bm::logs::open_append(&path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!("failed to open daemon log file {}: {e}", path.display());
                return;
            }
        };

        // Flush early boot lines captured before the writer existed.
        if let Some(q) = EARLY_DAEMON_LOG.get() {
            // Do not hold the mutex guard across an await point.
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for mut s in drained {
                s.push('\n');
                let _ = f.write_all(s.as_bytes()).await;
            }
            let _ = f.flush().await;
        }

        let mut bytes_written: u64 = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(mut line) = rx.recv().await {
            if bytes_written >= DAEMON_LOG_MAX_BYTES {
                let _ = f.flush().await;
                if crate::bm::logs::rotate_numbered(&path, DAEMON_LOG_BACKUPS, true)
                    .await
                    .is_ok()
                {
                    if let Ok(nf) = crate::bm::logs::open_append(&path).await {
                        f = nf;
                        bytes_written = 0;
                    }
                }
            }
            line.push('\n');
            if f.write_all(line.as_bytes()).await.is_ok() {
                bytes_written = bytes_written.saturating_add(line.len() as u64);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_filters_by_service() {
        bm_event("test", Some("svc-a"), "k=1");
        bm_event("test", Some("svc-b"), "k=2");
        bm_event("test", None, "k=3");
        let all = recent_events(None, 100);
        assert!(all.len() >= 3);
        let only_a = recent_events(Some("svc-a"), 100);
        assert!(only_a.iter().all(|e| e.service.as_deref() == Some("svc-a")));
    }
}
