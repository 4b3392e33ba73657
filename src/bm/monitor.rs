use crate::bm::asyncutil::tasks;
use crate::bm::events::bm_event;
use crate::bm::service::{ProcessState, ResourceSample, ServiceState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// One hour of history at 1 Hz.
const RING_MAX: usize = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSample {
    pub id: u64,
    pub name: String,
    pub pid: i32,
    #[serde(flatten)]
    pub sample: ResourceSample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub ts_ms: i64,
    pub services: Vec<ServiceSample>,
}

/// Bounded time-ordered buffer of snapshots. Single writer (the monitor),
/// copy-out readers.
#[derive(Debug, Clone, Default)]
pub struct MetricsRing {
    inner: Arc<Mutex<VecDeque<MetricSnapshot>>>,
}

impl MetricsRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, snap: MetricSnapshot) {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(snap);
        while g.len() > RING_MAX {
            g.pop_front();
        }
    }

    pub fn latest(&self) -> Option<MetricSnapshot> {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.back().cloned()
    }

    /// Snapshots from the last `seconds` of wall clock.
    pub fn history(&self, seconds: u64) -> Vec<MetricSnapshot> {
        let cutoff = Utc::now()
            .timestamp_millis()
            .saturating_sub(i64::try_from(seconds).unwrap_or(i64::MAX).saturating_mul(1000));
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.iter().filter(|s| s.ts_ms >= cutoff).cloned().collect()
    }
}

/// What the monitor needs to know about each live child.
#[derive(Debug, Clone)]
pub struct OnlineProc {
    pub id: u64,
    pub name: String,
    pub pid: i32,
    pub memory_cap: Option<u64>,
}

struct CpuPrev {
    total_ticks: u64,
    at: Instant,
}

fn clock_ticks_per_second() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}

fn read_rss_proc(pid: i32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

fn read_cpu_ticks_proc(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces; fields are counted after the closing paren.
    let after = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of stat, i.e. 11 and 12 after comm.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_fd_count_proc(pid: i32) -> Option<u32> {
    let dir = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    Some(dir.count() as u32)
}

fn read_via_ps(pid: i32) -> Option<(u64, f64)> {
    let out = std::process::Command::new("ps")
        .args(["-o", "rss=,pcpu=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout);
    let mut it = text.split_whitespace();
    let rss_kb: u64 = it.next()?.parse().ok()?;
    let pcpu: f64 = it.next()?.parse().ok()?;
    Some((rss_kb * 1024, pcpu))
}

/// Resource sampler: 1 Hz (configurable) over every online child. Posts the
/// latest sample and any memory-cap breach back through `report`; appends a
/// snapshot to the ring.
pub fn start_monitor<Q, R>(
    interval: Duration,
    ring: MetricsRing,
    query_online: Q,
    report: R,
) -> JoinHandle<()>
where
    Q: Fn() -> tokio::sync::oneshot::Receiver<Vec<OnlineProc>> + Send + Sync + 'static,
    R: Fn(u64, ResourceSample, Option<u64>) + Send + Sync + 'static,
{
    tasks().spawn(async move {
        let hz = clock_ticks_per_second();
        let mut prev: HashMap<i32, CpuPrev> = HashMap::new();
        loop {
            tokio::time::sleep(interval).await;
            let procs = match query_online().await {
                Ok(p) => p,
                // Supervisor gone: daemon is shutting down.
                Err(_) => return,
            };
            prev.retain(|pid, _| procs.iter().any(|p| p.pid == *pid));

            let mut services = Vec::with_capacity(procs.len());
            for p in &procs {
                let sample = sample_one(p.pid, hz, &mut prev);
                let Some(sample) = sample else {
                    // Raced with exit; the reaper will deliver ChildExited.
                    continue;
                };
                let over_cap = match p.memory_cap {
                    Some(cap) if sample.rss > cap => Some(sample.rss),
                    _ => None,
                };
                if let Some(rss) = over_cap {
                    bm_event(
                        "monitor",
                        Some(&p.name),
                        format!("memory_exceeded rss={rss} cap={}", p.memory_cap.unwrap_or(0)),
                    );
                }
                report(p.id, sample, over_cap);
                services.push(ServiceSample {
                    id: p.id,
                    name: p.name.clone(),
                    pid: p.pid,
                    sample,
                });
            }
            ring.push(MetricSnapshot {
                ts_ms: Utc::now().timestamp_millis(),
                services,
            });
        }
    })
}

fn sample_one(pid: i32, hz: u64, prev: &mut HashMap<i32, CpuPrev>) -> Option<ResourceSample> {
    let now = Instant::now();
    if let Some(rss) = read_rss_proc(pid) {
        let ticks = read_cpu_ticks_proc(pid)?;
        let cpu = match prev.get(&pid) {
            Some(p) => {
                let dt = now.duration_since(p.at).as_secs_f64();
                if dt > 0.0 {
                    let dticks = ticks.saturating_sub(p.total_ticks) as f64;
                    (dticks / hz as f64 / dt * 100.0).max(0.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        prev.insert(
            pid,
            CpuPrev {
                total_ticks: ticks,
                at: now,
            },
        );
        return Some(ResourceSample {
            rss,
            cpu,
            fds: read_fd_count_proc(pid),
            ts_ms: Utc::now().timestamp_millis(),
        });
    }
    // No /proc on this host: one `ps` per live pid.
    let (rss, cpu) = read_via_ps(pid)?;
    Some(ResourceSample {
        rss,
        cpu,
        fds: None,
        ts_ms: Utc::now().timestamp_millis(),
    })
}

fn system_memory() -> (u64, u64) {
    let Ok(text) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    parse_meminfo(&text)
}

fn parse_meminfo(text: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut free = 0u64;
    for line in text.lines() {
        let kb = |rest: &str| -> u64 {
            rest.trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0)
                * 1024
        };
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            free = kb(rest);
        }
    }
    (total, free)
}

fn load_average() -> [f64; 3] {
    let mut avg = [0.0f64; 3];
    let n = unsafe { libc::getloadavg(avg.as_mut_ptr(), 3) };
    if n < 3 {
        return [0.0; 3];
    }
    avg
}

/// Prometheus text exposition: the five per-process families plus the three
/// system families, each with `# HELP` / `# TYPE` preambles.
pub fn render_prometheus(states: &[ProcessState]) -> String {
    let now_ms = Utc::now().timestamp_millis();
    let mut out = String::new();

    out.push_str("# HELP bm2_process_cpu CPU usage percent per process\n");
    out.push_str("# TYPE bm2_process_cpu gauge\n");
    for s in states {
        out.push_str(&format!(
            "bm2_process_cpu{{name=\"{}\",id=\"{}\"}} {}\n",
            s.name, s.id, s.monit.cpu
        ));
    }

    out.push_str("# HELP bm2_process_memory_bytes Resident set size per process\n");
    out.push_str("# TYPE bm2_process_memory_bytes gauge\n");
    for s in states {
        out.push_str(&format!(
            "bm2_process_memory_bytes{{name=\"{}\",id=\"{}\"}} {}\n",
            s.name, s.id, s.monit.memory
        ));
    }

    out.push_str("# HELP bm2_process_restarts_total Restarts per process\n");
    out.push_str("# TYPE bm2_process_restarts_total counter\n");
    for s in states {
        out.push_str(&format!(
            "bm2_process_restarts_total{{name=\"{}\",id=\"{}\"}} {}\n",
            s.name, s.id, s.bm2_env.restart_time
        ));
    }

    out.push_str("# HELP bm2_process_uptime_seconds Uptime per process; 0 when not online\n");
    out.push_str("# TYPE bm2_process_uptime_seconds gauge\n");
    for s in states {
        let uptime_s = if s.status == ServiceState::Online && s.bm2_env.pm_uptime > 0 {
            ((now_ms - s.bm2_env.pm_uptime).max(0) as f64) / 1000.0
        } else {
            0.0
        };
        out.push_str(&format!(
            "bm2_process_uptime_seconds{{name=\"{}\",id=\"{}\"}} {uptime_s}\n",
            s.name, s.id
        ));
    }

    out.push_str("# HELP bm2_process_status 1 when the process is online\n");
    out.push_str("# TYPE bm2_process_status gauge\n");
    for s in states {
        let v = if s.status == ServiceState::Online { 1 } else { 0 };
        out.push_str(&format!(
            "bm2_process_status{{name=\"{}\",id=\"{}\",status=\"{}\"}} {v}\n",
            s.name,
            s.id,
            s.status.as_str()
        ));
    }

    let (mem_total, mem_free) = system_memory();
    out.push_str("# HELP bm2_system_memory_total_bytes Host memory total\n");
    out.push_str("# TYPE bm2_system_memory_total_bytes gauge\n");
    out.push_str(&format!("bm2_system_memory_total_bytes {mem_total}\n"));
    out.push_str("# HELP bm2_system_memory_free_bytes Host memory available\n");
    out.push_str("# TYPE bm2_system_memory_free_bytes gauge\n");
    out.push_str(&format!("bm2_system_memory_free_bytes {mem_free}\n"));

    let load = load_average();
    out.push_str("# HELP bm2_system_load_average Host load average\n");
    out.push_str("# TYPE bm2_system_load_average gauge\n");
    for (period, v) in [("1m", load[0]), ("5m", load[1]), ("15m", load[2])] {
        out.push_str(&format!("bm2_system_load_average{{period=\"{period}\"}} {v}\n"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm::service::ServiceEntry;

    fn entry(name: &str, id: u64) -> ServiceEntry {
        let spec =
            serde_json::from_str(&format!(r#"{{"name":"{name}","script":"a.js"}}"#)).unwrap();
        ServiceEntry::new(id, spec, name.to_string())
    }

    #[test]
    fn ring_is_bounded_and_time_filtered() {
        let ring = MetricsRing::new();
        let now = Utc::now().timestamp_millis();
        for i in 0..4000u64 {
            ring.push(MetricSnapshot {
                ts_ms: now - 4000 * 1000 + (i as i64) * 1000,
                services: vec![],
            });
        }
        assert!(ring.history(u64::MAX).len() <= RING_MAX);
        let recent = ring.history(10);
        assert!(recent.len() <= 11);
        assert!(recent.iter().all(|s| s.ts_ms >= now - 10_000));
        assert!(ring.latest().is_some());
    }

    #[test]
    fn meminfo_parsing() {
        let text = "MemTotal:       16307448 kB\nMemFree:         1000000 kB\nMemAvailable:    8000000 kB\n";
        let (total, free) = parse_meminfo(text);
        assert_eq!(total, 16_307_448 * 1024);
        assert_eq!(free, 8_000_000 * 1024);
    }

    #[test]
    fn prometheus_families_render() {
        let mut a = entry("api", 0);
        a.state = ServiceState::Online;
        a.started_at = Utc::now().timestamp_millis() - 5000;
        a.restart_count = 2;
        a.sample.rss = 1024;
        a.sample.cpu = 3.5;
        let b = entry("worker", 1);
        let text = render_prometheus(&[a.to_process_state(), b.to_process_state()]);

        for family in [
            "bm2_process_cpu",
            "bm2_process_memory_bytes",
            "bm2_process_restarts_total",
            "bm2_process_uptime_seconds",
            "bm2_process_status",
            "bm2_system_memory_total_bytes",
            "bm2_system_memory_free_bytes",
            "bm2_system_load_average",
        ] {
            assert!(
                text.contains(&format!("# HELP {family}")),
                "missing HELP for {family}"
            );
            assert!(
                text.contains(&format!("# TYPE {family}")),
                "missing TYPE for {family}"
            );
        }
        assert!(text.contains("bm2_process_cpu{name=\"api\",id=\"0\"} 3.5"));
        assert!(text.contains("bm2_process_restarts_total{name=\"api\",id=\"0\"} 2"));
        assert!(text.contains("bm2_process_status{name=\"api\",id=\"0\",status=\"online\"} 1"));
        assert!(text.contains("bm2_process_status{name=\"worker\",id=\"1\",status=\"stopped\"} 0"));
        // Stopped entries expose zero uptime.
        assert!(text.contains("bm2_process_uptime_seconds{name=\"worker\",id=\"1\"} 0\n"));
    }
}
