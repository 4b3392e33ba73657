use crate::bm::error::BmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Declarative configuration of one service. Immutable per entry; replaced
/// wholesale on reconfiguration. Arrives as JSON over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,

    /// Executable or script path. Interpreter defaulting keys off the extension.
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Explicit interpreter; `"none"` execs the script directly.
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Literal count, `"max"` (host logical CPUs) or `-1` (synonym for max).
    #[serde(default = "default_instances")]
    pub instances: Instances,
    #[serde(default)]
    pub exec_mode: ExecMode,
    /// Base port for cluster workers; worker `i` sees `PORT = port + i`.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_true")]
    pub autorestart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Milliseconds a child must stay up before an exit counts as stable.
    #[serde(default = "default_min_uptime_ms")]
    pub min_uptime: u64,
    /// Delay before an automatic respawn, in milliseconds.
    #[serde(default)]
    pub restart_delay: u64,
    /// SIGTERM -> SIGKILL escalation window, in milliseconds.
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout: u64,
    /// RSS cap; crossing it triggers a restart. Accepts `"512M"` style strings.
    #[serde(default)]
    pub max_memory: Option<MemorySize>,

    #[serde(default)]
    pub watch: bool,
    /// Roots to watch; empty with `watch=true` defaults to the service cwd.
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    /// Ignore prefixes added to the built-ins (`node_modules`, `.git`, `.bm2`).
    #[serde(default)]
    pub ignore_watch: Vec<String>,

    /// Five-field cron expression; each match triggers a restart.
    #[serde(default)]
    pub cron_restart: Option<String>,

    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,

    #[serde(default)]
    pub log: LogPolicy,

    /// Readiness contract used by rolling reload.
    #[serde(default)]
    pub wait_ready: bool,
    #[serde(default)]
    pub listen_timeout: Option<u64>,
    /// Pause between reload steps in milliseconds.
    #[serde(default = "default_reload_delay_ms", alias = "delay")]
    pub reload_delay: u64,

    /// Terminate the whole descendant tree rather than just the direct child.
    #[serde(default = "default_true")]
    pub treekill: bool,
    #[serde(default)]
    pub stop_signal: Option<String>,

    /// Accepted for wire compatibility; not acted upon.
    #[serde(default)]
    pub merge_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    #[default]
    Fork,
    Cluster,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Fork => "fork",
            ExecMode::Cluster => "cluster",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub url: String,
    /// Probe cadence in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub interval: u64,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout: u64,
    /// Consecutive failures before the supervisor is told to restart.
    #[serde(default = "default_health_max_fails")]
    pub max_fails: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPolicy {
    /// Size threshold for rotation.
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    /// Rotated segments to keep.
    #[serde(default = "default_log_retain")]
    pub retain: usize,
    /// Gzip rotated segments in place.
    #[serde(default)]
    pub compress: bool,
    /// Overrides for the default `$HOME/.bm2/logs/<name>-<id>-*.log` paths.
    #[serde(default)]
    pub out_file: Option<PathBuf>,
    #[serde(default)]
    pub err_file: Option<PathBuf>,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            max_bytes: default_log_max_bytes(),
            retain: default_log_retain(),
            compress: false,
            out_file: None,
            err_file: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_instances() -> Instances {
    Instances::Count(1)
}
fn default_max_restarts() -> u32 {
    16
}
fn default_min_uptime_ms() -> u64 {
    1000
}
fn default_kill_timeout_ms() -> u64 {
    5000
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_health_timeout_ms() -> u64 {
    5000
}
fn default_health_max_fails() -> u32 {
    3
}
fn default_reload_delay_ms() -> u64 {
    1000
}
fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_retain() -> usize {
    10
}

/// Instance count: a literal, or `"max"` / `-1` meaning host logical CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instances {
    Count(u32),
    Max,
}

impl Instances {
    pub fn resolve(&self) -> usize {
        match self {
            Instances::Count(n) => (*n).max(1) as usize,
            Instances::Max => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Serialize for Instances {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Instances::Count(n) => s.serialize_u32(*n),
            Instances::Max => s.serialize_str("max"),
        }
    }
}

impl<'de> Deserialize<'de> for Instances {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;
        let v = serde_json::Value::deserialize(d)?;
        match v {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i == -1 {
                        return Ok(Instances::Max);
                    }
                    if i >= 1 && i <= u32::MAX as i64 {
                        return Ok(Instances::Count(i as u32));
                    }
                }
                Err(D::Error::custom(format!("invalid instances: {n}")))
            }
            serde_json::Value::String(s) => {
                let t = s.trim();
                if t.eq_ignore_ascii_case("max") || t == "-1" {
                    return Ok(Instances::Max);
                }
                t.parse::<u32>()
                    .ok()
                    .filter(|n| *n >= 1)
                    .map(Instances::Count)
                    .ok_or_else(|| D::Error::custom(format!("invalid instances: {s:?}")))
            }
            other => Err(D::Error::custom(format!(
                "instances must be a number or \"max\", got {other}"
            ))),
        }
    }
}

/// Byte count that deserialises from either a number or a human string
/// (`512M`, `1.5G`, case-insensitive, optional trailing `B`, binary multiples).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySize(pub u64);

impl MemorySize {
    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl Serialize for MemorySize {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;
        let v = serde_json::Value::deserialize(d)?;
        match v {
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(MemorySize)
                .ok_or_else(|| D::Error::custom("memory size must be a non-negative integer")),
            serde_json::Value::String(s) => {
                parse_memory_bytes(&s).map(MemorySize).map_err(D::Error::custom)
            }
            other => Err(D::Error::custom(format!(
                "memory size must be a number or string, got {other}"
            ))),
        }
    }
}

/// Parse `"512M"` / `"1.5G"` / `"1024"` into bytes. Malformed input is an
/// error, never zero.
pub fn parse_memory_bytes(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty memory size".to_string());
    }
    let mut idx = t.len();
    for (i, ch) in t.char_indices() {
        if !(ch.is_ascii_digit() || ch == '.') {
            idx = i;
            break;
        }
    }
    if idx == 0 {
        return Err(format!("invalid memory size: {s:?}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid memory size {s:?}: {e}"))?;
    if num < 0.0 || !num.is_finite() {
        return Err(format!("invalid memory size: {s:?}"));
    }
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1024.0,
        "m" | "mb" => 1024.0 * 1024.0,
        "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(format!("unknown memory unit {unit_s:?} (use K/M/G)")),
    };
    Ok((num * mult).round() as u64)
}

impl ServiceSpec {
    /// Admission validation: reject before any entry is created.
    pub fn validate(&self) -> Result<(), BmError> {
        if self.name.trim().is_empty() {
            return Err(BmError::InvalidSpec("service name must not be empty".into()));
        }
        if self.script.trim().is_empty() {
            return Err(BmError::InvalidSpec(format!(
                "service {}: script path must not be empty",
                self.name
            )));
        }
        if let Some(expr) = self.cron_restart.as_deref() {
            crate::bm::cron::validate(expr).map_err(|e| {
                BmError::InvalidSpec(format!("service {}: bad cron {expr:?}: {e}", self.name))
            })?;
        }
        if let Some(hc) = &self.health_check {
            if !(hc.url.starts_with("http://") || hc.url.starts_with("https://")) {
                return Err(BmError::InvalidSpec(format!(
                    "service {}: health url must be http(s): {:?}",
                    self.name, hc.url
                )));
            }
            if hc.interval == 0 {
                return Err(BmError::InvalidSpec(format!(
                    "service {}: health interval must be > 0",
                    self.name
                )));
            }
        }
        if let Some(sig) = self.stop_signal.as_deref() {
            crate::bm::child::parse_signal(sig).map_err(|e| {
                BmError::InvalidSpec(format!("service {}: {e}", self.name))
            })?;
        }
        Ok(())
    }

    /// Effective kill timeout; `0` means SIGKILL immediately after SIGTERM.
    pub fn kill_timeout_ms(&self) -> u64 {
        self.kill_timeout
    }
}

/// How a script is launched: the resolved argv prefix in front of the script
/// path. Extension defaulting mirrors the original runtime: JS family goes
/// through the JavaScript runtime's `run` subcommand, `.py` through python3,
/// anything else through the JavaScript runtime. `interpreter: "none"` execs
/// the script as-is.
pub fn resolve_interpreter(spec: &ServiceSpec) -> Vec<String> {
    if let Some(interp) = spec.interpreter.as_deref() {
        let t = interp.trim();
        if t.is_empty() || t.eq_ignore_ascii_case("none") {
            return vec![];
        }
        return t.split_whitespace().map(|s| s.to_string()).collect();
    }
    let ext = std::path::Path::new(&spec.script)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("js" | "jsx" | "ts" | "tsx" | "mjs") => {
            vec!["bun".to_string(), "run".to_string()]
        }
        Some("py") => vec!["python3".to_string()],
        _ => vec!["bun".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_json(extra: &str) -> ServiceSpec {
        let mut base: serde_json::Value =
            serde_json::json!({"name": "web", "script": "server.js"});
        let extra_obj: serde_json::Value =
            serde_json::from_str(&format!("{{{}}}", extra.trim_start_matches(','))).unwrap();
        if let (Some(base_map), serde_json::Value::Object(extra_map)) =
            (base.as_object_mut(), extra_obj)
        {
            for (k, v) in extra_map {
                base_map.insert(k, v);
            }
        }
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let s = spec_json("");
        assert!(s.autorestart);
        assert_eq!(s.max_restarts, 16);
        assert_eq!(s.min_uptime, 1000);
        assert_eq!(s.kill_timeout, 5000);
        assert_eq!(s.instances, Instances::Count(1));
        assert_eq!(s.exec_mode, ExecMode::Fork);
        assert!(s.treekill);
        assert_eq!(s.log.retain, 10);
    }

    #[test]
    fn instances_accepts_max_and_minus_one() {
        let a = spec_json(r#","instances":"max""#);
        let b = spec_json(r#","instances":-1"#);
        let c = spec_json(r#","instances":4"#);
        assert_eq!(a.instances, Instances::Max);
        assert_eq!(b.instances, Instances::Max);
        assert_eq!(a.instances.resolve(), b.instances.resolve());
        assert_eq!(c.instances.resolve(), 4);
        assert!(serde_json::from_str::<ServiceSpec>(
            r#"{"name":"x","script":"a","instances":0}"#
        )
        .is_err());
    }

    #[test]
    fn memory_parse_laws() {
        assert_eq!(parse_memory_bytes("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(
            parse_memory_bytes("1.5G").unwrap(),
            (1.5 * 1024.0 * 1024.0 * 1024.0) as u64
        );
        assert_eq!(parse_memory_bytes("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("100kb").unwrap(), 100 * 1024);
        assert_eq!(parse_memory_bytes("1024").unwrap(), 1024);
        assert!(parse_memory_bytes("").is_err());
        assert!(parse_memory_bytes("12X").is_err());
        assert!(parse_memory_bytes("garbage").is_err());
    }

    #[test]
    fn memory_size_from_json_number_or_string() {
        let a = spec_json(r#","max_memory":"50M""#);
        let b = spec_json(r#","max_memory":52428800"#);
        assert_eq!(a.max_memory.unwrap().bytes(), 50 * 1024 * 1024);
        assert_eq!(b.max_memory.unwrap().bytes(), 52_428_800);
    }

    #[test]
    fn validation_rejects_bad_specs() {
        let blank_script = serde_json::from_str::<ServiceSpec>(r#"{"name":"x","script":" "}"#)
            .unwrap();
        assert!(matches!(blank_script.validate(), Err(BmError::InvalidSpec(_))));

        let bad_cron = spec_json(r#","cron_restart":"not a cron""#);
        assert!(matches!(bad_cron.validate(), Err(BmError::InvalidSpec(_))));

        let bad_url = spec_json(r#","health_check":{"url":"ftp://x/health"}"#);
        assert!(matches!(bad_url.validate(), Err(BmError::InvalidSpec(_))));

        let good = spec_json(
            r#","cron_restart":"*/5 * * * *","health_check":{"url":"http://127.0.0.1:8080/health"}"#,
        );
        assert!(good.validate().is_ok());
    }

    #[test]
    fn interpreter_defaulting() {
        let js = spec_json("");
        assert_eq!(resolve_interpreter(&js), vec!["bun", "run"]);

        let ts = spec_json(r#","script":"main.ts""#);
        assert_eq!(resolve_interpreter(&ts), vec!["bun", "run"]);

        let py = spec_json(r#","script":"app.py""#);
        assert_eq!(resolve_interpreter(&py), vec!["python3"]);

        let bin = spec_json(r#","script":"./server""#);
        assert_eq!(resolve_interpreter(&bin), vec!["bun"]);

        let none = spec_json(r#","script":"/bin/sh","interpreter":"none""#);
        assert!(resolve_interpreter(&none).is_empty());

        let custom = spec_json(r#","script":"job.rb","interpreter":"ruby""#);
        assert_eq!(resolve_interpreter(&custom), vec!["ruby"]);
    }
}
