use crate::bm::asyncutil::tasks;
use crate::bm::error::BmError;
use crate::bm::events::bm_event;
use crate::bm::logs::tail_lines;
use crate::bm::monitor::{render_prometheus, MetricsRing};
use crate::bm::reload;
use crate::bm::spec::ServiceSpec;
use crate::bm::supervisor::{Command, Payload, SupervisorHandle};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn default_log_lines() -> usize {
    50
}

/// Control protocol requests. The `type` strings are wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Request {
    Start(ServiceSpec),
    Ecosystem { apps: Vec<ServiceSpec> },
    Stop { target: String },
    StopAll,
    Restart { target: String },
    RestartAll,
    Reload { target: String },
    ReloadAll,
    Delete { target: String },
    DeleteAll,
    Reset { target: String },
    Scale { target: String, count: u32 },
    Signal { target: String, signal: String },
    List,
    Describe { target: String },
    Logs {
        target: String,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    Flush {
        #[serde(default)]
        target: Option<String>,
    },
    Metrics,
    MetricsHistory { seconds: u64 },
    Prometheus,
    Save,
    Resurrect,
    Ping,
    Kill,
}

/// Raw inbound frame: `{"type": ..., "data": ..., "id": ...}`.
#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    id: String,
}

/// Outbound frame; `id` mirrors the request for correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub ty: String,
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub id: String,
}

impl ResponseFrame {
    fn ok(ty: &str, id: &str, data: Value) -> Self {
        Self {
            ty: ty.to_string(),
            success: true,
            data,
            error: None,
            id: id.to_string(),
        }
    }

    fn err(ty: &str, id: &str, e: &BmError) -> Self {
        Self {
            ty: ty.to_string(),
            success: false,
            data: Value::Null,
            error: Some(e.to_string()),
            id: id.to_string(),
        }
    }
}

/// Everything the dispatcher needs; cheap to clone per connection.
#[derive(Debug, Clone)]
pub struct IpcContext {
    pub handle: SupervisorHandle,
    pub ring: MetricsRing,
    pub shutdown: tokio::sync::watch::Sender<bool>,
    pub boot: Instant,
}

/// One connection: newline-framed requests, each dispatched concurrently so
/// a slow operation never blocks `ping` on the same connection. Responses
/// share the write half under a lock.
pub async fn handle_connection(ctx: IpcContext, stream: UnixStream) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let ctx = ctx.clone();
        let writer = Arc::clone(&writer);
        tasks().spawn(async move {
            let resp = process_line(&ctx, &line).await;
            let mut encoded = match serde_json::to_string(&resp) {
                Ok(s) => s,
                Err(e) => format!(
                    r#"{{"type":"{}","success":false,"data":null,"error":"Internal: encode: {e}","id":"{}"}}"#,
                    resp.ty, resp.id
                ),
            };
            encoded.push('\n');
            let mut w = writer.lock().await;
            let _ = w.write_all(encoded.as_bytes()).await;
            let _ = w.flush().await;
        });
    }
    Ok(())
}

async fn process_line(ctx: &IpcContext, line: &str) -> ResponseFrame {
    let frame: RequestFrame = match serde_json::from_str(line.trim_end()) {
        Ok(f) => f,
        Err(e) => {
            return ResponseFrame::err(
                "error",
                "",
                &BmError::InvalidSpec(format!("malformed request frame: {e}")),
            );
        }
    };

    let req = match decode_request(&frame) {
        Ok(r) => r,
        Err(e) => return ResponseFrame::err(&frame.ty, &frame.id, &e),
    };

    match dispatch(ctx, req).await {
        Ok(data) => ResponseFrame::ok(&frame.ty, &frame.id, data),
        Err(e) => {
            bm_event("rpc", None, format!("request={} outcome=error err={e}", frame.ty));
            ResponseFrame::err(&frame.ty, &frame.id, &e)
        }
    }
}

fn decode_request(frame: &RequestFrame) -> Result<Request, BmError> {
    // Unit requests arrive with `data` absent or null; struct requests with
    // an object. Try the natural shape first, then the other.
    let primary = if frame.data.is_null() {
        json!({ "type": frame.ty })
    } else {
        json!({ "type": frame.ty, "data": frame.data })
    };
    if let Ok(r) = serde_json::from_value::<Request>(primary) {
        return Ok(r);
    }
    let fallback = json!({ "type": frame.ty, "data": {} });
    serde_json::from_value::<Request>(fallback)
        .map_err(|e| BmError::InvalidSpec(format!("bad request {:?}: {e}", frame.ty)))
}

fn states_value(payload: Payload) -> Result<Value, BmError> {
    serde_json::to_value(payload.into_states())
        .map_err(|e| BmError::Internal(format!("encode states: {e}")))
}

fn ack() -> Value {
    json!({ "ack": true })
}

async fn dispatch(ctx: &IpcContext, req: Request) -> Result<Value, BmError> {
    match req {
        Request::Start(spec) => {
            states_value(ctx.handle.command(Command::Start { spec }).await?)
        }
        Request::Ecosystem { apps } => {
            states_value(ctx.handle.command(Command::Ecosystem { apps }).await?)
        }
        Request::Stop { target } => {
            states_value(ctx.handle.command(Command::Stop { target }).await?)
        }
        Request::StopAll => states_value(
            ctx.handle
                .command(Command::Stop {
                    target: "all".into(),
                })
                .await?,
        ),
        Request::Restart { target } => {
            states_value(ctx.handle.command(Command::Restart { target }).await?)
        }
        Request::RestartAll => states_value(
            ctx.handle
                .command(Command::Restart {
                    target: "all".into(),
                })
                .await?,
        ),
        Request::Reload { target } => do_reload(ctx, target).await,
        Request::ReloadAll => do_reload(ctx, "all".into()).await,
        Request::Delete { target } => {
            states_value(ctx.handle.command(Command::Delete { target }).await?)
        }
        Request::DeleteAll => states_value(
            ctx.handle
                .command(Command::Delete {
                    target: "all".into(),
                })
                .await?,
        ),
        Request::Reset { target } => {
            states_value(ctx.handle.command(Command::Reset { target }).await?)
        }
        Request::Scale { target, count } => {
            states_value(ctx.handle.command(Command::Scale { target, count }).await?)
        }
        Request::Signal { target, signal } => {
            ctx.handle.command(Command::Signal { target, signal }).await?;
            Ok(ack())
        }
        Request::List => states_value(ctx.handle.command(Command::List).await?),
        Request::Describe { target } => {
            states_value(ctx.handle.command(Command::Describe { target }).await?)
        }
        Request::Logs { target, lines } => do_logs(ctx, target, lines).await,
        Request::Flush { target } => {
            ctx.handle.command(Command::Flush { target }).await?;
            Ok(ack())
        }
        Request::Metrics => {
            let snap = ctx.ring.latest();
            serde_json::to_value(snap).map_err(|e| BmError::Internal(format!("encode: {e}")))
        }
        Request::MetricsHistory { seconds } => {
            let snaps = ctx.ring.history(seconds);
            serde_json::to_value(snaps).map_err(|e| BmError::Internal(format!("encode: {e}")))
        }
        Request::Prometheus => {
            let states = ctx.handle.command(Command::List).await?.into_states();
            Ok(Value::String(render_prometheus(&states)))
        }
        Request::Save => {
            ctx.handle.command(Command::Save).await?;
            Ok(ack())
        }
        Request::Resurrect => states_value(ctx.handle.command(Command::Resurrect).await?),
        Request::Ping => Ok(json!({
            "pid": std::process::id(),
            "uptime_seconds": ctx.boot.elapsed().as_secs(),
        })),
        Request::Kill => {
            // Ack first; the accept loop observes the flag right after.
            let tx = ctx.shutdown.clone();
            tasks().spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                let _ = tx.send(true);
            });
            Ok(ack())
        }
    }
}

async fn do_reload(ctx: &IpcContext, target: String) -> Result<Value, BmError> {
    let ids: Vec<u64> = ctx
        .handle
        .command(Command::Describe { target })
        .await?
        .into_states()
        .iter()
        .map(|s| s.id)
        .collect();
    reload::rolling_reload(&ctx.handle, &ids).await?;
    let states = ctx.handle.describe_ids(ids).await;
    serde_json::to_value(states).map_err(|e| BmError::Internal(format!("encode: {e}")))
}

async fn do_logs(ctx: &IpcContext, target: String, lines: usize) -> Result<Value, BmError> {
    let targets = match ctx.handle.command(Command::LogTargets { target }).await? {
        Payload::LogTargets(t) => t,
        _ => vec![],
    };
    let mut out = Vec::with_capacity(targets.len());
    for t in targets {
        let name = t.name.clone();
        let id = t.id;
        let tails = tasks()
            .spawn_blocking(move || {
                (
                    tail_lines(&t.out, lines).unwrap_or_default(),
                    tail_lines(&t.err, lines).unwrap_or_default(),
                )
            })
            .await
            .map_err(|e| BmError::Internal(format!("join: {e}")))?;
        out.push(json!({
            "name": name,
            "id": id,
            "out": tails.0,
            "err": tails.1,
        }));
    }
    Ok(Value::Array(out))
}

/// One request/response round trip; used by the single-instance guard and by
/// the integration tests (the real control client lives elsewhere).
pub async fn client_call(sock: &Path, req: &Request, id: &str) -> anyhow::Result<ResponseFrame> {
    let stream = UnixStream::connect(sock)
        .await
        .map_err(|e| anyhow::anyhow!("connect {}: {e}", sock.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut v = serde_json::to_value(req)?;
    v["id"] = json!(id);
    let mut line = serde_json::to_string(&v)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;

    let mut lines = BufReader::new(read_half).lines();
    let resp_line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("connection closed before a response"))?;
    let resp: ResponseFrame = serde_json::from_str(resp_line.trim_end())?;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_strings_are_camel_case() {
        let v = serde_json::to_value(&Request::StopAll).unwrap();
        assert_eq!(v["type"], "stopAll");
        let v = serde_json::to_value(&Request::MetricsHistory { seconds: 60 }).unwrap();
        assert_eq!(v["type"], "metricsHistory");
        assert_eq!(v["data"]["seconds"], 60);
        let v = serde_json::to_value(&Request::Ping).unwrap();
        assert_eq!(v["type"], "ping");
    }

    #[test]
    fn decode_unit_request_with_null_data() {
        let frame = RequestFrame {
            ty: "list".into(),
            data: Value::Null,
            id: "1".into(),
        };
        assert!(matches!(decode_request(&frame).unwrap(), Request::List));
    }

    #[test]
    fn decode_struct_request() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"type":"stop","data":{"target":"api"},"id":"7"}"#).unwrap();
        assert_eq!(frame.id, "7");
        match decode_request(&frame).unwrap() {
            Request::Stop { target } => assert_eq!(target, "api"),
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn decode_flush_without_data() {
        let frame: RequestFrame = serde_json::from_str(r#"{"type":"flush","id":"2"}"#).unwrap();
        match decode_request(&frame).unwrap() {
            Request::Flush { target } => assert!(target.is_none()),
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn decode_logs_defaults_lines() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"type":"logs","data":{"target":"api"},"id":"3"}"#).unwrap();
        match decode_request(&frame).unwrap() {
            Request::Logs { target, lines } => {
                assert_eq!(target, "api");
                assert_eq!(lines, 50);
            }
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_invalid_spec() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"type":"frobnicate","id":"4"}"#).unwrap();
        let err = decode_request(&frame).unwrap_err();
        assert_eq!(err.kind(), "InvalidSpec");
    }

    #[test]
    fn response_frame_shape() {
        let r = ResponseFrame::ok("list", "9", json!([]));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "list");
        assert_eq!(v["success"], true);
        assert_eq!(v["id"], "9");
        assert!(v["error"].is_null());

        let e = ResponseFrame::err("start", "10", &BmError::AlreadyExists("web".into()));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["success"], false);
        assert!(v["error"].as_str().unwrap().starts_with("AlreadyExists"));
    }
}
