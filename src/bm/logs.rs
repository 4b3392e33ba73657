use crate::bm::asyncutil::tasks;
use crate::bm::events::bm_event;
use crate::bm::spec::LogPolicy;
use anyhow::Context as _;
use chrono::Utc;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

/// Debounce window for buffered writes.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Rotation is checked once a minute (in flush ticks).
const ROTATE_CHECK_TICKS: u64 = 600;
const TAIL_CHUNK: usize = 64 * 1024;

pub async fn open_append(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    let f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))?;
    Ok(f)
}

/// Numbered rotation: `base -> base.1 -> base.2 ...`, dropping anything past
/// `backups`. Renames happen before the active file is recreated, so a crash
/// leaves at worst an extra rotated segment, never a hole. With `compress`,
/// the fresh `.1` segment is gzipped in place.
pub async fn rotate_numbered(base_path: &Path, backups: usize, compress: bool) -> anyhow::Result<()> {
    if backups == 0 {
        if tokio::fs::metadata(base_path).await.is_ok() {
            let _ = tokio::fs::remove_file(base_path).await;
        }
        return Ok(());
    }

    // Delete oldest first.
    for suffix in [format!("{backups}"), format!("{backups}.gz")] {
        let oldest = PathBuf::from(format!("{}.{suffix}", base_path.display()));
        if tokio::fs::metadata(&oldest).await.is_ok() {
            let _ = tokio::fs::remove_file(&oldest).await;
        }
    }

    // Shift: (backups-1 ..= 1), plain and compressed variants alike.
    for i in (1..backups).rev() {
        for ext in ["", ".gz"] {
            let from = PathBuf::from(format!("{}.{i}{ext}", base_path.display()));
            let to = PathBuf::from(format!("{}.{}{ext}", base_path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(&from, &to).await;
            }
        }
    }

    let to1 = PathBuf::from(format!("{}.1", base_path.display()));
    if tokio::fs::metadata(base_path).await.is_ok() {
        tokio::fs::rename(base_path, &to1)
            .await
            .with_context(|| format!("rotate {}", base_path.display()))?;
        if compress {
            let seg = to1.clone();
            let r = tasks()
                .spawn_blocking(move || compress_in_place(&seg))
                .await;
            if let Ok(Err(e)) = r {
                bm_event("logrotate", None, format!("gzip_error file={} err={e}", to1.display()));
            }
        }
    }
    Ok(())
}

/// Gzip `path` to `path.gz` and remove the original.
fn compress_in_place(path: &Path) -> anyhow::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    let mut src = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let dst = std::fs::File::create(&gz_path)
        .with_context(|| format!("create {}", gz_path.display()))?;
    let mut enc = GzEncoder::new(dst, Compression::default());
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        enc.write_all(&buf[..n])?;
    }
    enc.finish()?;
    std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    Ok(())
}

/// Last `n` newline-separated lines of `path`, reading backwards in chunks.
/// A missing file reads as empty.
pub fn tail_lines(path: &Path, n: usize) -> anyhow::Result<String> {
    if n == 0 {
        return Ok(String::new());
    }
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let len = f.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(String::new());
    }

    let mut pos = len;
    let mut collected: Vec<u8> = Vec::new();
    let mut newlines = 0usize;
    // Stop once we have seen n+1 newlines (the extra one bounds line n from above).
    while pos > 0 && newlines <= n {
        let chunk = TAIL_CHUNK.min(pos as usize);
        pos -= chunk as u64;
        f.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; chunk];
        f.read_exact(&mut buf)?;
        newlines += buf.iter().filter(|b| **b == b'\n').count();
        buf.extend_from_slice(&collected);
        collected = buf;
    }

    let text = String::from_utf8_lossy(&collected);
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.len() > n {
        lines = lines.split_off(lines.len() - n);
    }
    Ok(lines.join("\n"))
}

#[derive(Debug, Default)]
struct SinkBuf {
    lines: Vec<String>,
}

/// Append-only buffered writer for one `(service, stream)` log file. Lines
/// are decorated with an ISO-8601 UTC timestamp on enqueue; a debounced
/// flusher owns all disk writes including rotation.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    buf: Arc<Mutex<SinkBuf>>,
}

impl LogSink {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            buf: Arc::new(Mutex::new(SinkBuf::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueue one raw line; `[YYYY-MM-DDTHH:MM:SS.sssZ] <line>`.
    pub fn push_line(&self, line: &str) {
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let mut g = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        g.lines.push(format!("[{ts}] {line}"));
    }

    fn drain(&self) -> Vec<String> {
        let mut g = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut g.lines)
    }

    async fn flush_to_disk(&self) -> anyhow::Result<()> {
        let lines = self.drain();
        if lines.is_empty() {
            return Ok(());
        }
        let mut f = open_append(&self.path).await?;
        let mut out = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for l in &lines {
            out.push_str(l);
            out.push('\n');
        }
        f.write_all(out.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }

    async fn maybe_rotate(&self, policy: &LogPolicy) -> anyhow::Result<()> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if size < policy.max_bytes {
            return Ok(());
        }
        rotate_numbered(&self.path, policy.retain, policy.compress).await?;
        // Recreate the active file empty so readers never see a hole.
        let _ = open_append(&self.path).await?;
        Ok(())
    }

    /// Drop buffered lines and truncate the active file (the `flush` op).
    pub async fn truncate(&self) -> anyhow::Result<()> {
        self.drain();
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let f = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await
                .with_context(|| format!("open {}", self.path.display()))?;
            f.set_len(0)
                .await
                .with_context(|| format!("truncate {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// The out/err sink pair of one entry plus its flusher task. One writer per
/// file; rotation runs on the same writer.
#[derive(Debug)]
pub struct LogSinks {
    pub out: LogSink,
    pub err: LogSink,
    flusher: JoinHandle<()>,
}

impl LogSinks {
    pub fn start(service: &str, out_path: PathBuf, err_path: PathBuf, policy: LogPolicy) -> Self {
        let out = LogSink::new(out_path);
        let err = LogSink::new(err_path);
        let (o, e) = (out.clone(), err.clone());
        let svc = service.to_string();
        let flusher = tasks().spawn(async move {
            let mut ticks: u64 = 0;
            loop {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                ticks += 1;
                for sink in [&o, &e] {
                    if let Err(er) = sink.flush_to_disk().await {
                        bm_event("logsink", Some(&svc), format!("flush_error err={er:#}"));
                    }
                }
                if ticks % ROTATE_CHECK_TICKS == 0 {
                    for sink in [&o, &e] {
                        if let Err(er) = sink.maybe_rotate(&policy).await {
                            bm_event("logsink", Some(&svc), format!("rotate_error err={er:#}"));
                        }
                    }
                }
            }
        });
        Self { out, err, flusher }
    }

    /// Final drain then stop the flusher. Used when the entry is deleted.
    pub async fn close(self) {
        let _ = self.out.flush_to_disk().await;
        let _ = self.err.flush_to_disk().await;
        self.flusher.abort();
    }

    pub async fn truncate_both(&self) -> anyhow::Result<()> {
        self.out.truncate().await?;
        self.err.truncate().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.log");
        write(&p, "one\ntwo\nthree\nfour\n");
        assert_eq!(tail_lines(&p, 2).unwrap(), "three\nfour");
        assert_eq!(tail_lines(&p, 10).unwrap(), "one\ntwo\nthree\nfour");
        assert_eq!(tail_lines(&p, 0).unwrap(), "");
        assert_eq!(tail_lines(&dir.path().join("missing.log"), 5).unwrap(), "");
    }

    #[test]
    fn tail_handles_many_lines_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.log");
        let mut content = String::new();
        for i in 0..5000 {
            content.push_str(&format!("line-{i} {}\n", "x".repeat(40)));
        }
        write(&p, &content);
        let tail = tail_lines(&p, 3).unwrap();
        assert_eq!(
            tail.lines().map(|l| l.split(' ').next().unwrap()).collect::<Vec<_>>(),
            vec!["line-4997", "line-4998", "line-4999"]
        );
    }

    #[tokio::test]
    async fn rotation_keeps_exactly_retain_backups() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("svc.log");
        let retain = 3usize;
        // N+1 rotations with retain=N: exactly {f, f.1, .., f.N} remain.
        for round in 0..=retain {
            write(&base, &format!("round {round}\n"));
            rotate_numbered(&base, retain, false).await.unwrap();
            let _ = open_append(&base).await.unwrap();
        }
        assert_eq!(std::fs::metadata(&base).unwrap().len(), 0);
        for i in 1..=retain {
            let p = PathBuf::from(format!("{}.{i}", base.display()));
            assert!(p.exists(), "expected {} to exist", p.display());
        }
        let beyond = PathBuf::from(format!("{}.{}", base.display(), retain + 1));
        assert!(!beyond.exists());
        // Oldest surviving backup is the earliest retained round.
        let oldest = std::fs::read_to_string(format!("{}.{retain}", base.display())).unwrap();
        assert_eq!(oldest, "round 1\n");
    }

    #[tokio::test]
    async fn rotation_compresses_fresh_segment() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("svc.log");
        write(&base, "payload\n");
        rotate_numbered(&base, 5, true).await.unwrap();
        let gz = PathBuf::from(format!("{}.1.gz", base.display()));
        let plain = PathBuf::from(format!("{}.1", base.display()));
        assert!(gz.exists());
        assert!(!plain.exists());

        // Second rotation shifts the compressed segment along.
        write(&base, "payload2\n");
        rotate_numbered(&base, 5, true).await.unwrap();
        assert!(PathBuf::from(format!("{}.2.gz", base.display())).exists());
        assert!(PathBuf::from(format!("{}.1.gz", base.display())).exists());
    }

    #[tokio::test]
    async fn sink_flush_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("s-out.log"));
        sink.push_line("hello");
        sink.push_line("world");
        sink.flush_to_disk().await.unwrap();
        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['), "timestamp prefix: {}", lines[0]);
        assert!(lines[0].ends_with("] hello"));
        assert!(lines[1].contains("Z] world"));

        sink.push_line("buffered-only");
        sink.truncate().await.unwrap();
        assert_eq!(std::fs::metadata(sink.path()).unwrap().len(), 0);
        // Buffered line was discarded with the truncate.
        sink.flush_to_disk().await.unwrap();
        assert_eq!(std::fs::metadata(sink.path()).unwrap().len(), 0);
    }
}
