use std::path::{Path, PathBuf};

/// Filesystem layout of the daemon home:
///
/// ```text
/// $HOME/.bm2/
///   daemon.sock
///   daemon.pid
///   dump.json
///   bm2.log
///   logs/<name>-<id>-{out,err}.log[.1 .. .N][.gz]
///   pids/<name>-<id>.pid
/// ```
#[derive(Debug, Clone)]
pub struct BmHome {
    root: PathBuf,
}

impl BmHome {
    /// Resolve the daemon home: explicit override, else `$HOME/.bm2`.
    pub fn resolve(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let root = match explicit {
            Some(p) => p,
            None => {
                let home = std::env::var_os("HOME")
                    .ok_or_else(|| anyhow::anyhow!("HOME is not set and no --home given"))?;
                PathBuf::from(home).join(".bm2")
            }
        };
        Ok(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn dump_file(&self) -> PathBuf {
        self.root.join("dump.json")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.root.join("bm2.log")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn out_log(&self, name: &str, id: u64) -> PathBuf {
        self.logs_dir().join(format!("{name}-{id}-out.log"))
    }

    pub fn err_log(&self, name: &str, id: u64) -> PathBuf {
        self.logs_dir().join(format!("{name}-{id}-err.log"))
    }

    pub fn child_pid_file(&self, name: &str, id: u64) -> PathBuf {
        self.pids_dir().join(format!("{name}-{id}.pid"))
    }

    /// Create the home directory tree. Failure here is fatal for the daemon.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for d in [self.root.clone(), self.logs_dir(), self.pids_dir()] {
            std::fs::create_dir_all(&d)
                .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", d.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let h = BmHome::at("/tmp/bm2-test-home");
        assert_eq!(h.socket(), PathBuf::from("/tmp/bm2-test-home/daemon.sock"));
        assert_eq!(h.pid_file(), PathBuf::from("/tmp/bm2-test-home/daemon.pid"));
        assert_eq!(
            h.out_log("api", 3),
            PathBuf::from("/tmp/bm2-test-home/logs/api-3-out.log")
        );
        assert_eq!(
            h.err_log("api-1", 7),
            PathBuf::from("/tmp/bm2-test-home/logs/api-1-7-err.log")
        );
        assert_eq!(
            h.child_pid_file("api", 3),
            PathBuf::from("/tmp/bm2-test-home/pids/api-3.pid")
        );
    }
}
