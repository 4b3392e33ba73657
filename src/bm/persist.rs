use crate::bm::error::BmError;
use crate::bm::paths::BmHome;
use crate::bm::service::ServiceEntry;
use crate::bm::spec::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DUMP_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedService {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub restart_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct DumpFile {
    version: u32,
    services: Vec<SavedService>,
}

fn base_name(name: &str) -> Option<&str> {
    let (base, suffix) = name.rsplit_once('-')?;
    if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
        Some(base)
    } else {
        None
    }
}

/// Declarative snapshot of every non-deleted entry: spec + restart counter.
/// Workers of one cluster start collapse back to a single record so a later
/// resurrect recreates the cluster rather than n singles. Atomic write
/// (tmp + rename); crashes never corrupt an existing dump.
pub async fn save<'a>(
    home: &BmHome,
    entries: impl Iterator<Item = &'a ServiceEntry>,
) -> Result<usize, BmError> {
    let mut singles: Vec<SavedService> = Vec::new();
    let mut clusters: BTreeMap<String, SavedService> = BTreeMap::new();

    for e in entries {
        let is_cluster_worker = e.spec.instances.resolve() > 1;
        match (is_cluster_worker, base_name(&e.name)) {
            (true, Some(base)) => {
                let rec = clusters.entry(base.to_string()).or_insert_with(|| {
                    let mut spec = e.spec.clone();
                    spec.name = base.to_string();
                    SavedService {
                        name: base.to_string(),
                        namespace: e.namespace.clone(),
                        spec,
                        restart_count: 0,
                    }
                });
                rec.restart_count = rec.restart_count.max(e.restart_count);
            }
            _ => singles.push(SavedService {
                name: e.name.clone(),
                namespace: e.namespace.clone(),
                spec: e.spec.clone(),
                restart_count: e.restart_count,
            }),
        }
    }

    singles.extend(clusters.into_values());
    let count = singles.len();
    let dump = DumpFile {
        version: DUMP_VERSION,
        services: singles,
    };

    let path = home.dump_file();
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(&dump)
        .map_err(|e| BmError::Internal(format!("dump encode: {e}")))?;
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| BmError::io(&format!("write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| BmError::io(&format!("rename {}", path.display()), e))?;
    Ok(count)
}

/// Read the dump back. Missing or empty file is a no-op; a dump written by
/// an unknown format version is refused rather than half-loaded.
pub async fn load(home: &BmHome) -> Result<Vec<SavedService>, BmError> {
    let path = home.dump_file();
    let body = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(BmError::io(&format!("read {}", path.display()), e)),
    };
    if body.is_empty() {
        return Ok(vec![]);
    }
    let dump: DumpFile = serde_json::from_slice(&body)
        .map_err(|e| BmError::io(&format!("parse {}", path.display()), e))?;
    if dump.version != DUMP_VERSION {
        return Err(BmError::IoError(format!(
            "dump {} has version {} (supported: {DUMP_VERSION})",
            path.display(),
            dump.version
        )));
    }
    Ok(dump.services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm::spec::Instances;

    fn entry(name: &str, extra: &str) -> ServiceEntry {
        let spec: ServiceSpec = serde_json::from_str(&format!(
            r#"{{"name":"{name}","script":"a.js"{extra}}}"#
        ))
        .unwrap();
        ServiceEntry::new(0, spec, name.to_string())
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let home = BmHome::at(dir.path());
        let mut a = entry("api", "");
        a.restart_count = 2;
        let b = entry("worker", r#","autorestart":false"#);
        save(&home, [&a, &b].into_iter()).await.unwrap();

        let back = load(&home).await.unwrap();
        assert_eq!(back.len(), 2);
        let api = back.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.restart_count, 2);
        assert_eq!(api.spec.script, "a.js");
        let worker = back.iter().find(|s| s.name == "worker").unwrap();
        assert!(!worker.spec.autorestart);
    }

    #[tokio::test]
    async fn cluster_workers_collapse_to_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let home = BmHome::at(dir.path());
        let w0 = entry("web-0", r#","instances":3,"exec_mode":"cluster""#);
        let mut w1 = entry("web-1", r#","instances":3,"exec_mode":"cluster""#);
        w1.restart_count = 4;
        let w2 = entry("web-2", r#","instances":3,"exec_mode":"cluster""#);
        save(&home, [&w0, &w1, &w2].into_iter()).await.unwrap();

        let back = load(&home).await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].name, "web");
        assert_eq!(back[0].spec.instances, Instances::Count(3));
        assert_eq!(back[0].restart_count, 4);
    }

    #[tokio::test]
    async fn missing_dump_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let home = BmHome::at(dir.path());
        assert!(load(&home).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let home = BmHome::at(dir.path());
        std::fs::create_dir_all(home.root()).unwrap();
        std::fs::write(home.dump_file(), r#"{"version":99,"services":[]}"#).unwrap();
        let err = load(&home).await.unwrap_err();
        assert_eq!(err.kind(), "IOError");
    }
}
