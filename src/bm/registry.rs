use crate::bm::error::BmError;
use crate::bm::service::ServiceEntry;
use std::collections::{BTreeMap, HashMap};

/// The authoritative mapping from service identity to entries. Owned by the
/// supervisor worker; nothing else mutates it.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<u64, ServiceEntry>,
    by_name: HashMap<String, u64>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Ids are dense per supervisor lifetime and never reused.
    pub fn insert(&mut self, spec: crate::bm::spec::ServiceSpec, name: String) -> Result<u64, BmError> {
        if self.by_name.contains_key(&name) {
            return Err(BmError::AlreadyExists(name));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_name.insert(name.clone(), id);
        self.entries.insert(id, ServiceEntry::new(id, spec, name));
        Ok(id)
    }

    pub fn remove(&mut self, id: u64) -> Option<ServiceEntry> {
        let e = self.entries.remove(&id)?;
        self.by_name.remove(&e.name);
        Some(e)
    }

    pub fn get(&self, id: u64) -> Option<&ServiceEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ServiceEntry> {
        self.entries.get_mut(&id)
    }

    pub fn rename(&mut self, id: u64, new_name: String) -> Result<(), BmError> {
        if self.by_name.contains_key(&new_name) {
            return Err(BmError::AlreadyExists(new_name));
        }
        let Some(e) = self.entries.get_mut(&id) else {
            return Err(BmError::NotFound(format!("id {id}")));
        };
        self.by_name.remove(&e.name);
        self.by_name.insert(new_name.clone(), id);
        e.name = new_name;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceEntry> {
        self.entries.values_mut()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Resolve a target selector to entry ids, in id order.
    ///
    /// `"all"` matches everything; a decimal string matches at most one id; a
    /// name matches exactly, or as the base of cluster workers (`name-<i>`),
    /// or as a namespace. Empty resolution is not an error here.
    pub fn resolve(&self, target: &str) -> Vec<u64> {
        let t = target.trim();
        if t.eq_ignore_ascii_case("all") {
            return self.ids();
        }
        if let Ok(id) = t.parse::<u64>() {
            return if self.entries.contains_key(&id) {
                vec![id]
            } else {
                vec![]
            };
        }
        let prefix = format!("{t}-");
        let mut out: Vec<u64> = self
            .entries
            .values()
            .filter(|e| {
                e.name == t
                    || (e.name.starts_with(&prefix)
                        && e.name[prefix.len()..].chars().all(|c| c.is_ascii_digit())
                        && e.name.len() > prefix.len())
                    || e.namespace.as_deref() == Some(t)
            })
            .map(|e| e.id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Cluster workers of a base name, `(worker_index, id)` pairs sorted by
    /// index. An unsuffixed entry with the exact base name counts as index 0.
    pub fn workers_of(&self, base: &str) -> Vec<(u32, u64)> {
        let prefix = format!("{base}-");
        let mut out: Vec<(u32, u64)> = Vec::new();
        for e in self.entries.values() {
            if e.name == base {
                out.push((0, e.id));
            } else if let Some(rest) = e.name.strip_prefix(&prefix) {
                if let Ok(idx) = rest.parse::<u32>() {
                    out.push((idx, e.id));
                }
            }
        }
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm::spec::ServiceSpec;

    fn spec(name: &str, ns: Option<&str>) -> ServiceSpec {
        let ns_part = ns
            .map(|n| format!(r#","namespace":"{n}""#))
            .unwrap_or_default();
        serde_json::from_str(&format!(
            r#"{{"name":"{name}","script":"a.js"{ns_part}}}"#
        ))
        .unwrap()
    }

    fn registry_with(names: &[(&str, Option<&str>)]) -> Registry {
        let mut r = Registry::new();
        for (n, ns) in names {
            r.insert(spec(n, *ns), n.to_string()).unwrap();
        }
        r
    }

    #[test]
    fn ids_are_dense_and_never_reused() {
        let mut r = registry_with(&[("a", None), ("b", None)]);
        assert_eq!(r.ids(), vec![0, 1]);
        r.remove(0).unwrap();
        let id = r.insert(spec("c", None), "c".to_string()).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut r = registry_with(&[("web", None)]);
        let err = r.insert(spec("web", None), "web".to_string()).unwrap_err();
        assert_eq!(err.kind(), "AlreadyExists");
        // Deleting frees the name again.
        r.remove(0).unwrap();
        assert!(r.insert(spec("web", None), "web".to_string()).is_ok());
    }

    #[test]
    fn resolve_all_and_ids() {
        let r = registry_with(&[("a", None), ("b", None), ("c", None)]);
        assert_eq!(r.resolve("all"), vec![0, 1, 2]);
        assert_eq!(r.resolve("1"), vec![1]);
        assert_eq!(r.resolve("42"), Vec::<u64>::new());
    }

    #[test]
    fn resolve_name_and_worker_prefix() {
        let r = registry_with(&[
            ("api-0", None),
            ("api-1", None),
            ("api-extra", None),
            ("apiserver", None),
        ]);
        // Prefix match requires a purely numeric suffix.
        assert_eq!(r.resolve("api"), vec![0, 1]);
        assert_eq!(r.resolve("api-1"), vec![1]);
        assert_eq!(r.resolve("api-extra"), vec![2]);
        assert_eq!(r.resolve("nothing"), Vec::<u64>::new());
    }

    #[test]
    fn resolve_namespace() {
        let r = registry_with(&[
            ("a", Some("backend")),
            ("b", Some("backend")),
            ("c", Some("frontend")),
        ]);
        assert_eq!(r.resolve("backend"), vec![0, 1]);
        assert_eq!(r.resolve("frontend"), vec![2]);
    }

    #[test]
    fn workers_sorted_by_index() {
        let r = registry_with(&[("w-2", None), ("w-0", None), ("w-1", None)]);
        let idx: Vec<u32> = r.workers_of("w").iter().map(|(i, _)| *i).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn rename_updates_index() {
        let mut r = registry_with(&[("api", None)]);
        r.rename(0, "api-0".to_string()).unwrap();
        assert_eq!(r.resolve("api"), vec![0]);
        assert!(!r.contains_name("api"));
        assert!(r.contains_name("api-0"));
    }
}
