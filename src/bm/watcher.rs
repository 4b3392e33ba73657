use crate::bm::asyncutil::tasks;
use crate::bm::events::bm_event;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Trailing-edge debounce window for filesystem events.
const DEBOUNCE: Duration = Duration::from_secs(1);

const BUILTIN_IGNORES: [&str; 3] = ["node_modules", ".git", ".bm2"];

fn is_ignored(path: &Path, roots: &[PathBuf], ignores: &[String]) -> bool {
    // Compare path components relative to whichever root contains the path.
    for root in roots {
        if let Ok(rel) = path.strip_prefix(root) {
            for comp in rel.components() {
                let c = comp.as_os_str().to_string_lossy();
                if BUILTIN_IGNORES.iter().any(|b| c == *b)
                    || ignores.iter().any(|i| c.as_ref() == i.as_str() || c.starts_with(i.as_str()))
                {
                    return true;
                }
            }
            return false;
        }
    }
    false
}

/// Recursive, debounced watcher over `roots`. Each coalesced burst of
/// non-ignored events posts one `on_change` call. A host without recursive
/// watch support degrades to a logged error (non-fatal for the service).
pub fn start_watcher<F>(
    service: String,
    roots: Vec<PathBuf>,
    extra_ignores: Vec<String>,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    tasks().spawn(async move {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();

        let mut watcher: RecommendedWatcher = {
            let tx = tx.clone();
            match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(ev) = res {
                    let _ = tx.send(ev);
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    bm_event("watch", Some(&service), format!("init_error err={e}"));
                    return;
                }
            }
        };

        for root in &roots {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                bm_event(
                    "watch",
                    Some(&service),
                    format!("watch_error root={} err={e}", root.display()),
                );
            }
        }
        bm_event(
            "watch",
            Some(&service),
            format!("armed roots={} debounce_ms={}", roots.len(), DEBOUNCE.as_millis()),
        );

        // Trailing-edge debounce: keep extending the deadline while events
        // arrive; fire once the stream stays quiet for the window.
        loop {
            let Some(ev) = rx.recv().await else { return };
            let mut relevant = ev
                .paths
                .iter()
                .any(|p| !is_ignored(p, &roots, &extra_ignores));
            loop {
                match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                    Ok(Some(ev)) => {
                        relevant |= ev
                            .paths
                            .iter()
                            .any(|p| !is_ignored(p, &roots, &extra_ignores));
                    }
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            if relevant {
                bm_event("watch", Some(&service), "source_changed");
                on_change();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_prefixes_apply_per_component() {
        let roots = vec![PathBuf::from("/app")];
        let ignores = vec!["dist".to_string()];
        assert!(is_ignored(
            Path::new("/app/node_modules/pkg/index.js"),
            &roots,
            &ignores
        ));
        assert!(is_ignored(Path::new("/app/.git/HEAD"), &roots, &ignores));
        assert!(is_ignored(Path::new("/app/.bm2/logs/x.log"), &roots, &ignores));
        assert!(is_ignored(Path::new("/app/dist/bundle.js"), &roots, &ignores));
        assert!(!is_ignored(Path::new("/app/src/main.js"), &roots, &ignores));
        // Paths outside every root are not filtered here.
        assert!(!is_ignored(Path::new("/tmp/x"), &roots, &ignores));
    }
}
