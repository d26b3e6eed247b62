//! Filesystem ingress: watch a directory for AAS environment documents.
//!
//! Events are debounced, the file content is hashed, and unchanged files are
//! skipped so editor save storms do not replay whole snapshots.

use crate::config::FileWatcherConfig;
use crate::runtime::IngressEvent;
use aas_uplink_adapter_aas::load_environment;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    extensions.iter().any(|ext| name.ends_with(&ext.to_ascii_lowercase()))
}

fn file_hash(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

/// Watch the configured directory, sending one [`IngressEvent`] per new or
/// changed document. Existing files are processed once at startup. Returns
/// when the ingress channel closes (shutdown).
pub async fn run_file_watcher(
    config: FileWatcherConfig,
    ingress: mpsc::Sender<IngressEvent>,
) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    std::fs::create_dir_all(&config.watch_dir)?;

    let (raw_tx, mut raw_rx) = mpsc::channel::<PathBuf>(64);

    let mut watcher: RecommendedWatcher = {
        let raw_tx = raw_tx.clone();
        notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            let Ok(event) = result else { return };
            if !event.kind.is_create() && !event.kind.is_modify() {
                return;
            }
            for path in event.paths {
                // Blocking send from notify's own thread.
                let _ = raw_tx.blocking_send(path);
            }
        })?
    };
    watcher.watch(&config.watch_dir, RecursiveMode::Recursive)?;
    tracing::info!(dir = %config.watch_dir.display(), "File watcher started");

    let mut seen_hashes: HashMap<PathBuf, String> = HashMap::new();

    // Process files already present before the watcher started.
    let mut initial: Vec<PathBuf> = std::fs::read_dir(&config.watch_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    initial.sort();
    for path in initial {
        process_file(&path, &config, &mut seen_hashes, &ingress).await;
    }

    let debounce = Duration::from_secs_f64(config.debounce_seconds.max(0.0));
    while let Some(path) = raw_rx.recv().await {
        // Let the writer finish, then drain duplicate events for the window.
        tokio::time::sleep(debounce).await;
        let mut batch = vec![path];
        while let Ok(more) = raw_rx.try_recv() {
            if !batch.contains(&more) {
                batch.push(more);
            }
        }
        for path in batch {
            process_file(&path, &config, &mut seen_hashes, &ingress).await;
        }
        if ingress.is_closed() {
            break;
        }
    }

    Ok(())
}

async fn process_file(
    path: &Path,
    config: &FileWatcherConfig,
    seen_hashes: &mut HashMap<PathBuf, String>,
    ingress: &mpsc::Sender<IngressEvent>,
) {
    if !path.is_file() || !matches_extension(path, &config.extensions) {
        return;
    }
    let Some(hash) = file_hash(path) else { return };
    if seen_hashes.get(path) == Some(&hash) {
        tracing::debug!(path = %path.display(), "File unchanged, skipping");
        return;
    }
    seen_hashes.insert(path.to_path_buf(), hash);

    match load_environment(path) {
        Ok(env) => {
            tracing::info!(path = %path.display(), "Processing AAS document");
            let event = IngressEvent {
                env,
                origin: format!("file://{}", path.display()),
            };
            if ingress.send(event).await.is_err() {
                tracing::debug!("Ingress channel closed");
            }
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to load AAS document");
            crate::observability::record_error("ingress_file");
        }
    }
}
