//! Sync-folder watcher: notify events bridged into the engine's event loop
//! with per-path debouncing, per-name suppression and a global pause.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Events for one path are coalesced for this long before being emitted.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: PathBuf,
    pub file_name: String,
}

/// Shared handle for suppressing watcher output: per-name ignores while a
/// download is in flight, plus a global pause.
#[derive(Clone, Default)]
pub struct WatcherControl {
    ignored: Arc<StdMutex<HashSet<String>>>,
    paused: Arc<AtomicBool>,
}

impl WatcherControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore_file(&self, file_name: &str) {
        self.ignored.lock().unwrap().insert(file_name.to_string());
    }

    pub fn unignore_file(&self, file_name: &str) {
        self.ignored.lock().unwrap().remove(file_name);
    }

    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignored.lock().unwrap().contains(file_name)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

pub struct FolderWatcher {
    // Dropping the notify watcher stops the event stream.
    _watcher: RecommendedWatcher,
    pub events: mpsc::UnboundedReceiver<WatchEvent>,
    control: WatcherControl,
}

impl FolderWatcher {
    /// Watches the top level of `folder` (the sync namespace is flat).
    pub fn new(folder: &Path) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "Watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch {:?}: {}", folder, e)))?;

        let control = WatcherControl::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce_loop(raw_rx, tx, control.clone()));

        tracing::info!(folder = ?folder, "Watching sync folder");

        Ok(Self {
            _watcher: watcher,
            events: rx,
            control,
        })
    }

    pub fn control(&self) -> WatcherControl {
        self.control.clone()
    }
}

/// Coalesces raw notify events per path and emits them once quiet for
/// [`DEBOUNCE`], re-checking suppression at emission time.
async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<Event>,
    out: mpsc::UnboundedSender<WatchEvent>,
    control: WatcherControl,
) {
    let mut pending: HashMap<PathBuf, (WatchKind, Instant)> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(_, deadline)| *deadline).min();

        tokio::select! {
            event = raw.recv() => {
                let Some(event) = event else { break };
                for (path, kind) in classify(&event) {
                    let deadline = Instant::now() + DEBOUNCE;
                    pending
                        .entry(path)
                        .and_modify(|slot| {
                            // An add followed by rapid changes is still an
                            // add; anything else takes the newest kind.
                            if !(slot.0 == WatchKind::Add && kind == WatchKind::Change) {
                                slot.0 = kind;
                            }
                            slot.1 = deadline;
                        })
                        .or_insert((kind, deadline));
                }
            }
            _ = sleep_until_opt(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();

                for path in due {
                    let (kind, _) = pending.remove(&path).unwrap();
                    emit(&out, &control, path, kind);
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// Maps a raw notify event onto per-path kinds. Hidden names (temp files,
/// in-flight downloads) never produce events.
fn classify(event: &Event) -> Vec<(PathBuf, WatchKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => WatchKind::Add,
        EventKind::Modify(_) => WatchKind::Change,
        EventKind::Remove(_) => WatchKind::Delete,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|n| !n.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
        })
        .map(|path| (path.clone(), kind))
        .collect()
}

fn emit(
    out: &mpsc::UnboundedSender<WatchEvent>,
    control: &WatcherControl,
    path: PathBuf,
    kind: WatchKind,
) {
    let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return;
    };

    if control.is_paused() || control.is_ignored(&file_name) {
        tracing::debug!(file_name = %file_name, "Suppressed watcher event");
        return;
    }

    // Rename-style notifications arrive as modify events for both ends;
    // resolve against the filesystem at emission time.
    let kind = if path.is_file() {
        if kind == WatchKind::Delete { WatchKind::Change } else { kind }
    } else if path.exists() {
        return; // directories are not synced
    } else {
        WatchKind::Delete
    };

    let _ = out.send(WatchEvent {
        kind,
        path,
        file_name,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn test_create_emits_add() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("note.txt"), b"hello").unwrap();

        let event = timeout(WAIT, watcher.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.file_name, "note.txt");
        assert!(matches!(event.kind, WatchKind::Add | WatchKind::Change));
    }

    #[tokio::test]
    async fn test_remove_emits_delete() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("note.txt");
        std::fs::write(&target, b"hello").unwrap();

        let mut watcher = FolderWatcher::new(dir.path()).unwrap();
        std::fs::remove_file(&target).unwrap();

        let event = timeout(WAIT, watcher.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind, WatchKind::Delete);
        assert_eq!(event.file_name, "note.txt");
    }

    #[tokio::test]
    async fn test_ignored_name_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new(dir.path()).unwrap();
        watcher.control().ignore_file("note.txt");

        std::fs::write(dir.path().join("note.txt"), b"hello").unwrap();

        assert!(timeout(Duration::from_secs(1), watcher.events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_hidden_temp_files_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new(dir.path()).unwrap();

        std::fs::write(dir.path().join(".conflict_server_note.txt"), b"x").unwrap();

        assert!(timeout(Duration::from_secs(1), watcher.events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_suppresses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new(dir.path()).unwrap();
        watcher.control().pause();

        std::fs::write(dir.path().join("note.txt"), b"hello").unwrap();

        assert!(timeout(Duration::from_secs(1), watcher.events.recv()).await.is_err());
    }
}
