//! Client sync engine: reconciles a local folder against the server store.
//!
//! A single task owns all state and alternates between watcher events and
//! the periodic reconciler tick. Every network and disk step is idempotent,
//! so a dropped tick or a crash mid-sync heals on the next pass.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use filetime::FileTime;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{ConflictNotice, FileListing};
use crate::utils::sha256_hex;

use super::transport::{ApiClient, UploadOutcome};
use super::watcher::{DEBOUNCE, FolderWatcher, WatchEvent, WatchKind, WatcherControl};

/// How long a deletion keeps suppressing re-downloads of the same name.
const RECENT_DELETE_TTL: Duration = Duration::from_secs(30);
/// How long an upload stays in the recently-uploaded map.
const RECENT_UPLOAD_TTL: Duration = Duration::from_secs(60);
/// A fresh upload suppresses re-uploads and server-side echo for this long.
const REUPLOAD_SUPPRESS: Duration = Duration::from_secs(30);
/// Clock slack when comparing local and server modification times.
const MTIME_TOLERANCE_MS: i64 = 2000;
/// Rename heuristic: candidate pair mtimes must be this close.
const RENAME_MTIME_WINDOW_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Uploading,
    Downloading,
    Conflict,
    Error,
}

#[derive(Debug, Clone)]
pub struct FileSyncStatus {
    pub state: SyncState,
    pub version: Option<u64>,
}

/// A watcher event deferred while the server was unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedEvent {
    Rename { old: String, new: String },
    Upload { file_name: String },
    Delete { file_name: String },
}

#[derive(Debug, Clone)]
struct LocalFile {
    name: String,
    path: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
}

pub struct SyncEngine {
    config: ClientConfig,
    client_id: String,
    transport: ApiClient,
    control: WatcherControl,
    sync_folder: PathBuf,

    pending_uploads: HashSet<String>,
    pending_downloads: HashSet<String>,
    pending_deletions: HashSet<String>,
    recently_deleted: HashMap<String, Instant>,
    recently_uploaded: HashMap<String, Instant>,
    file_sync_status: HashMap<String, FileSyncStatus>,
    offline_queue: VecDeque<QueuedEvent>,
    conflict_snapshots: HashMap<String, Vec<u8>>,
    server_online: bool,
    is_first_sync: bool,
}

/// Derives a stable client id from the operator-supplied name: lowercase
/// alphanumerics with single dashes.
pub fn derive_client_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut last_was_separator = true;

    for c in name.chars() {
        if c.is_alphanumeric() {
            id.push(c.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            id.push('-');
            last_was_separator = true;
        }
    }
    if id.ends_with('-') {
        id.pop();
    }
    if id.is_empty() {
        id.push_str("client");
    }
    id
}

impl SyncEngine {
    pub fn new(config: ClientConfig, transport: ApiClient, control: WatcherControl) -> Self {
        let client_id = derive_client_id(&config.client_name);
        let sync_folder = PathBuf::from(&config.sync_folder);
        Self {
            config,
            client_id,
            transport,
            control,
            sync_folder,
            pending_uploads: HashSet::new(),
            pending_downloads: HashSet::new(),
            pending_deletions: HashSet::new(),
            recently_deleted: HashMap::new(),
            recently_uploaded: HashMap::new(),
            file_sync_status: HashMap::new(),
            offline_queue: VecDeque::new(),
            conflict_snapshots: HashMap::new(),
            server_online: false,
            is_first_sync: true,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_online(&self) -> bool {
        self.server_online
    }

    pub fn status(&self, file_name: &str) -> Option<&FileSyncStatus> {
        self.file_sync_status.get(file_name)
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline_queue.len()
    }

    /// The local bytes captured when a conflict was detected, before the
    /// server's state was adopted.
    pub fn conflict_snapshot(&self, file_name: &str) -> Option<&[u8]> {
        self.conflict_snapshots.get(file_name).map(|b| b.as_slice())
    }

    /// Runs until shutdown: watcher events as they come, a reconciler pass
    /// every poll interval.
    pub async fn run(
        mut self,
        mut watcher: FolderWatcher,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            client_id = %self.client_id,
            folder = ?self.sync_folder,
            poll_secs = poll.as_secs(),
            "Sync engine started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Sync engine shutting down");
                    break;
                }
                event = watcher.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_watch_event(event).await;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }
    }

    pub async fn handle_watch_event(&mut self, event: WatchEvent) {
        tracing::debug!(file_name = %event.file_name, kind = ?event.kind, "Watcher event");
        match event.kind {
            WatchKind::Delete => {
                if self.server_online {
                    // Never delete at the API from the watcher path; the
                    // reconciler tick flushes this.
                    self.pending_deletions.insert(event.file_name);
                } else {
                    self.queue_offline(QueuedEvent::Delete {
                        file_name: event.file_name,
                    });
                }
            }
            WatchKind::Add | WatchKind::Change => {
                if self.server_online {
                    self.upload_file(&event.file_name).await;
                } else {
                    self.queue_offline(QueuedEvent::Upload {
                        file_name: event.file_name,
                    });
                }
            }
        }
    }

    fn queue_offline(&mut self, event: QueuedEvent) {
        if !self.offline_queue.contains(&event) {
            tracing::info!(event = ?event, "Server offline, queueing event");
            self.offline_queue.push_back(event);
        }
    }

    /// One reconciler pass. Safe to call at any time; errors are logged and
    /// the next tick retries.
    pub async fn reconcile(&mut self) {
        if let Err(e) = self.reconcile_inner().await {
            tracing::warn!(error = %e, "Reconcile pass failed");
        }
    }

    async fn reconcile_inner(&mut self) -> Result<()> {
        // Health probe and online/offline transitions.
        let online = self.transport.health().await;
        if !online {
            if self.server_online {
                tracing::warn!("Server went offline, queueing further changes");
            }
            self.server_online = false;
            return Ok(());
        }
        if !self.server_online {
            tracing::info!("Server is reachable again");
            self.server_online = true;
            self.drain_offline_queue().await;
        }

        self.gc_recent_maps();

        // Listings from both sides.
        let server_files = self.transport.list_files().await?;
        let local_files = self.scan_local().await?;

        let mut server_map: HashMap<String, FileListing> = server_files
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        let local_map: HashMap<String, LocalFile> = local_files
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        // Pending deletions flush to the server first so the divergence
        // below reflects them.
        let deletions: Vec<String> = self.pending_deletions.drain().collect();
        for name in deletions {
            match self.transport.delete(&name).await {
                Ok(()) | Err(Error::NotFound(_)) => {
                    tracing::info!(file_name = %name, "Deleted on server");
                    self.recently_deleted.insert(name.clone(), Instant::now());
                    self.file_sync_status.remove(&name);
                    server_map.remove(&name);
                }
                Err(e) => {
                    tracing::warn!(file_name = %name, error = %e, "Server delete failed, retrying next tick");
                    self.pending_deletions.insert(name);
                }
            }
        }

        // Rename detection over the unmatched remainder, before any
        // transfer acts on the same names.
        let handled = self.detect_renames(&server_map, &local_map).await;

        // Server → local.
        let server_side: Vec<FileListing> = server_map.values().cloned().collect();
        for server_file in &server_side {
            let name = &server_file.name;
            if handled.contains(name)
                || self.recently_deleted.contains_key(name)
                || self.pending_deletions.contains(name)
                || self.pending_downloads.contains(name)
            {
                continue;
            }
            if let Some(at) = self.recently_uploaded.get(name) {
                if at.elapsed() < REUPLOAD_SUPPRESS {
                    continue;
                }
            }

            match local_map.get(name) {
                None => self.download_file(server_file).await,
                Some(local) => self.sync_existing(server_file, local).await,
            }
        }

        // Local → server.
        let local_side: Vec<LocalFile> = local_map.values().cloned().collect();
        for local in &local_side {
            let name = &local.name;
            if handled.contains(name)
                || server_map.contains_key(name)
                || self.pending_deletions.contains(name)
                || self.recently_deleted.contains_key(name)
            {
                continue;
            }

            let age = Utc::now() - local.modified;
            let grace = ChronoDuration::seconds(self.config.new_file_grace_secs as i64);
            if self.is_first_sync || age < grace {
                self.upload_file(name).await;
            } else {
                // Not on the server and not fresh: a deletion made
                // elsewhere wins over a stale local copy.
                tracing::info!(file_name = %name, "Removing local file deleted on server");
                if let Err(e) = fs::remove_file(&local.path).await {
                    tracing::warn!(file_name = %name, error = %e, "Failed to remove local file");
                }
                self.file_sync_status.remove(name);
            }
        }

        self.cleanup_temp_files().await;
        self.is_first_sync = false;
        Ok(())
    }

    /// Pairs a server-only name with a local-only file carrying the same
    /// content (checksum and size) and a close mtime, and renames
    /// server-side instead of re-transferring.
    async fn detect_renames(
        &mut self,
        server_map: &HashMap<String, FileListing>,
        local_map: &HashMap<String, LocalFile>,
    ) -> HashSet<String> {
        let mut handled = HashSet::new();

        let server_only: Vec<&FileListing> = server_map
            .values()
            .filter(|s| {
                !local_map.contains_key(&s.name)
                    && !self.recently_deleted.contains_key(&s.name)
                    && !self.pending_deletions.contains(&s.name)
            })
            .collect();
        if server_only.is_empty() {
            return handled;
        }
        let local_only: Vec<&LocalFile> = local_map
            .values()
            .filter(|l| !server_map.contains_key(&l.name))
            .collect();

        for server_file in server_only {
            for local in &local_only {
                if handled.contains(&local.name) || local.size != server_file.size {
                    continue;
                }
                let mtime_delta = (local.modified - server_file.last_modified)
                    .num_milliseconds()
                    .abs();
                if mtime_delta >= RENAME_MTIME_WINDOW_MS {
                    continue;
                }
                let Ok(bytes) = fs::read(&local.path).await else {
                    continue;
                };
                if sha256_hex(&bytes) != server_file.checksum {
                    continue;
                }

                tracing::info!(
                    old_name = %server_file.name,
                    new_name = %local.name,
                    "Detected rename, updating server"
                );
                match self.transport.rename(&server_file.name, &local.name).await {
                    Ok(()) => {
                        handled.insert(server_file.name.clone());
                        handled.insert(local.name.clone());
                        self.file_sync_status.remove(&server_file.name);
                        self.set_status(&local.name, SyncState::Synced, Some(server_file.version));
                        self.recently_uploaded.insert(local.name.clone(), Instant::now());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Server rename failed");
                    }
                }
                break;
            }
        }

        handled
    }

    /// Both sides carry the file: settle divergence by version, checksum,
    /// then mtime with tolerance.
    async fn sync_existing(&mut self, server_file: &FileListing, local: &LocalFile) {
        let name = &server_file.name;

        // A tracked server version newer than ours always wins.
        if let Some(status) = self.file_sync_status.get(name) {
            if let Some(known) = status.version {
                if server_file.version > known {
                    self.download_file(server_file).await;
                    return;
                }
            }
        }

        let Ok(bytes) = fs::read(&local.path).await else {
            return;
        };
        if sha256_hex(&bytes) == server_file.checksum {
            self.set_status(name, SyncState::Synced, Some(server_file.version));
            return;
        }

        // Content differs: direction by modification time, with slack for
        // skewed clocks.
        let delta_ms = (server_file.last_modified - local.modified).num_milliseconds();
        if delta_ms > MTIME_TOLERANCE_MS {
            self.download_file(server_file).await;
        } else if delta_ms < -MTIME_TOLERANCE_MS {
            self.upload_file(name).await;
        } else {
            // Inside the tolerance the server's copy is authoritative.
            tracing::debug!(file_name = %name, "Divergent content within mtime tolerance, adopting server copy");
            self.download_file(server_file).await;
        }
    }

    /// Downloads the server's current blob into the sync folder, adopting
    /// the server's mtime, with watcher events for the name suppressed.
    async fn download_file(&mut self, server_file: &FileListing) {
        let name = server_file.name.clone();
        self.pending_downloads.insert(name.clone());
        self.control.ignore_file(&name);
        self.set_status(&name, SyncState::Downloading, None);

        let outcome = self.fetch_into_folder(&name, server_file.last_modified).await;
        match outcome {
            Ok(()) => {
                tracing::info!(file_name = %name, version = server_file.version, "Downloaded");
                self.set_status(&name, SyncState::Synced, Some(server_file.version));
            }
            Err(e) => {
                tracing::warn!(file_name = %name, error = %e, "Download failed");
                self.set_status(&name, SyncState::Error, None);
            }
        }

        self.pending_downloads.remove(&name);
        self.schedule_unignore(&name);
    }

    async fn fetch_into_folder(&self, name: &str, mtime: DateTime<Utc>) -> Result<()> {
        let bytes = self.transport.download(name).await?;
        let temp = self.sync_folder.join(format!(".conflict_server_{}", name));
        let target = self.sync_folder.join(name);

        fs::write(&temp, &bytes).await?;
        fs::rename(&temp, &target).await?;
        set_mtime(&target, mtime)?;
        Ok(())
    }

    /// Uploads one local file, chunked above the size threshold.
    pub async fn upload_file(&mut self, name: &str) {
        if self.pending_uploads.contains(name) {
            tracing::debug!(file_name = %name, "Upload already in flight");
            return;
        }
        if let Some(at) = self.recently_uploaded.get(name) {
            if at.elapsed() < REUPLOAD_SUPPRESS {
                tracing::debug!(file_name = %name, "Recently uploaded, suppressing re-upload");
                return;
            }
        }

        let path = self.sync_folder.join(name);
        let Ok(meta) = fs::metadata(&path).await else {
            return;
        };
        let Ok(bytes) = fs::read(&path).await else {
            return;
        };
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        self.pending_uploads.insert(name.to_string());
        self.set_status(name, SyncState::Uploading, None);

        let outcome = if bytes.len() as u64 > self.config.chunk_size_bytes {
            self.transport
                .upload_chunked(
                    name,
                    &bytes,
                    &self.client_id,
                    last_modified,
                    self.config.chunk_size_bytes as usize,
                )
                .await
        } else {
            self.transport
                .upload_safe(name, bytes.clone(), &self.client_id, last_modified)
                .await
        };

        match outcome {
            Ok(UploadOutcome::Uploaded(resp)) => {
                if resp.duplicate {
                    tracing::debug!(file_name = %name, "Server already had this content");
                } else {
                    tracing::info!(file_name = %name, version = resp.file.version, "Uploaded");
                }
                self.recently_uploaded.insert(name.to_string(), Instant::now());
                self.set_status(name, SyncState::Synced, Some(resp.file.version));
            }
            Ok(UploadOutcome::Conflict(notice)) => {
                self.handle_conflict(name, bytes, notice).await;
            }
            Err(Error::Http(e)) => {
                tracing::warn!(file_name = %name, error = %e, "Upload transport failed, going offline");
                self.server_online = false;
                self.set_status(name, SyncState::Error, None);
                self.queue_offline(QueuedEvent::Upload {
                    file_name: name.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(file_name = %name, error = %e, "Upload rejected");
                self.set_status(name, SyncState::Error, None);
            }
        }

        self.pending_uploads.remove(name);
    }

    /// The server rejected our upload as a conflict loser: snapshot the
    /// local content, adopt the server's current state, surface the
    /// conflict. No automatic resolution beyond that.
    async fn handle_conflict(&mut self, name: &str, local_bytes: Vec<u8>, notice: ConflictNotice) {
        tracing::warn!(
            file_name = %name,
            conflict_id = %notice.conflict_id,
            winner = %notice.winner.client_id,
            conflict_copy = notice.conflict_file_name.as_deref().unwrap_or("-"),
            "Conflict detected; adopting server state locally"
        );

        self.conflict_snapshots.insert(name.to_string(), local_bytes);
        self.set_status(name, SyncState::Conflict, None);

        self.control.ignore_file(name);
        let adopted: Result<Option<FileListing>> = async {
            let listing = self
                .transport
                .list_files()
                .await?
                .into_iter()
                .find(|f| f.name == name);
            let mtime = listing
                .as_ref()
                .map(|f| f.last_modified)
                .unwrap_or(notice.winner.last_modified);
            self.fetch_into_folder(name, mtime).await?;
            Ok(listing)
        }
        .await;

        match adopted {
            Ok(listing) => {
                self.recently_uploaded.insert(name.to_string(), Instant::now());
                self.set_status(name, SyncState::Synced, listing.map(|f| f.version));
            }
            Err(e) => {
                tracing::warn!(file_name = %name, error = %e, "Failed to adopt server state after conflict");
                self.set_status(name, SyncState::Error, None);
            }
        }
        self.schedule_unignore(name);
    }

    /// Drains the offline queue on reconnect: renames first, then uploads,
    /// then deletions, FIFO within each class.
    async fn drain_offline_queue(&mut self) {
        if self.offline_queue.is_empty() {
            return;
        }
        let queued: Vec<QueuedEvent> = self.offline_queue.drain(..).collect();
        tracing::info!(events = queued.len(), "Draining offline queue");

        for event in &queued {
            if let QueuedEvent::Rename { old, new } = event {
                if let Err(e) = self.transport.rename(old, new).await {
                    tracing::warn!(old = %old, new = %new, error = %e, "Queued rename failed");
                }
            }
        }
        for event in &queued {
            if let QueuedEvent::Upload { file_name } = event {
                if self.sync_folder.join(file_name).is_file() {
                    self.upload_file(file_name).await;
                }
            }
        }
        for event in queued {
            if let QueuedEvent::Delete { file_name } = event {
                self.pending_deletions.insert(file_name);
            }
        }
    }

    async fn scan_local(&self) -> Result<Vec<LocalFile>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.sync_folder).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to list sync folder {:?}: {}",
                self.sync_folder, e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read directory entry: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(LocalFile {
                name,
                path: entry.path(),
                size: meta.len(),
                modified,
            });
        }
        Ok(files)
    }

    /// Removes download temps left behind by an interrupted fetch.
    async fn cleanup_temp_files(&self) {
        let Ok(mut entries) = fs::read_dir(&self.sync_folder).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".conflict_server_") {
                tracing::debug!(file_name = %name, "Removing stale download temp");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }

    fn gc_recent_maps(&mut self) {
        self.recently_deleted
            .retain(|_, at| at.elapsed() < RECENT_DELETE_TTL);
        self.recently_uploaded
            .retain(|_, at| at.elapsed() < RECENT_UPLOAD_TTL);
    }

    fn set_status(&mut self, name: &str, state: SyncState, version: Option<u64>) {
        let version = version.or_else(|| {
            self.file_sync_status
                .get(name)
                .and_then(|status| status.version)
        });
        self.file_sync_status
            .insert(name.to_string(), FileSyncStatus { state, version });
    }

    /// Lifts the per-name watcher suppression once the debounce window for
    /// our own write has passed.
    fn schedule_unignore(&self, name: &str) {
        let control = self.control.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE + Duration::from_millis(200)).await;
            control.unignore_file(&name);
        });
    }
}

fn set_mtime(path: &Path, mtime: DateTime<Utc>) -> Result<()> {
    let ft = FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, ft)
        .map_err(|e| Error::Internal(format!("Failed to set mtime on {:?}: {}", path, e)))
}
