//! Worker process management: spawning, environment pinning, termination.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

use crate::config::{Config, StorageConfig};
use crate::error::{Error, Result};

/// One supervised backend process.
pub struct WorkerProcess {
    pub port: u16,
    pub child: Child,
    /// True after the first successful `/health` probe.
    pub healthy: bool,
    pub started_at: Instant,
    pub last_health_check_at: Option<Instant>,
    /// Set on the healthy → unhealthy transition; a worker unhealthy for
    /// too long is killed and respawned.
    pub unhealthy_since: Option<Instant>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Resolves the worker binary: explicit config wins, then a sibling of the
/// supervisor executable, then PATH lookup.
pub fn resolve_worker_binary(configured: &str) -> PathBuf {
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("syncbox-server");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("syncbox-server")
}

/// Creates the storage directories and returns them as absolute paths.
///
/// Every worker must see identical absolute paths, no matter what working
/// directory it inherits.
fn storage_env(storage: &StorageConfig) -> Result<Vec<(&'static str, PathBuf)>> {
    let dirs = [
        ("SHARED_STORAGE_ROOT", PathBuf::from(&storage.shared_root)),
        ("FILES_DIR", storage.files_dir()),
        ("VERSIONS_DIR", storage.versions_dir()),
        ("METADATA_DIR", storage.metadata_dir()),
        ("CHUNKS_DIR", storage.chunks_dir()),
        ("CONFLICTS_DIR", storage.conflicts_dir()),
    ];

    let mut env = Vec::with_capacity(dirs.len());
    for (key, dir) in dirs {
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Internal(format!("Failed to create storage directory {:?}: {}", dir, e))
        })?;
        let absolute = std::fs::canonicalize(&dir).map_err(|e| {
            Error::Internal(format!("Failed to resolve storage directory {:?}: {}", dir, e))
        })?;
        env.push((key, absolute));
    }
    Ok(env)
}

/// Spawns one worker listening on an internal port, with the shared storage
/// directories pinned through its environment.
pub fn spawn_worker(config: &Config, port: u16) -> Result<WorkerProcess> {
    let binary = resolve_worker_binary(&config.supervisor.worker_binary);

    let mut command = Command::new(&binary);
    command
        .env("HOST", "127.0.0.1")
        .env("PORT", port.to_string())
        .kill_on_drop(true);
    for (key, dir) in storage_env(&config.storage)? {
        command.env(key, dir);
    }

    let child = command.spawn().map_err(|e| {
        Error::Internal(format!(
            "Failed to spawn worker {:?} on port {}: {}",
            binary, port, e
        ))
    })?;

    tracing::info!(port, pid = child.id(), "Spawned worker");

    Ok(WorkerProcess {
        port,
        child,
        healthy: false,
        started_at: Instant::now(),
        last_health_check_at: None,
        unhealthy_since: None,
    })
}

/// Asks a worker to exit, then kills it after the grace window.
pub async fn terminate_worker(worker: &mut WorkerProcess, grace: Duration) {
    signal_gently(worker);

    let waited = tokio::time::timeout(grace, worker.child.wait()).await;
    match waited {
        Ok(Ok(status)) => {
            tracing::info!(port = worker.port, %status, "Worker exited after gentle signal");
        }
        Ok(Err(e)) => {
            tracing::warn!(port = worker.port, error = %e, "Failed to await worker exit");
        }
        Err(_) => {
            tracing::warn!(port = worker.port, "Worker ignored gentle signal, killing");
            if let Err(e) = worker.child.kill().await {
                tracing::warn!(port = worker.port, error = %e, "Failed to kill worker");
            }
        }
    }
}

#[cfg(unix)]
fn signal_gently(worker: &WorkerProcess) {
    if let Some(pid) = worker.pid() {
        // SAFETY: plain kill(2) on a pid we spawned.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn signal_gently(_worker: &WorkerProcess) {
    // No portable gentle signal; the grace timeout falls through to kill.
}
