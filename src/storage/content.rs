//! On-disk blob store: one current blob per logical file plus an
//! append-only per-version copy.

use std::path::PathBuf;
use tokio::fs;

use crate::error::{Error, Result};
use crate::utils::{sha256_hex, write_atomic};

/// Outcome of a successful `save`.
#[derive(Debug, Clone)]
pub struct SavedBlob {
    pub path: PathBuf,
    pub versioned_path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

/// Content store over a `files/` directory (current blobs) and a
/// `versions/` directory (`<name>.v<N>` copies).
///
/// N worker processes pointing at the same directories observe identical
/// state; the current-blob write is atomic with respect to readers, so no
/// cross-process coordination is needed beyond the filesystem.
#[derive(Debug, Clone)]
pub struct ContentStore {
    files_dir: PathBuf,
    versions_dir: PathBuf,
}

/// Rejects names that are not a single path component. Everything the store
/// touches is resolved by joining a validated name under its root.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BadRequest("file name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::BadRequest(format!("invalid file name '{}'", name)));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(Error::BadRequest(format!(
            "file name '{}' must be a single path component",
            name
        )));
    }
    Ok(())
}

impl ContentStore {
    pub fn new(files_dir: PathBuf, versions_dir: PathBuf) -> Self {
        Self {
            files_dir,
            versions_dir,
        }
    }

    /// Creates the storage directories.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.files_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to create files directory {:?}: {}",
                self.files_dir, e
            ))
        })?;
        fs::create_dir_all(&self.versions_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to create versions directory {:?}: {}",
                self.versions_dir, e
            ))
        })?;
        Ok(())
    }

    // --- Path Helpers ---

    fn current_path(&self, name: &str) -> PathBuf {
        self.files_dir.join(name)
    }

    fn version_path(&self, name: &str, version: u64) -> PathBuf {
        self.versions_dir.join(format!("{}.v{}", name, version))
    }

    // --- Core Operations ---

    /// Writes the blob twice: atomically as the current file, and as the
    /// append-only versioned copy `<name>.v<version>`.
    pub async fn save(&self, name: &str, blob: &[u8], version: u64) -> Result<SavedBlob> {
        validate_file_name(name)?;

        let path = self.current_path(name);
        let versioned_path = self.version_path(name, version);

        write_atomic(&path, blob)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write blob {:?}: {}", path, e)))?;

        fs::write(&versioned_path, blob).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to write version blob {:?}: {}",
                versioned_path, e
            ))
        })?;

        Ok(SavedBlob {
            path,
            versioned_path,
            checksum: sha256_hex(blob),
            size: blob.len() as u64,
        })
    }

    /// Returns the current blob, or the versioned blob when `version` is
    /// given.
    pub async fn get(&self, name: &str, version: Option<u64>) -> Result<Vec<u8>> {
        validate_file_name(name)?;

        let full_path = match version {
            Some(v) => self.version_path(name, v),
            None => self.current_path(name),
        };

        if !full_path.exists() {
            return Err(match version {
                Some(v) => Error::NotFound(format!("Version {} of '{}' not found", v, name)),
                None => Error::NotFound(format!("File '{}' not found", name)),
            });
        }

        fs::read(&full_path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read blob {:?}: {}", full_path, e)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.current_path(name).exists()
    }

    /// Removes the current blob. With `version` given, removes only that
    /// versioned blob instead. With `cascade`, removes the current blob and
    /// every versioned copy.
    pub async fn delete(&self, name: &str, version: Option<u64>, cascade: bool) -> Result<()> {
        validate_file_name(name)?;

        if let Some(v) = version {
            let path = self.version_path(name, v);
            if !path.exists() {
                return Err(Error::NotFound(format!(
                    "Version {} of '{}' not found",
                    v, name
                )));
            }
            fs::remove_file(&path).await.map_err(|e| {
                Error::Internal(format!("Failed to delete version blob {:?}: {}", path, e))
            })?;
            return Ok(());
        }

        let current = self.current_path(name);
        if !current.exists() {
            return Err(Error::NotFound(format!("File '{}' not found", name)));
        }
        fs::remove_file(&current)
            .await
            .map_err(|e| Error::Internal(format!("Failed to delete blob {:?}: {}", current, e)))?;

        if cascade {
            for v in self.list_versions(name).await? {
                let path = self.version_path(name, v);
                if let Err(e) = fs::remove_file(&path).await {
                    tracing::warn!(
                        file_name = %name,
                        version = v,
                        error = %e,
                        "Failed to remove version blob during cascade delete"
                    );
                }
            }
        }

        Ok(())
    }

    /// Lists the names with a current blob.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.files_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to list files directory {:?}: {}",
                self.files_dir, e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read directory entry: {}", e)))?
        {
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip in-flight atomic-write temp files.
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Lists the stored version numbers for `name`, ascending.
    pub async fn list_versions(&self, name: &str) -> Result<Vec<u64>> {
        validate_file_name(name)?;

        let prefix = format!("{}.v", name);
        let mut versions = Vec::new();
        let mut entries = fs::read_dir(&self.versions_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to list versions directory {:?}: {}",
                self.versions_dir, e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read directory entry: {}", e)))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(suffix) = file_name.strip_prefix(&prefix) {
                if let Ok(v) = suffix.parse::<u64>() {
                    versions.push(v);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Retargets the current blob and every versioned blob from `old` to
    /// `new`.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_file_name(old)?;
        validate_file_name(new)?;

        let source = self.current_path(old);
        if source.exists() {
            let target = self.current_path(new);
            fs::rename(&source, &target).await.map_err(|e| {
                Error::Internal(format!(
                    "Failed to rename blob {:?} -> {:?}: {}",
                    source, target, e
                ))
            })?;
        }

        for v in self.list_versions(old).await? {
            let source = self.version_path(old, v);
            let target = self.version_path(new, v);
            fs::rename(&source, &target).await.map_err(|e| {
                Error::Internal(format!(
                    "Failed to rename version blob {:?} -> {:?}: {}",
                    source, target, e
                ))
            })?;
        }

        Ok(())
    }
}
