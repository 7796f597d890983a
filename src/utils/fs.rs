use std::path::Path;
use tokio::fs;

/// Writes `bytes` to `path` atomically with respect to concurrent readers:
/// the content goes to a temp file in the same directory first and is then
/// renamed over the target. Readers observe either the old blob or the new
/// one, never a partial write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blob".to_string());
    let tmp = dir.join(format!(".{}.tmp-{}", base, crate::utils::generate_id()));

    fs::write(&tmp, bytes).await?;
    match fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Leave no temp droppings behind on a failed rename.
            let _ = fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("note.txt");

        write_atomic(&target, b"hello").await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("note.txt");

        write_atomic(&target, b"one").await.unwrap();
        write_atomic(&target, b"two").await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("note.txt");

        write_atomic(&target, b"data").await.unwrap();

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["note.txt"]);
    }
}
