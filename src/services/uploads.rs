use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Most recently modified file under `<upload_dir>/<upload_key>/`, as a path string.
/// An empty string means nothing was uploaded yet.
pub(crate) async fn latest_upload(upload_dir: &Path, upload_key: &str) -> String {
    let dir = upload_dir.join(upload_key);
    match newest_file(&dir).await {
        Ok(Some(path)) => path.display().to_string(),
        Ok(None) => {
            tracing::debug!(dir = %dir.display(), "No uploaded files");
            String::new()
        }
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "Failed to scan upload directory");
            String::new()
        }
    }
}

async fn newest_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        let path = entry.path();
        let replace = match &newest {
            None => true,
            Some((best_time, best_path)) => {
                modified > *best_time || (modified == *best_time && path > *best_path)
            }
        };
        if replace {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}
