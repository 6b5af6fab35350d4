use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fresh, not yet created, directory name under `temp_root` for one run's images.
pub fn scratch_dir(temp_root: &Path) -> PathBuf {
    temp_root.join(format!("import-images-{}", Uuid::new_v4().simple()))
}

/// Lets the owner of a run stop its blocking extraction and wait for it.
///
/// Aborting the async task does not stop a `spawn_blocking` closure, so the
/// closure holds `active` until it returns and checks `cancel` between entries.
#[derive(Debug, Clone, Default)]
pub struct ExtractionHandle {
    cancel: CancellationToken,
    active: Arc<Mutex<()>>,
}

impl ExtractionHandle {
    /// Returns once no extraction started through this handle can still write.
    pub async fn cancel_and_wait(&self) {
        self.cancel.cancel();
        let _idle = self.active.lock().await;
    }
}

/// Extracts into `target` (created if missing). On failure the partially
/// written directory is removed and `false` is returned; the caller carries on
/// without images.
pub async fn extract_into(zip_path: &Path, target: &Path, handle: &ExtractionHandle) -> bool {
    let zip_path = zip_path.to_path_buf();
    let target = target.to_path_buf();
    let active = handle.active.clone().lock_owned().await;
    let cancel = handle.cancel.clone();
    let result = tokio::task::spawn_blocking({
        let target = target.clone();
        move || {
            let _active = active;
            unpack(&zip_path, &target, &cancel)
        }
    })
    .await;
    match result {
        Ok(Ok(count)) => {
            debug!(target = "catalog.archive", dir = %target.display(), files = count, "archive_extracted");
            true
        }
        Ok(Err(err)) => {
            warn!(target = "catalog.archive", error = %err, "archive_extract_failed");
            discard(&target).await;
            false
        }
        Err(err) => {
            warn!(target = "catalog.archive", error = %err, "archive_task_failed");
            discard(&target).await;
            false
        }
    }
}

async fn discard(target: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(target).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(target = "catalog.archive", dir = %target.display(), error = %err, "partial_extract_cleanup_failed");
    }
}

fn unpack(zip_path: &Path, target: &Path, cancel: &CancellationToken) -> Result<usize, ArchiveError> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    fs::create_dir_all(target)?;
    let mut written = 0;
    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        // entries whose names would escape the target are skipped
        let Some(relative) = entry.enclosed_name() else {
            warn!(target = "catalog.archive", entry = entry.name(), "unsafe_archive_entry_skipped");
            continue;
        };
        if is_platform_metadata(&relative) {
            continue;
        }
        let out_path = target.join(relative);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}

// macOS zips carry `__MACOSX/._name` resource forks that look like images by name.
fn is_platform_metadata(path: &Path) -> bool {
    path.components().any(|part| part.as_os_str() == "__MACOSX")
        || path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("._"))
}

#[derive(Debug, thiserror::Error)]
enum ArchiveError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("extraction cancelled")]
    Cancelled,
}
