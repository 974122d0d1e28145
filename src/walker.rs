use crate::error::AppError;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Sends every regular file below `root` to `paths_tx`. Unreadable entries are skipped.
pub fn start_walking(
    root: &Path,
    paths_tx: crossbeam_channel::Sender<PathBuf>,
) -> Result<(), AppError> {
    log::info!("Starting file discovery in {:?}", root);

    if !root.is_dir() {
        return Err(AppError::NotFound(format!("directory root {:?}", root)));
    }

    let mut discovered = 0usize;
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry under {:?}: {}", root, e);
                continue;
            }
        };
        if entry.file_type().is_file() {
            log::trace!("Discovered file: {:?}", entry.path());
            paths_tx.send(entry.into_path())?;
            discovered += 1;
        } else {
            log::trace!("Skipping non-file entry: {:?}", entry.path());
        }
    }

    log::info!("File discovery complete, {} files under {:?}", discovered, root);
    Ok(())
}

/// Walks `root` on a blocking thread and returns the discovered files, sorted.
pub async fn collect_files(root: PathBuf) -> Result<Vec<PathBuf>, AppError> {
    let (paths_tx, paths_rx) = crossbeam_channel::unbounded();

    let walker_handle = tokio::task::spawn_blocking(move || start_walking(&root, paths_tx));
    let collector_handle =
        tokio::task::spawn_blocking(move || paths_rx.iter().collect::<Vec<PathBuf>>());

    let (walked, mut paths) = tokio::try_join!(walker_handle, collector_handle)?;
    walked?;
    paths.sort();
    Ok(paths)
}
