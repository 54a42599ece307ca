//! Compression stage: packs a completed chapter directory into a CBZ.
//!
//! A CBZ is a zip archive with store-only entries (pages are already
//! compressed image formats). The archive is written next to the chapter
//! directory with the tmp suffix and the raw directory is removed once the
//! archive is complete; finalization later strips the suffix. Failures are
//! not retried here; the orchestrator parks the chapter in `Failed`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use zip::CompressionMethod;
use zip::write::FileOptions;

use super::artifact;
use super::error::DownloadError;

/// Archives the given temporary chapter directory into `<name>.cbz.tmp`.
///
/// One archive entry per file in the directory, in filesystem enumeration
/// order. Runs the blocking zip work on the blocking thread pool.
///
/// # Errors
///
/// Returns [`DownloadError::Compression`] on any I/O or zip failure, and
/// when `dir` does not carry the tmp suffix.
#[instrument(fields(dir = %dir.display()))]
pub async fn compress_chapter(dir: &Path) -> Result<PathBuf, DownloadError> {
    let dir = dir.to_path_buf();
    let archive_path = artifact::archive_tmp_path(&dir).ok_or_else(|| {
        DownloadError::Compression {
            message: format!("not a temporary chapter directory: {}", dir.display()),
        }
    })?;

    let written = archive_path.clone();
    tokio::task::spawn_blocking(move || write_archive(&dir, &written))
        .await
        .map_err(|e| DownloadError::Compression {
            message: format!("compression task failed: {e}"),
        })?
        .map_err(|e| DownloadError::Compression {
            message: e.to_string(),
        })?;

    Ok(archive_path)
}

/// Zips every file of `dir` into `archive_path` and removes `dir`.
fn write_archive(dir: &Path, archive_path: &Path) -> io::Result<()> {
    let file = File::create(archive_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    let mut entries = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        zip.start_file(name, options)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let mut page = File::open(entry.path())?;
        io::copy(&mut page, &mut zip)?;
        entries += 1;
    }

    zip.finish().map_err(|e| io::Error::other(e.to_string()))?;
    debug!(entries, archive = %archive_path.display(), "chapter archived");

    std::fs::remove_dir_all(dir)?;
    Ok(())
}
