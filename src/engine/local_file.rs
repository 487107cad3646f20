// Cache file creation: parent directories, permission bits and numeric ownership.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use crate::error::{CacheError, Result};

/// Where and how a cache file is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: PathBuf,
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Deterministic cache file location: `<cache_dir>/<bucket>/<object>`.
pub fn cache_file_path(cache_dir: &Path, bucket: &str, object: &str) -> Result<PathBuf> {
    let relative = Path::new(bucket).join(object);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(CacheError::InvalidKey(format!(
                    "{bucket}/{object} does not map to a path inside the cache directory"
                )))
            }
        }
    }
    Ok(cache_dir.join(relative))
}

/// Create the file (and missing parent directories) if needed and open it.
///
/// Existing contents are never truncated.
pub fn create_file(spec: &FileSpec, writable: bool) -> Result<File> {
    if let Some(dir) = spec.path.parent() {
        // Directories need the execute bit wherever the file mode grants read.
        let dir_mode = spec.mode | ((spec.mode & 0o444) >> 2);
        DirBuilder::new()
            .recursive(true)
            .mode(dir_mode)
            .create(dir)
            .map_err(|e| {
                CacheError::io(
                    format!("error creating directory structure {}", dir.display()),
                    e,
                )
            })?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(writable)
        .create(writable)
        .mode(spec.mode)
        .open(&spec.path)
        .or_else(|e| match e.kind() {
            // Read-only handles may be opened before the job has created the file.
            std::io::ErrorKind::NotFound if !writable => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(spec.mode)
                .open(&spec.path),
            _ => Err(e),
        })
        .map_err(|e| CacheError::io(format!("error opening cache file {}", spec.path.display()), e))?;

    if spec.uid.is_some() || spec.gid.is_some() {
        std::os::unix::fs::chown(&spec.path, spec.uid, spec.gid).map_err(|e| {
            CacheError::io(
                format!(
                    "error changing ownership of {} to uid {:?} gid {:?}",
                    spec.path.display(),
                    spec.uid,
                    spec.gid
                ),
                e,
            )
        })?;
    }

    Ok(file)
}

/// Best-effort removal of a cache file. A missing file is not an error.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(
            format!("error removing cache file {}", path.display()),
            e,
        )),
    }
}
