use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::{
    error::LockError,
    locker::{Locker, LockerKind},
};

/// Advisory `flock(LOCK_EX)` on a designated file.
///
/// Exclusion holds between processes and between lockers of the same process that open the file
/// separately.
pub struct FileLocker {
    name: String,
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLocker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().unwrap().is_some()
    }
}

#[async_trait]
impl Locker for FileLocker {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LockerKind {
        LockerKind::File
    }

    #[instrument(level = "debug", skip(self), fields(lock = %self.name))]
    async fn lock(&self) -> Result<(), LockError> {
        if self.is_held() {
            return Ok(());
        }

        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || flock_exclusive(&path))
            .await
            .map_err(|e| LockError::io(&self.path, std::io::Error::other(e.to_string())))??;

        *self.held.lock().unwrap() = Some(file);
        debug!("file lock acquired");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let Some(file) = self.held.lock().unwrap().take() else {
            return Ok(());
        };
        flock(&file, libc::LOCK_UN).map_err(|e| LockError::io(&self.path, e))?;
        debug!(lock = %self.name, "file lock released");
        Ok(())
    }
}

fn flock_exclusive(path: &Path) -> Result<File, LockError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|e| LockError::io(dir, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| LockError::io(path, e))?;
    flock(&file, libc::LOCK_EX).map_err(|e| LockError::io(path, e))?;
    Ok(file)
}

fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
