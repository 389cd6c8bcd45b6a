//! Storage layout for transferred files.
//!
//! Serving side: `<storage-root>/<username>/<name>`. The directory comes
//! from the username only; `name` must be a bare file name, so a client can
//! never steer a write outside its own directory.
//!
//! Requesting side: `down-<stem>/<name>`, where `<stem>` is the received
//! name with its extension stripped.
//!
//! Incoming bytes always land in a hidden `.part` file next to the final
//! path and are renamed into place only once the caller has verified them.
//! Two uploads of the same name for the same user still race; whichever
//! rename happens last wins.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Prefix of client-side download directories
pub const DOWNLOAD_DIR_PREFIX: &str = "down-";

/// Suffix of in-progress files
const PART_SUFFIX: &str = ".part";

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// File name is empty, contains a path separator, or is a relative component
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// Username cannot be used as a directory name
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// Filesystem I/O error
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Check that `name` is a bare file name
///
/// Rejects empty names, `.`/`..`, anything containing `/`, `\` or NUL, and
/// anything that does not parse as exactly one normal path component.
/// Hidden names ending in `.part` are reserved for in-progress files and
/// rejected too, so a peer can neither read nor replace one.
pub fn validate_file_name(name: &str) -> Result<&str, StorageError> {
    if !is_single_component(name) || is_pending_name(name) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(name)
}

fn is_pending_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PART_SUFFIX)
}

fn validate_dir_name(username: &str) -> Result<&str, StorageError> {
    if !is_single_component(username) {
        return Err(StorageError::InvalidUsername(username.to_string()));
    }
    Ok(username)
}

fn is_single_component(s: &str) -> bool {
    if s.is_empty() || s.contains(['/', '\\', '\0']) {
        return false;
    }

    let mut components = Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Directory a downloaded file is stored in, relative to `base`
///
/// `report.txt` lands in `down-report/`, `archive.tar.gz` in
/// `down-archive.tar/`.
pub fn download_dir_for(base: &Path, name: &str) -> Result<PathBuf, StorageError> {
    let name = validate_file_name(name)?;
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    Ok(base.join(format!("{DOWNLOAD_DIR_PREFIX}{stem}")))
}

/// Root of the serving side's storage tree
#[derive(Debug, Clone)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    /// Create a storage root (the directory is created lazily)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory holding a user's files
    pub fn user_dir(&self, username: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_dir_name(username)?))
    }

    /// Ensure the user's directory exists, creating it if absent
    pub async fn ensure_user_dir(&self, username: &str) -> Result<PathBuf, StorageError> {
        let dir = self.user_dir(username)?;
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Final path of a user's file
    pub fn resolve(&self, username: &str, name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.user_dir(username)?.join(validate_file_name(name)?))
    }

    /// Open a stored file for reading, `None` if it does not exist
    pub async fn open(&self, username: &str, name: &str) -> Result<Option<File>, StorageError> {
        let path = self.resolve(username, name)?;
        match File::open(&path).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Start receiving a file for `username`
    pub async fn begin_upload(
        &self,
        username: &str,
        name: &str,
    ) -> Result<PendingFile, StorageError> {
        let name = validate_file_name(name)?;
        let dir = self.ensure_user_dir(username).await?;
        PendingFile::create(dir.join(name)).await
    }
}

/// A file being written under a temporary name
///
/// Bytes are written to `.<name>.<pid>-<seq>.part` in the destination
/// directory. [`commit`](Self::commit) renames it to the final path,
/// [`discard`](Self::discard) deletes it. Dropping an unfinished pending
/// file deletes the temporary file as well.
#[derive(Debug)]
pub struct PendingFile {
    file: File,
    guard: TempGuard,
}

/// Removes the temporary file unless the pending file was finished
#[derive(Debug)]
struct TempGuard {
    temp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

impl PendingFile {
    /// Create the temporary file for `final_path`
    ///
    /// The parent directory must exist.
    pub async fn create(final_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let final_path = final_path.into();
        let name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidName(final_path.display().to_string()))?;

        let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp_name = format!(".{name}.{}-{seq}{PART_SUFFIX}", std::process::id());
        let temp_path = final_path.with_file_name(temp_name);

        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        tracing::trace!("Created pending file {}", temp_path.display());

        Ok(Self {
            file,
            guard: TempGuard {
                temp_path,
                final_path,
                finished: false,
            },
        })
    }

    /// Writable handle to the temporary file
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Path of the temporary file
    pub fn temp_path(&self) -> &Path {
        &self.guard.temp_path
    }

    /// Path the file will have once committed
    pub fn final_path(&self) -> &Path {
        &self.guard.final_path
    }

    /// Pre-size the file to its declared length
    pub async fn preallocate(&mut self, size: u64) -> Result<(), StorageError> {
        self.file.set_len(size).await?;
        Ok(())
    }

    /// Flush buffered writes and sync to disk
    pub async fn sync(&mut self) -> Result<(), StorageError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    /// Rename into place, replacing any existing file with the same name
    pub async fn commit(mut self) -> Result<PathBuf, StorageError> {
        self.sync().await?;
        let Self { file, mut guard } = self;
        drop(file);

        fs::rename(&guard.temp_path, &guard.final_path).await?;
        guard.finished = true;

        tracing::debug!("Committed {}", guard.final_path.display());
        Ok(guard.final_path.clone())
    }

    /// Delete the temporary file
    pub async fn discard(self) -> Result<(), StorageError> {
        let Self { file, mut guard } = self;
        drop(file);
        guard.finished = true;

        match fs::remove_file(&guard.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("Discarded {}", guard.temp_path.display());
        Ok(())
    }
}
