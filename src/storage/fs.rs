//! A small filesystem abstraction so `FileBacked` storage can be exercised
//! against an in-memory fake in tests, the way the teacher tests
//! `enterprise::cloud::storage` against a fake backend rather than touching
//! the real filesystem in unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised by an [`IFileSystem`] implementation.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The parent directory of a non-recursive operation does not exist.
    #[error("missing parent directory: {0}")]
    MissingParent(String),

    /// Underlying OS I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

/// Result alias for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// File metadata returned by [`IFileSystem::stat`].
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Size of the file in bytes.
    pub size: u64,
    /// Whether the path names a directory rather than a file.
    pub is_dir: bool,
}

/// A minimal filesystem surface, abstracted so storage code can run against
/// either the real OS filesystem or an in-memory fake.
#[async_trait]
pub trait IFileSystem: Send + Sync {
    /// Create a directory. If `recursive`, also create missing parents and
    /// succeed if the directory already exists.
    async fn mkdir(&self, path: &Path, recursive: bool) -> FsResult<()>;

    /// List the immediate entries of a directory, as file names (not full
    /// paths).
    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>>;

    /// Read the full contents of a file.
    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>>;

    /// Write the full contents of a file, creating or truncating it.
    /// Fails with `MissingParent` unless the parent directory already exists.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> FsResult<()>;

    /// Remove a file.
    async fn unlink(&self, path: &Path) -> FsResult<()>;

    /// Rename/move a path, overwriting the destination if present.
    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;

    /// Remove a directory. If `recursive`, remove its contents too.
    async fn rmdir(&self, path: &Path, recursive: bool) -> FsResult<()>;

    /// Stat a path.
    async fn stat(&self, path: &Path) -> FsResult<Stat>;

    /// Whether a path exists at all (file or directory).
    async fn exists(&self, path: &Path) -> bool {
        self.stat(path).await.is_ok()
    }
}

/// The real OS filesystem, backed by `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

#[async_trait]
impl IFileSystem for OsFileSystem {
    async fn mkdir(&self, path: &Path, recursive: bool) -> FsResult<()> {
        let result = if recursive {
            tokio::fs::create_dir_all(path).await
        } else {
            tokio::fs::create_dir(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && recursive => Ok(()),
            Err(e) => Err(FsError::Io(e.to_string())),
        }
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| map_io_err(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| FsError::Io(e.to_string()))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| map_io_err(path, e))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> FsResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(FsError::MissingParent(parent.display().to_string()));
            }
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| FsError::Io(e.to_string()))
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| map_io_err(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| FsError::Io(e.to_string()))
    }

    async fn rmdir(&self, path: &Path, recursive: bool) -> FsResult<()> {
        let result = if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        };
        result.map_err(|e| map_io_err(path, e))
    }

    async fn stat(&self, path: &Path) -> FsResult<Stat> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io_err(path, e))?;
        Ok(Stat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }
}

fn map_io_err(path: &Path, e: std::io::Error) -> FsError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound(path.display().to_string())
    } else {
        FsError::Io(e.to_string())
    }
}

#[derive(Default)]
struct MemoryFsState {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

/// An in-memory filesystem fake, for tests. Normalizes paths by stripping
/// trailing separators and rejects writes/reads against missing parents when
/// `recursive` is not requested.
pub struct MemoryFileSystem {
    state: Mutex<MemoryFsState>,
}

impl MemoryFileSystem {
    /// Construct an empty in-memory filesystem with just the root directory.
    pub fn new() -> Self {
        let mut state = MemoryFsState::default();
        state.dirs.insert(PathBuf::from("/"));
        Self {
            state: Mutex::new(state),
        }
    }

    fn normalize(path: &Path) -> PathBuf {
        let s = path.to_string_lossy();
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(trimmed)
        }
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IFileSystem for MemoryFileSystem {
    async fn mkdir(&self, path: &Path, recursive: bool) -> FsResult<()> {
        let path = Self::normalize(path);
        let mut state = self.state.lock();
        if recursive {
            let mut cur = PathBuf::new();
            for component in path.iter() {
                cur.push(component);
                state.dirs.insert(cur.clone());
            }
            Ok(())
        } else {
            let parent = path.parent().map(Self::normalize).unwrap_or_else(|| PathBuf::from("/"));
            if !state.dirs.contains(&parent) {
                return Err(FsError::MissingParent(parent.display().to_string()));
            }
            state.dirs.insert(path);
            Ok(())
        }
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>> {
        let path = Self::normalize(path);
        let state = self.state.lock();
        if !state.dirs.contains(&path) {
            return Err(FsError::NotFound(path.display().to_string()));
        }
        let mut names = BTreeSet::new();
        for dir in &state.dirs {
            if let Some(parent) = dir.parent() {
                if Self::normalize(parent) == path && dir != &path {
                    if let Some(name) = dir.file_name() {
                        names.insert(name.to_string_lossy().into_owned());
                    }
                }
            }
        }
        for file in state.files.keys() {
            if let Some(parent) = file.parent() {
                if Self::normalize(parent) == path {
                    if let Some(name) = file.file_name() {
                        names.insert(name.to_string_lossy().into_owned());
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let path = Self::normalize(path);
        let state = self.state.lock();
        state
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.display().to_string()))
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> FsResult<()> {
        let path = Self::normalize(path);
        let mut state = self.state.lock();
        let parent = path.parent().map(Self::normalize).unwrap_or_else(|| PathBuf::from("/"));
        if !state.dirs.contains(&parent) {
            return Err(FsError::MissingParent(parent.display().to_string()));
        }
        state.files.insert(path, contents.to_vec());
        Ok(())
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        let path = Self::normalize(path);
        let mut state = self.state.lock();
        state
            .files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.display().to_string()))
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        let mut state = self.state.lock();
        if let Some(bytes) = state.files.remove(&from) {
            state.files.insert(to, bytes);
            return Ok(());
        }
        if state.dirs.remove(&from) {
            state.dirs.insert(to);
            return Ok(());
        }
        Err(FsError::NotFound(from.display().to_string()))
    }

    async fn rmdir(&self, path: &Path, recursive: bool) -> FsResult<()> {
        let path = Self::normalize(path);
        let mut state = self.state.lock();
        if !state.dirs.contains(&path) {
            return Err(FsError::NotFound(path.display().to_string()));
        }
        if recursive {
            state.dirs.retain(|d| d != &path && !d.starts_with(&path));
            state.files.retain(|f, _| !f.starts_with(&path));
        } else {
            let has_children = state.dirs.iter().any(|d| d != &path && d.starts_with(&path))
                || state.files.keys().any(|f| f.starts_with(&path));
            if has_children {
                return Err(FsError::Io("directory not empty".to_string()));
            }
            state.dirs.remove(&path);
        }
        Ok(())
    }

    async fn stat(&self, path: &Path) -> FsResult<Stat> {
        let path = Self::normalize(path);
        let state = self.state.lock();
        if let Some(bytes) = state.files.get(&path) {
            return Ok(Stat {
                size: bytes.len() as u64,
                is_dir: false,
            });
        }
        if state.dirs.contains(&path) {
            return Ok(Stat { size: 0, is_dir: true });
        }
        Err(FsError::NotFound(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_requires_existing_parent_unless_recursive_mkdir() {
        let fs = MemoryFileSystem::new();
        let err = fs
            .write_file(Path::new("/docs/a/file.txt"), b"hi")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::MissingParent(_)));

        fs.mkdir(Path::new("/docs/a"), true).await.unwrap();
        fs.write_file(Path::new("/docs/a/file.txt"), b"hi")
            .await
            .unwrap();
        assert_eq!(
            fs.read_file(Path::new("/docs/a/file.txt")).await.unwrap(),
            b"hi"
        );
    }

    #[tokio::test]
    async fn readdir_lists_files_and_subdirs() {
        let fs = MemoryFileSystem::new();
        fs.mkdir(Path::new("/docs"), true).await.unwrap();
        fs.mkdir(Path::new("/docs/sub"), true).await.unwrap();
        fs.write_file(Path::new("/docs/a.txt"), b"x").await.unwrap();
        let mut names = fs.readdir(Path::new("/docs")).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "sub".to_string()]);
    }

    #[tokio::test]
    async fn rename_moves_file_contents() {
        let fs = MemoryFileSystem::new();
        fs.mkdir(Path::new("/docs"), true).await.unwrap();
        fs.write_file(Path::new("/docs/a.tmp"), b"payload")
            .await
            .unwrap();
        fs.rename(Path::new("/docs/a.tmp"), Path::new("/docs/a.final"))
            .await
            .unwrap();
        assert!(fs.read_file(Path::new("/docs/a.tmp")).await.is_err());
        assert_eq!(
            fs.read_file(Path::new("/docs/a.final")).await.unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn rmdir_non_recursive_rejects_nonempty() {
        let fs = MemoryFileSystem::new();
        fs.mkdir(Path::new("/docs"), true).await.unwrap();
        fs.write_file(Path::new("/docs/a.txt"), b"x").await.unwrap();
        assert!(fs.rmdir(Path::new("/docs"), false).await.is_err());
        fs.rmdir(Path::new("/docs"), true).await.unwrap();
        assert!(!fs.exists(Path::new("/docs")).await);
    }
}
