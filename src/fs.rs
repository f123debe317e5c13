//! The storage contract every backend implements.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::fileinfo::FileInfo;
use crate::pipe::{TransferReader, TransferWriter};

/// How `create` positions the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace any existing content.
    Overwrite,
    /// Continue a previous upload at the current end of the file.
    ///
    /// This is the resume path; backends where
    /// [`Fs::is_upload_resume_supported`] is false reject it.
    Append,
}

/// Aggregate result of a recursive scan: file count and total bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirUsage {
    /// Number of regular files found
    pub files: i64,
    /// Total size of those files in bytes
    pub size: i64,
}

impl DirUsage {
    /// Account one regular file.
    pub fn add_file(&mut self, size: u64) {
        self.files += 1;
        self.size += size as i64;
    }
}

/// Callback driven by [`Fs::walk`].
///
/// Invoked once per discovered entry with `err == None`; returning an error
/// stops the traversal. After the scan the callback runs exactly once more
/// with the root path, a directory [`FileInfo`] and the terminal error,
/// `None` on success. The terminal call happens on failure as well, so the
/// caller always observes the outcome.
pub type WalkFn = dyn FnMut(&str, &FileInfo, Option<&FsError>) -> Result<()> + Send;

/// Uniform storage contract.
///
/// Callers hold `Arc<dyn Fs>` and never branch on the concrete backend; the
/// capability flags tell the session layer which transfer strategy to use.
/// All paths handed to operations are absolute virtual paths (`/`-separated);
/// each backend maps them to its native keys via [`Fs::resolve`].
#[async_trait]
pub trait Fs: Send + Sync {
    /// Human-readable backend descriptor for logs and error messages.
    fn name(&self) -> &str;

    /// Map a virtual path to the backend-native path or key.
    fn resolve(&self, virtual_path: &str) -> String;

    /// Map a backend-native path back to the virtual namespace.
    ///
    /// Native paths outside the configured prefix collapse to `/` so keys
    /// never leak from under the prefix. For in-prefix paths this is the
    /// inverse of [`Fs::resolve`].
    fn relative_path(&self, native_path: &str) -> String;

    /// Join path elements using the backend's delimiter conventions.
    fn join(&self, elems: &[&str]) -> String;

    /// Metadata for a path, following symlinks where the backend has them.
    ///
    /// The root (`/`, `""` or `.`) stats as a directory iff the backend's
    /// root container is reachable; reachability failures propagate as-is
    /// instead of being masked as not-found.
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Metadata without following symlinks; aliases [`Fs::stat`] on backends
    /// that have none.
    async fn lstat(&self, path: &str) -> Result<FileInfo>;

    /// Open a readable stream positioned at `offset`.
    ///
    /// Backends that cannot honor the offset for the object's encoding
    /// reject the request with a descriptive error instead of silently
    /// starting from zero.
    async fn open(&self, path: &str, offset: u64) -> Result<TransferReader>;

    /// Open a writable stream; the write is committed by
    /// [`TransferWriter::finish`].
    ///
    /// When [`Fs::is_atomic_upload_supported`] is true the commit is
    /// all-or-nothing; otherwise the data goes through an intermediate name
    /// and a final rename.
    async fn create(&self, path: &str, mode: WriteMode) -> Result<TransferWriter>;

    /// Rename `source` to `target`. Succeeds without any backend call when
    /// the two resolve to the same path. On backends without a native
    /// recursive move, renaming a non-empty directory fails with
    /// [`FsError::DirNotEmpty`] and touches nothing.
    async fn rename(&self, source: &str, target: &str) -> Result<()>;

    /// Remove a file or directory; directory removal requires emptiness
    /// under the same rule as [`Fs::rename`].
    async fn remove(&self, path: &str, is_dir: bool) -> Result<()>;

    /// Create a directory. Succeeds as a no-op when the path already exists
    /// as a directory.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Create a symbolic link at `target` pointing to `source`.
    async fn symlink(&self, source: &str, target: &str) -> Result<()>;

    /// Read the target of a symbolic link.
    async fn readlink(&self, path: &str) -> Result<String>;

    /// Change ownership. Silent success on backends without the concept.
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;

    /// Change permission bits. Silent success on backends without the concept.
    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    /// Change access/modification times.
    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()>;

    /// Immediate children of a directory, one level deep: real entries and
    /// prefix-emulated subdirectories, de-duplicated, tombstones filtered.
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Depth-unbounded traversal from `root`; see [`WalkFn`] for the
    /// callback contract. Returns the terminal error, if any.
    async fn walk(&self, root: &str, walk_fn: &mut WalkFn) -> Result<()>;

    /// Recursive file-count/byte scan of a subtree. Backends that cannot
    /// scan arbitrary subtrees return [`FsError::Unsupported`] rather than a
    /// wrong zero.
    async fn dir_size(&self, path: &str) -> Result<DirUsage>;

    /// Recursive scan of the whole backend root; drives quota recompute.
    async fn scan_root_contents(&self) -> Result<DirUsage>;

    /// Whether `create` may be called with [`WriteMode::Append`].
    fn is_upload_resume_supported(&self) -> bool;

    /// Whether a committed upload is visible all-or-nothing.
    fn is_atomic_upload_supported(&self) -> bool;

    /// Whether virtual folders may be mounted on top of this backend.
    fn has_virtual_folders(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_usage_accumulates() {
        let mut usage = DirUsage::default();
        usage.add_file(100);
        usage.add_file(28);
        assert_eq!(usage.files, 2);
        assert_eq!(usage.size, 128);
    }
}
