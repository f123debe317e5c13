//! Local disk backend.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, SeekFrom};

use crate::error::{FsError, Result};
use crate::fileinfo::FileInfo;
use crate::fs::{DirUsage, Fs, WalkFn, WriteMode};
use crate::pathutil;
use crate::pipe::{CommitFuture, TransferReader, TransferWriter};

/// Storage backend rooted at a directory of the local filesystem.
///
/// The only backend with native random access: uploads resume by appending
/// and fresh uploads are atomic, written to a hidden temp name in the target
/// directory and renamed into place on finish.
pub struct LocalFs {
    root: PathBuf,
    label: String,
}

impl LocalFs {
    /// Create a backend rooted at `root`. The directory is not touched until
    /// the first operation.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(FsError::Config("local root directory is empty".into()));
        }
        let label = format!("LocalFs \"{}\"", root.display());
        Ok(Self { root, label })
    }

    fn native(&self, virtual_path: &str) -> PathBuf {
        let rel = pathutil::clean(virtual_path);
        if rel == "/" {
            self.root.clone()
        } else {
            self.root.join(&rel[1..])
        }
    }

    fn info_from_metadata(name: &str, meta: &std::fs::Metadata) -> FileInfo {
        FileInfo::new(
            name,
            meta.is_dir(),
            meta.len(),
            meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        )
    }

    /// Hidden temp name next to the target, so the final rename never
    /// crosses filesystems.
    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = format!(".{}.ftmp{:08x}", name, rand::random::<u32>());
        target.with_file_name(tmp)
    }
}

#[async_trait]
impl Fs for LocalFs {
    fn name(&self) -> &str {
        &self.label
    }

    fn resolve(&self, virtual_path: &str) -> String {
        self.native(virtual_path).to_string_lossy().into_owned()
    }

    fn relative_path(&self, native_path: &str) -> String {
        match Path::new(native_path).strip_prefix(&self.root) {
            Ok(rel) => pathutil::clean(&format!("/{}", rel.to_string_lossy())),
            Err(_) => "/".to_string(),
        }
    }

    fn join(&self, elems: &[&str]) -> String {
        pathutil::join(elems)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(self.native(path)).await?;
        let name = pathutil::base(&pathutil::clean(path)).to_string();
        Ok(Self::info_from_metadata(&name, &meta))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo> {
        let meta = tokio::fs::symlink_metadata(self.native(path)).await?;
        let name = pathutil::base(&pathutil::clean(path)).to_string();
        Ok(Self::info_from_metadata(&name, &meta))
    }

    async fn open(&self, path: &str, offset: u64) -> Result<TransferReader> {
        let mut file = tokio::fs::File::open(self.native(path)).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(TransferReader::direct(Box::new(file)))
    }

    async fn create(&self, path: &str, mode: WriteMode) -> Result<TransferWriter> {
        let target = self.native(path);
        match mode {
            WriteMode::Append => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .await?;
                Ok(TransferWriter::direct(Box::new(file), None, None))
            }
            WriteMode::Overwrite => {
                let temp = Self::temp_path(&target);
                let file = tokio::fs::File::create(&temp).await?;
                let commit_temp = temp.clone();
                let commit: CommitFuture = Box::pin(async move {
                    tokio::fs::rename(&commit_temp, &target).await?;
                    Ok(())
                });
                let cleanup = Box::new(move || {
                    let _ = std::fs::remove_file(&temp);
                });
                Ok(TransferWriter::direct(
                    Box::new(file),
                    Some(commit),
                    Some(cleanup),
                ))
            }
        }
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        if pathutil::clean(source) == pathutil::clean(target) {
            return Ok(());
        }
        log::debug!("{}: rename {source} -> {target}", self.label);
        Ok(tokio::fs::rename(self.native(source), self.native(target)).await?)
    }

    async fn remove(&self, path: &str, is_dir: bool) -> Result<()> {
        log::debug!("{}: remove {path} (dir: {is_dir})", self.label);
        let native = self.native(path);
        let res = if is_dir {
            tokio::fs::remove_dir(&native).await
        } else {
            tokio::fs::remove_file(&native).await
        };
        res.map_err(|err| {
            if err.kind() == std::io::ErrorKind::DirectoryNotEmpty {
                FsError::DirNotEmpty(path.to_string())
            } else {
                err.into()
            }
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        match tokio::fs::create_dir(self.native(path)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let meta = tokio::fs::metadata(self.native(path)).await?;
                if meta.is_dir() {
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn symlink(&self, source: &str, target: &str) -> Result<()> {
        #[cfg(unix)]
        {
            Ok(tokio::fs::symlink(self.native(source), self.native(target)).await?)
        }
        #[cfg(not(unix))]
        {
            Err(FsError::Unsupported(format!(
                "symlink {source} -> {target} is not available on this platform"
            )))
        }
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        let target = tokio::fs::read_link(self.native(path)).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            Ok(std::os::unix::fs::chown(
                self.native(path),
                Some(uid),
                Some(gid),
            )?)
        }
        #[cfg(not(unix))]
        {
            let _ = (uid, gid);
            Err(FsError::Unsupported(format!(
                "chown {path} is not available on this platform"
            )))
        }
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = std::fs::Permissions::from_mode(mode);
            Ok(tokio::fs::set_permissions(self.native(path), perm).await?)
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            Err(FsError::Unsupported(format!(
                "chmod {path} is not available on this platform"
            )))
        }
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let native = self.native(path);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&native)?;
            let times = std::fs::FileTimes::new()
                .set_accessed(atime)
                .set_modified(mtime);
            file.set_times(times)
        })
        .await
        .map_err(|err| FsError::backend(format!("chtimes task failed: {err}")))??;
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(self.native(path)).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            entries.push(Self::info_from_metadata(&name, &meta));
        }
        Ok(entries)
    }

    async fn walk(&self, root: &str, walk_fn: &mut WalkFn) -> Result<()> {
        let root_clean = pathutil::clean(root);
        let mut terminal: Option<FsError> = None;
        let mut stack = vec![root_clean.clone()];
        'scan: while let Some(dir_path) = stack.pop() {
            let mut rd = match tokio::fs::read_dir(self.native(&dir_path)).await {
                Ok(rd) => rd,
                Err(err) => {
                    terminal = Some(err.into());
                    break;
                }
            };
            loop {
                let entry = match rd.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        terminal = Some(err.into());
                        break 'scan;
                    }
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = pathutil::join(&[&dir_path, &name]);
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(err) => {
                        terminal = Some(err.into());
                        break 'scan;
                    }
                };
                let info = Self::info_from_metadata(&name, &meta);
                if let Err(err) = walk_fn(&child, &info, None) {
                    terminal = Some(err);
                    break 'scan;
                }
                if meta.is_dir() {
                    stack.push(child);
                }
            }
        }
        let root_info = FileInfo::dir(pathutil::base(&root_clean));
        let _ = walk_fn(&root_clean, &root_info, terminal.as_ref());
        match terminal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn dir_size(&self, path: &str) -> Result<DirUsage> {
        let mut usage = DirUsage::default();
        let mut count = |_: &str, info: &FileInfo, err: Option<&FsError>| -> Result<()> {
            if err.is_none() && info.is_file() {
                usage.add_file(info.size());
            }
            Ok(())
        };
        self.walk(path, &mut count).await?;
        Ok(usage)
    }

    async fn scan_root_contents(&self) -> Result<DirUsage> {
        self.dir_size("/").await
    }

    fn is_upload_resume_supported(&self) -> bool {
        true
    }

    fn is_atomic_upload_supported(&self) -> bool {
        true
    }

    fn has_virtual_folders(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn write_file(fs: &LocalFs, path: &str, data: &[u8]) {
        let mut writer = fs.create(path, WriteMode::Overwrite).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[test]
    fn test_path_round_trip() {
        let fs = LocalFs::new("/srv/data").unwrap();
        for path in ["/", "/a", "/a/b.txt", "/a/../c"] {
            let native = fs.resolve(path);
            assert_eq!(fs.relative_path(&native), pathutil::clean(path));
        }
    }

    #[test]
    fn test_relative_path_confines_to_root() {
        let fs = LocalFs::new("/srv/data").unwrap();
        assert_eq!(fs.relative_path("/etc/passwd"), "/");
        assert_eq!(fs.relative_path("/srv/data2/file"), "/");
    }

    #[test]
    fn test_empty_root_rejected() {
        assert!(matches!(LocalFs::new(""), Err(FsError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_stat_open() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        write_file(&fs, "/hello.txt", b"hello world").await;

        let info = fs.stat("/hello.txt").await.unwrap();
        assert_eq!(info.name(), "hello.txt");
        assert_eq!(info.size(), 11);
        assert!(info.is_file());

        let mut reader = fs.open("/hello.txt", 6).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
    }

    #[tokio::test]
    async fn test_atomic_upload_not_visible_until_finish() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        let mut writer = fs.create("/data.bin", WriteMode::Overwrite).await.unwrap();
        writer.write_all(b"xyz").await.unwrap();
        assert!(fs.stat("/data.bin").await.unwrap_err().is_not_exist());
        writer.finish().await.unwrap();
        assert_eq!(fs.stat("/data.bin").await.unwrap().size(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_upload_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        let mut writer = fs.create("/data.bin", WriteMode::Overwrite).await.unwrap();
        writer.write_all(b"xyz").await.unwrap();
        writer.cancel();
        drop(writer);
        assert!(fs.read_dir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_resumes_upload() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        write_file(&fs, "/log.txt", b"abc").await;
        let mut writer = fs.create("/log.txt", WriteMode::Append).await.unwrap();
        writer.write_all(b"def").await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = fs.open("/log.txt", 0).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abcdef");
    }

    #[tokio::test]
    async fn test_rename_same_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        // The path does not exist; success proves no backend call was made.
        fs.rename("/ghost.txt", "/ghost.txt").await.unwrap();
        fs.rename("/a/../ghost.txt", "/ghost.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        fs.mkdir("/sub").await.unwrap();
        fs.mkdir("/sub").await.unwrap();
        write_file(&fs, "/file", b"x").await;
        assert!(fs.mkdir("/file").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_non_empty_dir_is_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        fs.mkdir("/sub").await.unwrap();
        write_file(&fs, "/sub/file", b"x").await;
        let err = fs.remove("/sub", true).await.unwrap_err();
        assert!(matches!(err, FsError::DirNotEmpty(_)));
        fs.remove("/sub/file", false).await.unwrap();
        fs.remove("/sub", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_walk_visits_every_entry_plus_terminal_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        fs.mkdir("/a").await.unwrap();
        fs.mkdir("/a/b").await.unwrap();
        write_file(&fs, "/a/one", b"1").await;
        write_file(&fs, "/a/b/two", b"22").await;

        let mut entries = 0usize;
        let mut terminal = 0usize;
        let mut cb = |path: &str, info: &FileInfo, err: Option<&FsError>| -> Result<()> {
            if path == "/" && info.is_dir() {
                terminal += 1;
                assert!(err.is_none());
            } else {
                entries += 1;
            }
            Ok(())
        };
        fs.walk("/", &mut cb).await.unwrap();
        // /a, /a/b, /a/one, /a/b/two
        assert_eq!(entries, 4);
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn test_walk_callback_error_still_gets_terminal_call() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        write_file(&fs, "/one", b"1").await;
        write_file(&fs, "/two", b"2").await;

        let mut calls = 0usize;
        let mut saw_terminal_error = false;
        let mut cb = |path: &str, _info: &FileInfo, err: Option<&FsError>| -> Result<()> {
            calls += 1;
            if path == "/" {
                saw_terminal_error = err.is_some();
                return Ok(());
            }
            Err(FsError::backend("stop"))
        };
        let res = fs.walk("/", &mut cb).await;
        assert!(res.is_err());
        // One entry callback that failed, plus the mandatory terminal call.
        assert_eq!(calls, 2);
        assert!(saw_terminal_error);
    }

    #[tokio::test]
    async fn test_chtimes_updates_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        write_file(&fs, "/stamped", b"x").await;
        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        fs.chtimes("/stamped", when, when).await.unwrap();
        assert_eq!(fs.stat("/stamped").await.unwrap().modified(), when);
    }

    #[tokio::test]
    async fn test_dir_size_counts_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        fs.mkdir("/a").await.unwrap();
        write_file(&fs, "/a/one", b"12345").await;
        write_file(&fs, "/top", b"123").await;

        let usage = fs.scan_root_contents().await.unwrap();
        assert_eq!(usage.files, 2);
        assert_eq!(usage.size, 8);
    }
}
