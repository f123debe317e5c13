//! Per-user namespace: a home backend, mounted virtual folders, and quota
//! enforcement composed behind one path-addressed surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{FsError, Result};
use crate::fileinfo::FileInfo;
use crate::folder::{self, FolderMapping, FolderResolver};
use crate::fs::{DirUsage, Fs, WriteMode};
use crate::pathutil;
use crate::pipe::{TransferReader, TransferWriter};
use crate::quota::QuotaManager;

/// A writer handed out by [`Namespace::create`] together with the
/// pre-upload state needed to settle quota once the transfer finishes.
pub struct PendingUpload {
    pub writer: TransferWriter,
    /// Size the target had before this upload, None for a new file.
    pub replaced: Option<u64>,
}

struct Route<'a> {
    fs: Arc<dyn Fs>,
    scope: Option<&'a FolderMapping>,
    backend_path: String,
}

/// One user's view of the storage: every request path is resolved to the
/// home backend or to the longest-prefix mounted folder, quota ceilings are
/// checked before writes, and counter deltas land in the scope owning the
/// path.
pub struct Namespace {
    home: Arc<dyn Fs>,
    resolver: FolderResolver,
    folder_fs: HashMap<String, Arc<dyn Fs>>,
    quota: QuotaManager,
}

impl Namespace {
    pub fn new(home: Arc<dyn Fs>, quota: QuotaManager) -> Self {
        Self {
            home,
            resolver: FolderResolver::default(),
            folder_fs: HashMap::new(),
            quota,
        }
    }

    /// Mounts a folder at its mapping's virtual path. The backend serves the
    /// folder's data under the mapping's mapped path; it may be the home
    /// backend itself or a separate one.
    pub fn add_mount(&mut self, mapping: FolderMapping, fs: Arc<dyn Fs>) -> Result<()> {
        mapping.validate()?;
        if self.resolver.is_mount_point(&mapping.virtual_path) {
            return Err(FsError::Config(format!(
                "{} is already a mount point",
                pathutil::clean(&mapping.virtual_path)
            )));
        }
        if self.folder_fs.contains_key(&mapping.folder_name) {
            return Err(FsError::Config(format!(
                "folder {} is already mounted",
                mapping.folder_name
            )));
        }
        self.folder_fs.insert(mapping.folder_name.clone(), fs);
        let mut mappings = self.resolver.mappings().to_vec();
        mappings.push(mapping);
        self.resolver = FolderResolver::new(mappings);
        Ok(())
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    fn route(&self, path: &str) -> Route<'_> {
        match self.resolver.resolve(path) {
            Some((mapping, inner)) => {
                let fs = self
                    .folder_fs
                    .get(&mapping.folder_name)
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&self.home));
                Route {
                    fs,
                    scope: Some(mapping),
                    backend_path: pathutil::join(&[&mapping.mapped_path, &inner]),
                }
            }
            None => Route {
                fs: Arc::clone(&self.home),
                scope: None,
                backend_path: pathutil::clean(path),
            },
        }
    }

    fn check_not_mount_point(&self, path: &str) -> Result<()> {
        let cleaned = pathutil::clean(path);
        if cleaned == "/" {
            return Err(FsError::PermissionDenied(
                "the namespace root cannot be modified".into(),
            ));
        }
        if self.resolver.is_mount_point(&cleaned) {
            return Err(FsError::PermissionDenied(format!(
                "{cleaned} is a virtual folder mount point"
            )));
        }
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo> {
        let route = self.route(path);
        route.fs.stat(&route.backend_path).await
    }

    pub async fn lstat(&self, path: &str) -> Result<FileInfo> {
        let route = self.route(path);
        route.fs.lstat(&route.backend_path).await
    }

    pub async fn open(&self, path: &str, offset: u64) -> Result<TransferReader> {
        let route = self.route(path);
        route.fs.open(&route.backend_path, offset).await
    }

    /// Opens a writer after clearing the quota ceilings for the scope.
    ///
    /// With `size_hint` set, an upload that would exceed a ceiling is
    /// rejected here, before any byte reaches the backend; without it only
    /// the file-count ceilings can be enforced up front.
    pub async fn create(
        &self,
        path: &str,
        mode: WriteMode,
        size_hint: Option<u64>,
    ) -> Result<PendingUpload> {
        self.check_not_mount_point(path)?;
        let cleaned = pathutil::clean(path);
        let route = self.route(&cleaned);
        let existing = match route.fs.stat(&route.backend_path).await {
            Ok(info) => Some(info),
            Err(err) if err.is_not_exist() => None,
            Err(err) => return Err(err),
        };
        if existing.as_ref().is_some_and(|info| info.is_dir()) {
            return Err(FsError::PermissionDenied(format!(
                "{cleaned} is a directory"
            )));
        }
        let incoming_files = if existing.is_some() { 0 } else { 1 };
        self.quota
            .check_write(&cleaned, route.scope, size_hint.unwrap_or(0), incoming_files)
            .await?;
        let writer = route.fs.create(&route.backend_path, mode).await?;
        Ok(PendingUpload {
            writer,
            replaced: existing.map(|info| info.size()),
        })
    }

    /// Settles quota for a finished upload of `written` bytes.
    pub async fn upload_completed(
        &self,
        path: &str,
        mode: WriteMode,
        written: u64,
        replaced: Option<u64>,
    ) -> Result<()> {
        let route = self.route(path);
        let (delta_size, delta_files) = match (mode, replaced) {
            (WriteMode::Overwrite, Some(old)) => (written as i64 - old as i64, 0),
            (WriteMode::Append, Some(_)) => (written as i64, 0),
            (_, None) => (written as i64, 1),
        };
        self.quota.commit(route.scope, delta_size, delta_files).await
    }

    pub async fn remove(&self, path: &str, is_dir: bool) -> Result<()> {
        self.check_not_mount_point(path)?;
        let route = self.route(path);
        if is_dir {
            return route.fs.remove(&route.backend_path, true).await;
        }
        let info = route.fs.stat(&route.backend_path).await?;
        route.fs.remove(&route.backend_path, false).await?;
        self.quota
            .commit(route.scope, -(info.size() as i64), -1)
            .await
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let route = self.route(path);
        route.fs.mkdir(&route.backend_path).await
    }

    /// Renames within one backend. Crossing quota scopes is allowed for
    /// regular files and moves their accounting; directories cannot change
    /// scope, and nothing can move between different backends.
    pub async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let src = pathutil::clean(source);
        let dst = pathutil::clean(target);
        if src == dst {
            return Ok(());
        }
        self.check_not_mount_point(&src)?;
        self.check_not_mount_point(&dst)?;
        let src_route = self.route(&src);
        let dst_route = self.route(&dst);
        if !Arc::ptr_eq(&src_route.fs, &dst_route.fs) {
            return Err(FsError::Unsupported(format!(
                "renaming {src} to {dst} would cross storage backends"
            )));
        }
        let src_scope = src_route.scope.map(|m| m.folder_name.as_str());
        let dst_scope = dst_route.scope.map(|m| m.folder_name.as_str());
        if src_scope == dst_scope {
            return src_route
                .fs
                .rename(&src_route.backend_path, &dst_route.backend_path)
                .await;
        }

        let info = src_route.fs.stat(&src_route.backend_path).await?;
        if info.is_dir() {
            return Err(FsError::Unsupported(format!(
                "renaming directory {src} across virtual folders is not supported"
            )));
        }
        src_route
            .fs
            .rename(&src_route.backend_path, &dst_route.backend_path)
            .await?;
        let size = info.size() as i64;
        self.quota.commit(src_route.scope, -size, -1).await?;
        self.quota.commit(dst_route.scope, size, 1).await
    }

    /// Lists a directory, with mount points living directly under it shown
    /// as directories. A mount point shadows a backend entry of the same
    /// name.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let cleaned = pathutil::clean(path);
        let route = self.route(&cleaned);
        let mut entries = route.fs.read_dir(&route.backend_path).await?;
        let mut index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, info)| (info.name().to_string(), i))
            .collect();
        for mapping in self.resolver.mappings() {
            if pathutil::dir(&mapping.virtual_path) != cleaned {
                continue;
            }
            let base = pathutil::base(&mapping.virtual_path).to_string();
            let info = FileInfo::dir(&base);
            match index.get(&base) {
                Some(&i) => entries[i] = info,
                None => {
                    index.insert(base, entries.len());
                    entries.push(info);
                }
            }
        }
        Ok(entries)
    }

    pub async fn symlink(&self, source: &str, target: &str) -> Result<()> {
        self.check_not_mount_point(target)?;
        let src_route = self.route(source);
        let dst_route = self.route(target);
        let src_scope = src_route.scope.map(|m| m.folder_name.as_str());
        let dst_scope = dst_route.scope.map(|m| m.folder_name.as_str());
        if !Arc::ptr_eq(&src_route.fs, &dst_route.fs) || src_scope != dst_scope {
            return Err(FsError::Unsupported(format!(
                "symlinking {source} to {target} would cross storage scopes"
            )));
        }
        src_route
            .fs
            .symlink(&src_route.backend_path, &dst_route.backend_path)
            .await
    }

    pub async fn readlink(&self, path: &str) -> Result<String> {
        let route = self.route(path);
        route.fs.readlink(&route.backend_path).await
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let route = self.route(path);
        route.fs.chown(&route.backend_path, uid, gid).await
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let route = self.route(path);
        route.fs.chmod(&route.backend_path, mode).await
    }

    pub async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let route = self.route(path);
        route.fs.chtimes(&route.backend_path, atime, mtime).await
    }

    /// Rescans a mounted folder and overwrites its counters. Backends that
    /// cannot size a directory propagate unsupported rather than writing a
    /// wrong zero.
    pub async fn recompute_folder_quota(&self, folder_name: &str) -> Result<DirUsage> {
        let mapping = self
            .resolver
            .mappings()
            .iter()
            .find(|mapping| mapping.folder_name == folder_name)
            .ok_or_else(|| FsError::Config(format!("folder {folder_name} is not mounted")))?;
        let fs = self
            .folder_fs
            .get(folder_name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.home));
        let usage = fs.dir_size(&mapping.mapped_path).await?;
        self.quota.reset_folder(folder_name, &usage).await?;
        Ok(usage)
    }

    /// Rescans the home backend, skipping subtrees claimed by mounts that
    /// live on it, and overwrites the user's counters.
    pub async fn recompute_user_quota(&self) -> Result<DirUsage> {
        let excluded: Vec<String> = self
            .resolver
            .mappings()
            .iter()
            .filter(|mapping| {
                self.folder_fs
                    .get(&mapping.folder_name)
                    .is_some_and(|fs| Arc::ptr_eq(fs, &self.home))
            })
            .map(|mapping| pathutil::clean(&mapping.mapped_path))
            .collect();

        let usage = if excluded.is_empty() {
            self.home.scan_root_contents().await?
        } else {
            let mut usage = DirUsage::default();
            let mut count = |path: &str, info: &FileInfo, err: Option<&FsError>| -> Result<()> {
                if err.is_none()
                    && info.is_file()
                    && !excluded.iter().any(|root| folder::is_under(path, root))
                {
                    usage.add_file(info.size());
                }
                Ok(())
            };
            self.home.walk("/", &mut count).await?;
            usage
        };
        self.quota.reset_user(&usage).await?;
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFs;
    use crate::quota::{DataProvider, MemoryProvider, QuotaLimits};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn mapping(name: &str, virtual_path: &str, mapped_path: &str, quota_size: i64) -> FolderMapping {
        FolderMapping {
            folder_name: name.to_string(),
            virtual_path: virtual_path.to_string(),
            mapped_path: mapped_path.to_string(),
            quota_size,
            quota_files: 0,
        }
    }

    /// Home and one folder ("data" at /data, stored under /folders/data)
    /// sharing a single local backend.
    fn shared_backend_ns(
        quota_size: i64,
        limits: QuotaLimits,
    ) -> (tempfile::TempDir, Arc<MemoryProvider>, Arc<LocalFs>, Namespace) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("folders/data")).unwrap();
        let backend = Arc::new(LocalFs::new(dir.path()).unwrap());
        let provider = Arc::new(MemoryProvider::new());
        let quota = QuotaManager::new(provider.clone(), "alice", limits);
        let mut ns = Namespace::new(backend.clone(), quota);
        ns.add_mount(
            mapping("data", "/data", "/folders/data", quota_size),
            backend.clone(),
        )
        .unwrap();
        (dir, provider, backend, ns)
    }

    async fn upload(ns: &Namespace, path: &str, data: &[u8]) {
        let pending = ns
            .create(path, WriteMode::Overwrite, Some(data.len() as u64))
            .await
            .unwrap();
        let mut writer = pending.writer;
        writer.write_all(data).await.unwrap();
        let written = writer.finish().await.unwrap();
        ns.upload_completed(path, WriteMode::Overwrite, written, pending.replaced)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_routing_between_home_and_mounts() {
        let (_dir, _provider, backend, ns) = shared_backend_ns(0, QuotaLimits::default());

        upload(&ns, "/home.txt", b"home").await;
        upload(&ns, "/data/inside.txt", b"folder").await;

        // The folder file lives under the mapped path on the backend.
        assert_eq!(
            backend.stat("/folders/data/inside.txt").await.unwrap().size(),
            6
        );
        assert_eq!(ns.stat("/data/inside.txt").await.unwrap().size(), 6);
        assert_eq!(ns.stat("/home.txt").await.unwrap().size(), 4);

        let mut reader = ns.open("/data/inside.txt", 0).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "folder");
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected_without_partial_write() {
        let (_dir, provider, backend, ns) = shared_backend_ns(1000, QuotaLimits::default());
        provider.update_folder_quota("data", 900, 9, false).await.unwrap();

        let err = ns
            .create("/data/big.bin", WriteMode::Overwrite, Some(200))
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());

        // Nothing was written and the counters are untouched.
        assert!(backend
            .stat("/folders/data/big.bin")
            .await
            .unwrap_err()
            .is_not_exist());
        let usage = provider.folder_usage("data").await.unwrap();
        assert_eq!(usage.size, 900);
        assert_eq!(usage.files, 9);

        assert!(ns
            .create("/data/fits.bin", WriteMode::Overwrite, Some(100))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_upload_and_remove_settle_quota() {
        let (_dir, provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());

        upload(&ns, "/data/f.bin", &[0u8; 100]).await;
        let usage = provider.folder_usage("data").await.unwrap();
        assert_eq!(usage.size, 100);
        assert_eq!(usage.files, 1);

        // Overwriting with a smaller file adjusts size only.
        upload(&ns, "/data/f.bin", &[0u8; 40]).await;
        let usage = provider.folder_usage("data").await.unwrap();
        assert_eq!(usage.size, 40);
        assert_eq!(usage.files, 1);

        ns.remove("/data/f.bin", false).await.unwrap();
        let usage = provider.folder_usage("data").await.unwrap();
        assert_eq!(usage.size, 0);
        assert_eq!(usage.files, 0);
    }

    #[tokio::test]
    async fn test_append_counts_added_bytes() {
        let (_dir, provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        upload(&ns, "/data/log", b"12345").await;

        let pending = ns
            .create("/data/log", WriteMode::Append, Some(3))
            .await
            .unwrap();
        let mut writer = pending.writer;
        writer.write_all(b"678").await.unwrap();
        let written = writer.finish().await.unwrap();
        ns.upload_completed("/data/log", WriteMode::Append, written, pending.replaced)
            .await
            .unwrap();

        let usage = provider.folder_usage("data").await.unwrap();
        assert_eq!(usage.size, 8);
        assert_eq!(usage.files, 1);
    }

    #[tokio::test]
    async fn test_mount_points_are_protected() {
        let (_dir, _provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());

        assert!(ns.remove("/data", true).await.unwrap_err().is_permission());
        assert!(ns
            .rename("/data", "/elsewhere")
            .await
            .unwrap_err()
            .is_permission());
        assert!(ns
            .rename("/home.txt", "/data")
            .await
            .unwrap_err()
            .is_permission());
        assert!(ns
            .create("/data", WriteMode::Overwrite, None)
            .await
            .unwrap_err()
            .is_permission());
        assert!(ns.remove("/", true).await.unwrap_err().is_permission());
    }

    #[tokio::test]
    async fn test_rename_across_backends_unsupported() {
        let (_dir, _provider, _backend, mut ns) = shared_backend_ns(0, QuotaLimits::default());
        let other_dir = tempfile::tempdir().unwrap();
        let other = Arc::new(LocalFs::new(other_dir.path()).unwrap());
        ns.add_mount(mapping("remote", "/remote", "/", 0), other)
            .unwrap();

        upload(&ns, "/data/f", b"x").await;
        let err = ns.rename("/data/f", "/remote/f").await.unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_cross_mapping_file_rename_moves_quota() {
        let (_dir, provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        upload(&ns, "/data/f.bin", &[0u8; 64]).await;

        ns.rename("/data/f.bin", "/kept.bin").await.unwrap();

        let folder = provider.folder_usage("data").await.unwrap();
        assert_eq!(folder.size, 0);
        assert_eq!(folder.files, 0);
        let user = provider.user_usage("alice").await.unwrap();
        assert_eq!(user.size, 64);
        assert_eq!(user.files, 1);
        assert_eq!(ns.stat("/kept.bin").await.unwrap().size(), 64);
    }

    #[tokio::test]
    async fn test_cross_mapping_directory_rename_rejected() {
        let (_dir, _provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        ns.mkdir("/data/sub").await.unwrap();
        let err = ns.rename("/data/sub", "/sub").await.unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_same_path_rename_is_noop() {
        let (_dir, _provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        // Succeeds even for a path that does not exist: no backend call.
        ns.rename("/ghost", "/ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_dir_shows_mount_points() {
        let (_dir, _provider, backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        upload(&ns, "/home.txt", b"x").await;

        let entries = ns.read_dir("/").await.unwrap();
        let data = entries.iter().find(|info| info.name() == "data").unwrap();
        assert!(data.is_dir());
        assert!(entries.iter().any(|info| info.name() == "home.txt"));

        // A backend file colliding with a mount point is shadowed by it.
        let mut writer = backend.create("/data", WriteMode::Overwrite).await.unwrap();
        writer.write_all(b"not a dir").await.unwrap();
        writer.finish().await.unwrap();
        let entries = ns.read_dir("/").await.unwrap();
        let data = entries.iter().find(|info| info.name() == "data").unwrap();
        assert!(data.is_dir());
        assert_eq!(entries.iter().filter(|info| info.name() == "data").count(), 1);
    }

    #[tokio::test]
    async fn test_recompute_folder_quota() {
        let (_dir, provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        upload(&ns, "/data/a", &[0u8; 10]).await;
        upload(&ns, "/data/b", &[0u8; 30]).await;
        // Drift the counters, then rescan.
        provider.update_folder_quota("data", 9999, 99, true).await.unwrap();

        let usage = ns.recompute_folder_quota("data").await.unwrap();
        assert_eq!(usage.size, 40);
        assert_eq!(usage.files, 2);
        let stored = provider.folder_usage("data").await.unwrap();
        assert_eq!(stored.size, 40);
        assert_eq!(stored.files, 2);

        assert!(ns.recompute_folder_quota("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_recompute_user_quota_excludes_mounted_subtrees() {
        let (_dir, provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        upload(&ns, "/home.txt", &[0u8; 5]).await;
        upload(&ns, "/data/in-folder", &[0u8; 100]).await;

        let usage = ns.recompute_user_quota().await.unwrap();
        assert_eq!(usage.size, 5);
        assert_eq!(usage.files, 1);
        let stored = provider.user_usage("alice").await.unwrap();
        assert_eq!(stored.size, 5);
        assert_eq!(stored.files, 1);
    }

    #[tokio::test]
    async fn test_create_over_directory_denied() {
        let (_dir, _provider, _backend, ns) = shared_backend_ns(0, QuotaLimits::default());
        ns.mkdir("/docs").await.unwrap();
        let err = ns
            .create("/docs", WriteMode::Overwrite, None)
            .await
            .unwrap_err();
        assert!(err.is_permission());
    }

    #[tokio::test]
    async fn test_duplicate_mounts_rejected() {
        let (_dir, _provider, backend, mut ns) = shared_backend_ns(0, QuotaLimits::default());
        let err = ns
            .add_mount(mapping("data2", "/data", "/folders/data2", 0), backend.clone())
            .unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
        let err = ns
            .add_mount(mapping("data", "/data-two", "/folders/data", 0), backend)
            .unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }
}
