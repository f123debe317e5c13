//! Object-store backends with an emulated directory hierarchy.
//!
//! Buckets hold a flat keyspace; directories exist as zero-byte marker keys
//! ending in `/` and as listing prefixes grouped by the delimiter. The core
//! semantics live in [`ObjectFs`], generic over an [`ObjectClient`] transport
//! so S3, an injected GCS transport and the in-memory client all behave
//! identically.

mod gcs;
mod memory;
mod s3;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{FsError, Result};
use crate::fileinfo::FileInfo;
use crate::fs::{DirUsage, Fs, WalkFn, WriteMode};
use crate::pathutil;
use crate::pipe::{piped_download, piped_upload, TransferReader, TransferWriter, PIPE_CAPACITY};

pub use gcs::GcsFsConfig;
pub use memory::InMemoryObjectClient;
pub use s3::S3FsConfig;

/// Content type marking directory keys.
pub const DIR_CONTENT_TYPE: &str = "application/x-directory";

/// Default deadline for metadata and single-object calls.
pub const DEFAULT_OP_DEADLINE: Duration = Duration::from_secs(30);

/// Default deadline for server-side copies and whole-root scans.
pub const DEFAULT_COPY_DEADLINE: Duration = Duration::from_secs(300);

/// Attributes of a single stored object.
#[derive(Debug, Clone)]
pub struct ObjectAttrs {
    pub size: u64,
    pub modified: SystemTime,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// One object row of a listing page.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub modified: SystemTime,
    pub content_type: Option<String>,
    /// Tombstone row of a soft-deleting store; filtered out of results.
    pub deleted: bool,
}

/// One page of a (possibly delimited) listing.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// Streamed object content.
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

/// Transport contract between [`ObjectFs`] and a concrete store.
///
/// Implementations translate provider failures into the error taxonomy
/// (missing keys to not-found, denied requests to permission-denied) and
/// keep everything else verbatim as a backend error.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Verify the bucket is reachable.
    async fn check_bucket(&self) -> Result<()>;

    /// Attributes of the object at `key`.
    async fn head(&self, key: &str) -> Result<ObjectAttrs>;

    /// Stream the object content starting at `offset`.
    async fn get(&self, key: &str, offset: u64) -> Result<ObjectBody>;

    /// Store `body` at `key`, replacing any previous object. Returns the
    /// byte count. The write must be all-or-nothing.
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    /// Server-side copy.
    async fn copy(&self, source_key: &str, target_key: &str) -> Result<()>;

    /// Delete `key`; deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// One listing page under `prefix`, grouped by `delimiter` when given.
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<String>,
        max_keys: Option<usize>,
    ) -> Result<ListPage>;
}

/// Storage backend over a flat object keyspace.
pub struct ObjectFs {
    client: Arc<dyn ObjectClient>,
    label: String,
    /// Either empty or `"some/prefix/"` (no leading `/`, trailing `/`).
    key_prefix: String,
    op_deadline: Duration,
    copy_deadline: Duration,
}

impl ObjectFs {
    /// Build over an explicit transport. `key_prefix` confines the backend
    /// to a sub-tree of the bucket; deadlines bound metadata calls and
    /// copies/scans respectively.
    pub fn new(
        label: impl Into<String>,
        client: Arc<dyn ObjectClient>,
        key_prefix: &str,
        op_deadline: Duration,
        copy_deadline: Duration,
    ) -> Self {
        let mut key_prefix = key_prefix.trim_start_matches('/').to_string();
        if !key_prefix.is_empty() && !key_prefix.ends_with('/') {
            key_prefix.push('/');
        }
        Self {
            client,
            label: label.into(),
            key_prefix,
            op_deadline,
            copy_deadline,
        }
    }

    /// Backend over a fresh [`InMemoryObjectClient`], default deadlines.
    pub fn in_memory(bucket: &str) -> Self {
        Self::new(
            format!("InMemoryFs bucket {bucket:?}"),
            Arc::new(InMemoryObjectClient::new(bucket)),
            "",
            DEFAULT_OP_DEADLINE,
            DEFAULT_COPY_DEADLINE,
        )
    }

    fn key_for(&self, virtual_path: &str) -> String {
        let cleaned = pathutil::clean(virtual_path);
        if cleaned == "/" {
            self.key_prefix.clone()
        } else {
            format!("{}{}", self.key_prefix, &cleaned[1..])
        }
    }

    /// Key with the trailing delimiter, as directory keys are stored.
    fn dir_key(&self, virtual_path: &str) -> String {
        let key = self.key_for(virtual_path);
        if key.is_empty() || key.ends_with('/') {
            key
        } else {
            format!("{key}/")
        }
    }

    async fn with_deadline<T>(
        &self,
        what: &str,
        deadline: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(FsError::backend(format!(
                "{}: {what} timed out after {}s",
                self.label,
                deadline.as_secs()
            ))),
        }
    }

    /// Whether any live object exists below `virtual_path` (its own marker
    /// does not count).
    async fn has_contents(&self, virtual_path: &str) -> Result<bool> {
        let prefix = self.dir_key(virtual_path);
        let mut token: Option<String> = None;
        loop {
            let page = self
                .with_deadline(
                    "list",
                    self.op_deadline,
                    self.client.list(&prefix, None, token.take(), Some(16)),
                )
                .await?;
            if page.objects.iter().any(|o| !o.deleted && o.key != prefix) {
                return Ok(true);
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(false),
            }
        }
    }
}

fn push_entry(entries: &mut Vec<FileInfo>, index: &mut HashMap<String, usize>, info: FileInfo) {
    match index.get(info.name()) {
        // Directories win de-dup ties against a plain object of the same name.
        Some(&at) => {
            if info.is_dir() && entries[at].is_file() {
                entries[at] = info;
            }
        }
        None => {
            index.insert(info.name().to_string(), entries.len());
            entries.push(info);
        }
    }
}

#[async_trait]
impl Fs for ObjectFs {
    fn name(&self) -> &str {
        &self.label
    }

    fn resolve(&self, virtual_path: &str) -> String {
        self.key_for(virtual_path)
    }

    fn relative_path(&self, native_path: &str) -> String {
        let rel = pathutil::clean(&format!("/{native_path}"));
        if self.key_prefix.is_empty() {
            return rel;
        }
        let mount = format!("/{}", self.key_prefix.trim_end_matches('/'));
        if rel == mount {
            return "/".to_string();
        }
        match rel.strip_prefix(&format!("{mount}/")) {
            Some(stripped) => format!("/{stripped}"),
            None => "/".to_string(),
        }
    }

    fn join(&self, elems: &[&str]) -> String {
        pathutil::join(elems).trim_start_matches('/').to_string()
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let cleaned = pathutil::clean(path);
        if cleaned == "/" {
            // The mount point under a key prefix is emulated outright; the
            // bare bucket root still proves the bucket reachable, and that
            // failure propagates as-is instead of turning into not-found.
            if self.key_prefix.is_empty() {
                self.with_deadline("bucket check", self.op_deadline, self.client.check_bucket())
                    .await?;
            }
            return Ok(FileInfo::dir("/"));
        }
        let name = pathutil::base(&cleaned).to_string();
        if self.has_contents(&cleaned).await? {
            return Ok(FileInfo::dir(name));
        }
        let key = self.key_for(&cleaned);
        match self
            .with_deadline("head", self.op_deadline, self.client.head(&key))
            .await
        {
            Ok(attrs) => {
                if attrs.content_type.as_deref() == Some(DIR_CONTENT_TYPE) {
                    Ok(FileInfo::dir(name))
                } else {
                    Ok(FileInfo::file(name, attrs.size, attrs.modified)
                        .with_content_type(attrs.content_type))
                }
            }
            Err(err) if err.is_not_exist() => {
                let marker = format!("{key}/");
                self.with_deadline("head", self.op_deadline, self.client.head(&marker))
                    .await
                    .map_err(|err| {
                        if err.is_not_exist() {
                            FsError::NotFound(cleaned.clone())
                        } else {
                            err
                        }
                    })?;
                Ok(FileInfo::dir(name))
            }
            Err(err) => Err(err),
        }
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo> {
        // No symlinks in a flat keyspace.
        self.stat(path).await
    }

    async fn open(&self, path: &str, offset: u64) -> Result<TransferReader> {
        let key = self.key_for(path);
        if offset > 0 {
            let attrs = self
                .with_deadline("head", self.op_deadline, self.client.head(&key))
                .await?;
            if attrs.content_encoding.as_deref() == Some("gzip") {
                return Err(FsError::Unsupported(format!(
                    "range request is not supported for gzip content encoding, requested offset {offset}"
                )));
            }
        }
        let client = Arc::clone(&self.client);
        let label = format!("{} download {key:?}", self.label);
        Ok(piped_download(PIPE_CAPACITY, label, move |mut writer| {
            async move {
                let res = async {
                    let mut body = client.get(&key, offset).await.map_err(io::Error::from)?;
                    tokio::io::copy(&mut body, &mut writer).await
                }
                .await;
                (writer, res)
            }
        }))
    }

    async fn create(&self, path: &str, mode: WriteMode) -> Result<TransferWriter> {
        if matches!(mode, WriteMode::Append) {
            return Err(FsError::Unsupported(format!(
                "upload resume is not supported on {}",
                self.label
            )));
        }
        let key = self.key_for(path);
        let client = Arc::clone(&self.client);
        let label = format!("{} upload {key:?}", self.label);
        Ok(piped_upload(PIPE_CAPACITY, label, move |mut reader| {
            async move {
                let res = client
                    .put(&key, None, &mut reader)
                    .await
                    .map_err(io::Error::from);
                (reader, res)
            }
        }))
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let src = pathutil::clean(source);
        let dst = pathutil::clean(target);
        if src == dst {
            return Ok(());
        }
        let info = self.stat(&src).await?;
        let mut src_key = self.key_for(&src);
        let mut dst_key = self.key_for(&dst);
        if info.is_dir() {
            // No native recursive move: only empty directories can be
            // renamed, by copying the marker key.
            if self.has_contents(&src).await? {
                return Err(FsError::DirNotEmpty(src));
            }
            src_key.push('/');
            dst_key.push('/');
        }
        log::debug!("{}: rename {src_key:?} -> {dst_key:?}", self.label);
        self.with_deadline(
            "copy",
            self.copy_deadline,
            self.client.copy(&src_key, &dst_key),
        )
        .await?;
        self.with_deadline("delete", self.op_deadline, self.client.delete(&src_key))
            .await
    }

    async fn remove(&self, path: &str, is_dir: bool) -> Result<()> {
        let cleaned = pathutil::clean(path);
        let mut key = self.key_for(&cleaned);
        if is_dir {
            if self.has_contents(&cleaned).await? {
                return Err(FsError::DirNotEmpty(cleaned));
            }
            key.push('/');
        }
        log::debug!("{}: remove {key:?}", self.label);
        self.with_deadline("delete", self.op_deadline, self.client.delete(&key))
            .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        match self.stat(path).await {
            Ok(info) if info.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("mkdir {path}: file exists"),
                )))
            }
            Err(err) if err.is_not_exist() => {}
            Err(err) => return Err(err),
        }
        let marker = self.dir_key(path);
        let mut empty = tokio::io::empty();
        self.with_deadline(
            "put",
            self.op_deadline,
            self.client.put(&marker, Some(DIR_CONTENT_TYPE), &mut empty),
        )
        .await
        .map(|_| ())
    }

    async fn symlink(&self, source: &str, target: &str) -> Result<()> {
        Err(FsError::Unsupported(format!(
            "symlink {source} -> {target} is not supported on {}",
            self.label
        )))
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        Err(FsError::Unsupported(format!(
            "readlink {path} is not supported on {}",
            self.label
        )))
    }

    async fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        // Object stores have no owner bits; succeed so generic clients don't
        // fail whole transfers over a follow-up attribute call.
        Ok(())
    }

    async fn chmod(&self, _path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }

    async fn chtimes(&self, path: &str, _atime: SystemTime, _mtime: SystemTime) -> Result<()> {
        Err(FsError::Unsupported(format!(
            "chtimes {path} is not supported on {}",
            self.label
        )))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let prefix = self.dir_key(path);
        let mut entries: Vec<FileInfo> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .with_deadline(
                    "list",
                    self.op_deadline,
                    self.client.list(&prefix, Some("/"), token.take(), None),
                )
                .await?;
            for common in &page.common_prefixes {
                let name = common
                    .strip_prefix(&prefix)
                    .unwrap_or(common)
                    .trim_end_matches('/');
                if name.is_empty() {
                    continue;
                }
                push_entry(&mut entries, &mut index, FileInfo::dir(name));
            }
            for obj in &page.objects {
                if obj.deleted {
                    continue;
                }
                let Some(rel) = obj.key.strip_prefix(&prefix) else {
                    continue;
                };
                if rel.is_empty() {
                    // The listed directory's own marker.
                    continue;
                }
                if let Some(dir_name) = rel.strip_suffix('/') {
                    if dir_name.is_empty() || dir_name.contains('/') {
                        continue;
                    }
                    push_entry(&mut entries, &mut index, FileInfo::dir(dir_name));
                } else {
                    if rel.contains('/') {
                        continue;
                    }
                    push_entry(
                        &mut entries,
                        &mut index,
                        FileInfo::file(rel, obj.size, obj.modified)
                            .with_content_type(obj.content_type.clone()),
                    );
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn walk(&self, root: &str, walk_fn: &mut WalkFn) -> Result<()> {
        let root_clean = pathutil::clean(root);
        let base_key = self.dir_key(&root_clean);
        let mut terminal: Option<FsError> = None;
        let mut token: Option<String> = None;
        'pages: loop {
            let page = match self
                .with_deadline(
                    "list",
                    self.op_deadline,
                    self.client.list(&base_key, None, token.take(), None),
                )
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    terminal = Some(err);
                    break;
                }
            };
            for obj in &page.objects {
                if obj.deleted || obj.key == base_key {
                    continue;
                }
                let vpath = self.relative_path(&obj.key);
                let name = pathutil::base(&vpath).to_string();
                let info = if obj.key.ends_with('/') {
                    FileInfo::dir(name)
                } else {
                    FileInfo::file(name, obj.size, obj.modified)
                };
                if let Err(err) = walk_fn(&vpath, &info, None) {
                    terminal = Some(err);
                    break 'pages;
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
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
        Err(FsError::Unsupported(format!(
            "dir size {path} is not supported on {}, only whole-root scans",
            self.label
        )))
    }

    async fn scan_root_contents(&self) -> Result<DirUsage> {
        let scan = async {
            let mut usage = DirUsage::default();
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .client
                    .list(&self.key_prefix, None, token.take(), None)
                    .await?;
                for obj in &page.objects {
                    if obj.deleted || obj.key.ends_with('/') {
                        continue;
                    }
                    usage.add_file(obj.size);
                }
                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
            Ok(usage)
        };
        self.with_deadline("root scan", self.copy_deadline, scan)
            .await
    }

    fn is_upload_resume_supported(&self) -> bool {
        false
    }

    fn is_atomic_upload_supported(&self) -> bool {
        true
    }

    fn has_virtual_folders(&self) -> bool {
        false
    }
}
