//! # ferryfs
//!
//! Virtual filesystem layer for the Ferry file-transfer server: one async
//! contract over local disk, object storage, remote SFTP servers, and an
//! encryption overlay.
//!
//! ## Features
//!
//! - **One `Fs` contract**: `stat`, streaming `open`/`create`, `rename`,
//!   `remove`, `mkdir`, one-level listing, recursive `walk`, and usage scans,
//!   with per-backend capability flags (upload resume, atomic uploads).
//! - **Backends**:
//!   - Local disk: atomic uploads via temp file + rename, native resume.
//!   - Object stores: S3 over the AWS SDK plus pluggable transports (GCS
//!     config, in-memory client), directories emulated from key prefixes,
//!     explicit per-request deadlines.
//!   - SFTP: proxies to another server over russh, with host-key
//!     fingerprint pinning.
//!   - Crypt: wraps any backend with streaming AES-256-CTR, reporting
//!     plaintext sizes.
//! - **Streaming transfers**: each download/upload runs as a cancellable
//!   background task bridged to the caller through a bounded pipe; dropping
//!   an unfinished writer rolls the upload back instead of committing it.
//! - **Virtual folders & quota**: longest-prefix folder mounts in a per-user
//!   namespace, folder- and user-level ceilings checked before a byte is
//!   written, atomic counter deltas against a pluggable data provider.
//!
//! Every path handed to a backend is an absolute virtual path (`/` rooted);
//! the backend maps it to its native form (disk path, object key, remote
//! path) and back.
//!
//! ## Example: Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferryfs::{Fs, LocalFs, WriteMode};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> ferryfs::Result<()> {
//! let fs: Arc<dyn Fs> = Arc::new(LocalFs::new("/srv/files")?);
//!
//! fs.mkdir("/reports").await?;
//! let mut upload = fs.create("/reports/q3.csv", WriteMode::Overwrite).await?;
//! upload.write_all(b"id,total\n").await?;
//! upload.finish().await?;
//!
//! for entry in fs.read_dir("/reports").await? {
//!     println!("{} ({} bytes)", entry.name(), entry.size());
//! }
//!
//! let mut download = fs.open("/reports/q3.csv", 0).await?;
//! let mut contents = String::new();
//! download.read_to_string(&mut contents).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Example: Mounted Folders with Quota
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferryfs::{
//!     FolderMapping, LocalFs, MemoryProvider, Namespace, QuotaLimits, QuotaManager, WriteMode,
//! };
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> ferryfs::Result<()> {
//! let backend = Arc::new(LocalFs::new("/srv/files")?);
//! let provider = Arc::new(MemoryProvider::new());
//! let quota = QuotaManager::new(provider, "alice", QuotaLimits::default());
//!
//! let mut ns = Namespace::new(backend.clone(), quota);
//! ns.add_mount(
//!     FolderMapping {
//!         folder_name: "shared".into(),
//!         virtual_path: "/shared".into(),
//!         mapped_path: "/folders/shared".into(),
//!         quota_size: 1 << 30,
//!         quota_files: 0,
//!     },
//!     backend,
//! )?;
//!
//! let pending = ns.create("/shared/notes.txt", WriteMode::Overwrite, Some(6)).await?;
//! let mut writer = pending.writer;
//! writer.write_all(b"hello\n").await?;
//! let written = writer.finish().await?;
//! ns.upload_completed("/shared/notes.txt", WriteMode::Overwrite, written, pending.replaced)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod crypt;
pub mod error;
pub mod fileinfo;
pub mod folder;
pub mod fs;
pub mod local;
pub mod namespace;
pub mod object;
mod pathutil;
pub mod pipe;
pub mod quota;
pub mod sftp;

// Re-export commonly used types
pub use crypt::{CryptFs, CryptFsConfig};
pub use error::{FsError, Result};
pub use fileinfo::FileInfo;
pub use folder::{FolderMapping, FolderResolver, VirtualFolder};
pub use fs::{DirUsage, Fs, WalkFn, WriteMode};
pub use local::LocalFs;
pub use namespace::{Namespace, PendingUpload};
pub use object::{GcsFsConfig, InMemoryObjectClient, ObjectClient, ObjectFs, S3FsConfig};
pub use pipe::{TransferReader, TransferWriter};
pub use quota::{DataProvider, MemoryProvider, QuotaLimits, QuotaManager, QuotaUsage};
pub use sftp::{SftpFs, SftpFsConfig};
