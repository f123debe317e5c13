//! Remote SFTP backend over russh.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, SeekFrom};

use crate::error::{FsError, Result};
use crate::fileinfo::FileInfo;
use crate::fs::{DirUsage, Fs, WalkFn, WriteMode};
use crate::pathutil;
use crate::pipe::{TransferReader, TransferWriter};

fn default_port() -> u16 {
    22
}

/// SFTP backend configuration.
///
/// Authentication tries the private key first, then the password. With
/// `fingerprints` set, the server host key must match one of the pinned
/// SHA-256 fingerprints; an empty list accepts any host key (logged).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpFsConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub key_passphrase: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<String>,
    /// Remote directory the backend is rooted at.
    #[serde(default)]
    pub prefix: String,
}

impl SftpFsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(FsError::Config("sftp: host cannot be empty".into()));
        }
        if self.username.is_empty() {
            return Err(FsError::Config("sftp: username cannot be empty".into()));
        }
        if self.password.is_none() && self.private_key_path.is_none() {
            return Err(FsError::Config(
                "sftp: a password or a private key is required".into(),
            ));
        }
        if self.key_passphrase.is_some() && self.private_key_path.is_none() {
            return Err(FsError::Config(
                "sftp: key_passphrase set without private_key_path".into(),
            ));
        }
        Ok(())
    }
}

/// Host key check against the pinned fingerprints.
struct HostKeyVerifier {
    fingerprints: Vec<String>,
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_key.fingerprint(HashAlg::Sha256).to_string();
        if self.fingerprints.is_empty() {
            log::warn!("accepting unverified sftp host key {fingerprint}");
            return Ok(true);
        }
        if self.fingerprints.iter().any(|want| *want == fingerprint) {
            Ok(true)
        } else {
            log::warn!("sftp host key {fingerprint} matches no pinned fingerprint");
            Ok(false)
        }
    }
}

/// Storage backend proxying to a remote SFTP server.
///
/// Files are read and written directly over the protocol session: uploads
/// land on the final path (no atomic rename), downloads and resumed uploads
/// use native seeks.
pub struct SftpFs {
    session: SftpSession,
    _handle: Handle<HostKeyVerifier>,
    label: String,
    prefix: String,
}

impl SftpFs {
    /// Connect and open the SFTP subsystem.
    pub async fn connect(config: SftpFsConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = format!("{}:{}", config.host, config.port);
        let verifier = HostKeyVerifier {
            fingerprints: config.fingerprints.clone(),
        };
        let mut handle = client::connect(
            Arc::new(client::Config::default()),
            (config.host.as_str(), config.port),
            verifier,
        )
        .await
        .map_err(|err| FsError::backend(format!("ssh connect to {endpoint}: {err}")))?;

        let mut authenticated = false;
        if let Some(key_path) = &config.private_key_path {
            let key = russh::keys::load_secret_key(key_path, config.key_passphrase.as_deref())
                .map_err(|err| {
                    FsError::Config(format!("sftp: cannot load private key {key_path:?}: {err}"))
                })?;
            let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
            let auth = handle
                .authenticate_publickey(
                    &config.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|err| FsError::backend(format!("ssh auth: {err}")))?;
            authenticated = auth.success();
        }
        if !authenticated {
            if let Some(password) = &config.password {
                let auth = handle
                    .authenticate_password(&config.username, password)
                    .await
                    .map_err(|err| FsError::backend(format!("ssh auth: {err}")))?;
                authenticated = auth.success();
            }
        }
        if !authenticated {
            return Err(FsError::PermissionDenied(format!(
                "sftp authentication failed for {}@{endpoint}",
                config.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|err| FsError::backend(format!("ssh channel open: {err}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| FsError::backend(format!("sftp subsystem: {err}")))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|err| FsError::backend(format!("sftp session init: {err}")))?;
        log::info!("sftp connected: {}@{endpoint}", config.username);

        Ok(Self {
            session,
            _handle: handle,
            label: format!("SFTPFs {endpoint:?}"),
            prefix: pathutil::clean(&config.prefix),
        })
    }

    fn native(&self, virtual_path: &str) -> String {
        native_path(&self.prefix, virtual_path)
    }
}

fn native_path(prefix: &str, virtual_path: &str) -> String {
    let cleaned = pathutil::clean(virtual_path);
    if prefix == "/" {
        cleaned
    } else if cleaned == "/" {
        prefix.to_string()
    } else {
        format!("{prefix}{cleaned}")
    }
}

fn virtual_path(prefix: &str, native: &str) -> String {
    let cleaned = pathutil::clean(native);
    if prefix == "/" {
        return cleaned;
    }
    if cleaned == prefix {
        return "/".to_string();
    }
    match cleaned.strip_prefix(&format!("{prefix}/")) {
        Some(rest) => format!("/{rest}"),
        None => "/".to_string(),
    }
}

fn info_from_attrs(name: &str, attrs: &FileAttributes) -> FileInfo {
    let modified = SystemTime::UNIX_EPOCH
        + std::time::Duration::from_secs(attrs.mtime.unwrap_or(0) as u64);
    FileInfo::new(name, attrs.is_dir(), attrs.size.unwrap_or(0), modified)
}

fn unix_secs(t: SystemTime) -> u32 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

fn map_sftp_error(path: &str, err: russh_sftp::client::error::Error) -> FsError {
    if let russh_sftp::client::error::Error::Status(status) = &err {
        match status.status_code {
            StatusCode::NoSuchFile => return FsError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => {
                return FsError::PermissionDenied(path.to_string())
            }
            StatusCode::OpUnsupported => {
                return FsError::Unsupported(format!("sftp server refused operation on {path}"))
            }
            _ => {}
        }
    }
    FsError::backend(err)
}

#[async_trait]
impl Fs for SftpFs {
    fn name(&self) -> &str {
        &self.label
    }

    fn resolve(&self, virtual_path: &str) -> String {
        self.native(virtual_path)
    }

    fn relative_path(&self, native: &str) -> String {
        virtual_path(&self.prefix, native)
    }

    fn join(&self, elems: &[&str]) -> String {
        pathutil::join(elems)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let native = self.native(path);
        let attrs = self
            .session
            .metadata(&native)
            .await
            .map_err(|err| map_sftp_error(path, err))?;
        Ok(info_from_attrs(pathutil::base(&pathutil::clean(path)), &attrs))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo> {
        let native = self.native(path);
        let attrs = self
            .session
            .symlink_metadata(&native)
            .await
            .map_err(|err| map_sftp_error(path, err))?;
        Ok(info_from_attrs(pathutil::base(&pathutil::clean(path)), &attrs))
    }

    async fn open(&self, path: &str, offset: u64) -> Result<TransferReader> {
        let native = self.native(path);
        let mut file = self
            .session
            .open_with_flags(&native, OpenFlags::READ)
            .await
            .map_err(|err| map_sftp_error(path, err))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(TransferReader::direct(Box::new(file)))
    }

    async fn create(&self, path: &str, mode: WriteMode) -> Result<TransferWriter> {
        let native = self.native(path);
        let flags = match mode {
            WriteMode::Overwrite => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            WriteMode::Append => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        };
        let file = self
            .session
            .open_with_flags(&native, flags)
            .await
            .map_err(|err| map_sftp_error(path, err))?;
        Ok(TransferWriter::direct(Box::new(file), None, None))
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        if pathutil::clean(source) == pathutil::clean(target) {
            return Ok(());
        }
        log::debug!("{}: rename {source} -> {target}", self.label);
        self.session
            .rename(self.native(source), self.native(target))
            .await
            .map_err(|err| map_sftp_error(source, err))
    }

    async fn remove(&self, path: &str, is_dir: bool) -> Result<()> {
        let native = self.native(path);
        log::debug!("{}: remove {path} (dir: {is_dir})", self.label);
        let res = if is_dir {
            self.session.remove_dir(&native).await
        } else {
            self.session.remove_file(&native).await
        };
        res.map_err(|err| map_sftp_error(path, err))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let native = self.native(path);
        match self.session.create_dir(&native).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Ok(attrs) = self.session.metadata(&native).await {
                    if attrs.is_dir() {
                        return Ok(());
                    }
                }
                Err(map_sftp_error(path, err))
            }
        }
    }

    async fn symlink(&self, source: &str, target: &str) -> Result<()> {
        self.session
            .symlink(self.native(target), self.native(source))
            .await
            .map_err(|err| map_sftp_error(target, err))
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        self.session
            .read_link(self.native(path))
            .await
            .map_err(|err| map_sftp_error(path, err))
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let attrs = FileAttributes {
            uid: Some(uid),
            gid: Some(gid),
            ..Default::default()
        };
        self.session
            .set_metadata(self.native(path), attrs)
            .await
            .map_err(|err| map_sftp_error(path, err))
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        self.session
            .set_metadata(self.native(path), attrs)
            .await
            .map_err(|err| map_sftp_error(path, err))
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let attrs = FileAttributes {
            atime: Some(unix_secs(atime)),
            mtime: Some(unix_secs(mtime)),
            ..Default::default()
        };
        self.session
            .set_metadata(self.native(path), attrs)
            .await
            .map_err(|err| map_sftp_error(path, err))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let native = self.native(path);
        let entries = self
            .session
            .read_dir(&native)
            .await
            .map_err(|err| map_sftp_error(path, err))?;
        let mut infos = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let attrs = entry.metadata();
            infos.push(info_from_attrs(&name, &attrs));
        }
        Ok(infos)
    }

    async fn walk(&self, root: &str, walk_fn: &mut WalkFn) -> Result<()> {
        let root_clean = pathutil::clean(root);
        let mut terminal: Option<FsError> = None;
        let mut stack = vec![root_clean.clone()];
        'scan: while let Some(dir_path) = stack.pop() {
            let native = self.native(&dir_path);
            let entries = match self.session.read_dir(&native).await {
                Ok(entries) => entries,
                Err(err) => {
                    terminal = Some(map_sftp_error(&dir_path, err));
                    break;
                }
            };
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let child = pathutil::join(&[&dir_path, &name]);
                let info = info_from_attrs(&name, &entry.metadata());
                let is_dir = info.is_dir();
                if let Err(err) = walk_fn(&child, &info, None) {
                    terminal = Some(err);
                    break 'scan;
                }
                if is_dir {
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
        Err(FsError::Unsupported(format!(
            "dir size {path} is not supported on {}",
            self.label
        )))
    }

    async fn scan_root_contents(&self) -> Result<DirUsage> {
        let mut usage = DirUsage::default();
        let mut count = |_: &str, info: &FileInfo, err: Option<&FsError>| -> Result<()> {
            if err.is_none() && info.is_file() {
                usage.add_file(info.size());
            }
            Ok(())
        };
        self.walk("/", &mut count).await?;
        Ok(usage)
    }

    fn is_upload_resume_supported(&self) -> bool {
        true
    }

    fn is_atomic_upload_supported(&self) -> bool {
        false
    }

    fn has_virtual_folders(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SftpFsConfig {
        SftpFsConfig {
            host: "files.example.net".to_string(),
            port: 22,
            username: "deploy".to_string(),
            password: Some("secret".to_string()),
            private_key_path: None,
            key_passphrase: None,
            fingerprints: Vec::new(),
            prefix: String::new(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(valid().validate().is_ok());

        let mut cfg = valid();
        cfg.host.clear();
        assert!(matches!(cfg.validate(), Err(FsError::Config(_))));

        let mut cfg = valid();
        cfg.username.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.password = None;
        assert!(cfg.validate().is_err());
        cfg.private_key_path = Some("/home/deploy/.ssh/id_ed25519".to_string());
        assert!(cfg.validate().is_ok());

        let mut cfg = valid();
        cfg.key_passphrase = Some("pp".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let cfg: SftpFsConfig =
            serde_json::from_str(r#"{"host":"h","username":"u","password":"p"}"#).unwrap();
        assert_eq!(cfg.port, 22);
        assert!(cfg.fingerprints.is_empty());
        assert!(cfg.prefix.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_path_mapping_round_trip() {
        for prefix in ["/", "/srv/files"] {
            let prefix = pathutil::clean(prefix);
            for path in ["/", "/a", "/a/b.txt", "/a/../c"] {
                let native = native_path(&prefix, path);
                assert_eq!(virtual_path(&prefix, &native), pathutil::clean(path));
            }
        }
        assert_eq!(virtual_path("/srv/files", "/etc/passwd"), "/");
        assert_eq!(virtual_path("/srv/files", "/srv/filesystem"), "/");
    }

    #[test]
    fn test_info_from_attrs() {
        let file = FileAttributes {
            size: Some(42),
            mtime: Some(1_600_000_000),
            permissions: Some(0o100644),
            ..Default::default()
        };
        let info = info_from_attrs("doc.txt", &file);
        assert!(info.is_file());
        assert_eq!(info.size(), 42);

        let dir = FileAttributes {
            permissions: Some(0o040755),
            ..Default::default()
        };
        assert!(info_from_attrs("d", &dir).is_dir());
    }

    #[test]
    fn test_status_code_mapping() {
        use russh_sftp::protocol::Status;

        let not_found = russh_sftp::client::error::Error::Status(Status {
            id: 1,
            status_code: StatusCode::NoSuchFile,
            error_message: "no such file".to_string(),
            language_tag: "en".to_string(),
        });
        assert!(map_sftp_error("/x", not_found).is_not_exist());

        let denied = russh_sftp::client::error::Error::Status(Status {
            id: 2,
            status_code: StatusCode::PermissionDenied,
            error_message: "denied".to_string(),
            language_tag: "en".to_string(),
        });
        assert!(map_sftp_error("/x", denied).is_permission());
    }
}
