//! Encryption overlay: streaming AES-256-CTR on top of any backend.
//!
//! On-disk layout per file: a 21-byte header (magic `FCR1`, one format
//! version byte, a random 16-byte nonce) followed by the CTR keystream
//! applied to the plaintext. The per-file key is HMAC-SHA256(master key,
//! nonce); the master key comes from the configured passphrase via
//! PBKDF2-HMAC-SHA256. The keystream is strictly sequential, so reads at a
//! non-zero offset and resumed uploads are rejected up front.

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use aes::Aes256;
use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FsError, Result};
use crate::fileinfo::FileInfo;
use crate::fs::{DirUsage, Fs, WalkFn, WriteMode};
use crate::pipe::{piped_download, piped_upload, TransferReader, TransferWriter, PIPE_CAPACITY};

type Aes256Ctr = Ctr128BE<Aes256>;

const MAGIC: &[u8; 4] = b"FCR1";
const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 16;
/// Bytes prepended to every encrypted file.
pub const HEADER_LEN: usize = 4 + 1 + NONCE_LEN;

const KDF_SALT: &[u8] = b"FCR1 master key";
const KDF_ROUNDS: u32 = 100_000;
const COPY_BUF: usize = 64 * 1024;

/// Encryption overlay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptFsConfig {
    pub passphrase: String,
}

impl CryptFsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.passphrase.is_empty() {
            return Err(FsError::Config("crypt: passphrase cannot be empty".into()));
        }
        Ok(())
    }
}

/// Wraps another backend and encrypts file contents in flight.
///
/// Metadata calls pass through with sizes rewritten to the plaintext length;
/// directory and path operations delegate unchanged.
pub struct CryptFs {
    inner: Arc<dyn Fs>,
    master_key: [u8; 32],
    label: String,
}

impl CryptFs {
    pub fn new(inner: Arc<dyn Fs>, config: CryptFsConfig) -> Result<Self> {
        config.validate()?;
        let mut master_key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            config.passphrase.as_bytes(),
            KDF_SALT,
            KDF_ROUNDS,
            &mut master_key,
        );
        let label = format!("CryptFs over {}", inner.name());
        Ok(Self {
            inner,
            master_key,
            label,
        })
    }
}

fn file_key(master_key: &[u8; 32], nonce: &[u8; NONCE_LEN]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(master_key)
        .map_err(|err| FsError::backend(format!("HMAC init failed: {err}")))?;
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().into())
}

fn encode_header(nonce: &[u8; NONCE_LEN]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4] = FORMAT_VERSION;
    header[5..].copy_from_slice(nonce);
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> io::Result<[u8; NONCE_LEN]> {
    if &header[..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not an encrypted file (bad magic)",
        ));
    }
    if header[4] != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown encryption format version {}", header[4]),
        ));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&header[5..]);
    Ok(nonce)
}

/// Rewrites a ciphertext-sized entry to its plaintext size.
fn plaintext_info(mut info: FileInfo) -> FileInfo {
    if info.is_file() {
        let size = info.size().saturating_sub(HEADER_LEN as u64);
        info.set_size(size);
    }
    info
}

async fn decrypt_stream<W>(
    master_key: [u8; 32],
    mut source: TransferReader,
    writer: &mut W,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    source.read_exact(&mut header).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "encrypted file is shorter than its header",
            )
        } else {
            err
        }
    })?;
    let nonce = decode_header(&header)?;
    let key = file_key(&master_key, &nonce).map_err(io::Error::from)?;
    let mut cipher = Aes256Ctr::new_from_slices(&key, &nonce)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad cipher parameters"))?;

    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

/// Returns the plaintext byte count; the inner writer sees header + keystream.
async fn encrypt_stream<R>(
    key: [u8; 32],
    nonce: [u8; NONCE_LEN],
    source: &mut R,
    mut sink: TransferWriter,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut cipher = match Aes256Ctr::new_from_slices(&key, &nonce) {
        Ok(cipher) => cipher,
        Err(_) => {
            sink.cancel();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad cipher parameters",
            ));
        }
    };
    if let Err(err) = sink.write_all(&encode_header(&nonce)).await {
        sink.cancel();
        return Err(err);
    }
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                sink.cancel();
                return Err(err);
            }
        };
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        if let Err(err) = sink.write_all(&buf[..n]).await {
            sink.cancel();
            return Err(err);
        }
        total += n as u64;
    }
    match sink.finish().await {
        Ok(_) => Ok(total),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Fs for CryptFs {
    fn name(&self) -> &str {
        &self.label
    }

    fn resolve(&self, virtual_path: &str) -> String {
        self.inner.resolve(virtual_path)
    }

    fn relative_path(&self, native: &str) -> String {
        self.inner.relative_path(native)
    }

    fn join(&self, elems: &[&str]) -> String {
        self.inner.join(elems)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        Ok(plaintext_info(self.inner.stat(path).await?))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo> {
        Ok(plaintext_info(self.inner.lstat(path).await?))
    }

    async fn open(&self, path: &str, offset: u64) -> Result<TransferReader> {
        if offset > 0 {
            return Err(FsError::Unsupported(format!(
                "encrypted downloads cannot start at offset {offset}: decryption is sequential"
            )));
        }
        let source = self.inner.open(path, 0).await?;
        let master_key = self.master_key;
        let label = format!("{} decrypt {path:?}", self.label);
        Ok(piped_download(PIPE_CAPACITY, label, move |mut writer| {
            async move {
                let result = decrypt_stream(master_key, source, &mut writer).await;
                (writer, result)
            }
        }))
    }

    async fn create(&self, path: &str, mode: WriteMode) -> Result<TransferWriter> {
        if matches!(mode, WriteMode::Append) {
            return Err(FsError::Unsupported(format!(
                "resuming encrypted upload {path} is not supported: the keystream cannot be re-entered"
            )));
        }
        let sink = self.inner.create(path, WriteMode::Overwrite).await?;
        let nonce: [u8; NONCE_LEN] = rand::random();
        let key = file_key(&self.master_key, &nonce)?;
        let label = format!("{} encrypt {path:?}", self.label);
        Ok(piped_upload(PIPE_CAPACITY, label, move |mut reader| {
            async move {
                let result = encrypt_stream(key, nonce, &mut reader, sink).await;
                (reader, result)
            }
        }))
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        self.inner.rename(source, target).await
    }

    async fn remove(&self, path: &str, is_dir: bool) -> Result<()> {
        self.inner.remove(path, is_dir).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.inner.mkdir(path).await
    }

    async fn symlink(&self, source: &str, target: &str) -> Result<()> {
        self.inner.symlink(source, target).await
    }

    async fn readlink(&self, path: &str) -> Result<String> {
        self.inner.readlink(path).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.inner.chown(path, uid, gid).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.chmod(path, mode).await
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        self.inner.chtimes(path, atime, mtime).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let entries = self.inner.read_dir(path).await?;
        Ok(entries.into_iter().map(plaintext_info).collect())
    }

    async fn walk(&self, root: &str, walk_fn: &mut WalkFn) -> Result<()> {
        let mut adapted = |path: &str, info: &FileInfo, err: Option<&FsError>| -> Result<()> {
            let plain = plaintext_info(info.clone());
            walk_fn(path, &plain, err)
        };
        self.inner.walk(root, &mut adapted).await
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
        false
    }

    fn is_atomic_upload_supported(&self) -> bool {
        self.inner.is_atomic_upload_supported()
    }

    fn has_virtual_folders(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFs;

    fn crypt_over_tempdir(passphrase: &str) -> (tempfile::TempDir, Arc<LocalFs>, CryptFs) {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalFs::new(dir.path()).unwrap());
        let crypt = CryptFs::new(
            local.clone(),
            CryptFsConfig {
                passphrase: passphrase.to_string(),
            },
        )
        .unwrap();
        (dir, local, crypt)
    }

    async fn write_via(fs: &dyn Fs, path: &str, data: &[u8]) -> u64 {
        let mut writer = fs.create(path, WriteMode::Overwrite).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.finish().await.unwrap()
    }

    async fn read_via(fs: &dyn Fs, path: &str) -> Vec<u8> {
        let mut reader = fs.open(path, 0).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        data
    }

    #[test]
    fn test_config_validation() {
        let cfg = CryptFsConfig {
            passphrase: String::new(),
        };
        assert!(matches!(cfg.validate(), Err(FsError::Config(_))));
    }

    #[test]
    fn test_header_round_trip() {
        let nonce = [7u8; NONCE_LEN];
        let header = encode_header(&nonce);
        assert_eq!(decode_header(&header).unwrap(), nonce);

        let mut bad_magic = header;
        bad_magic[0] = b'X';
        assert!(decode_header(&bad_magic).is_err());

        let mut bad_version = header;
        bad_version[4] = 9;
        assert!(decode_header(&bad_version).is_err());
    }

    #[test]
    fn test_file_key_depends_on_nonce() {
        let master = [1u8; 32];
        let a = file_key(&master, &[0u8; NONCE_LEN]).unwrap();
        let b = file_key(&master, &[1u8; NONCE_LEN]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, file_key(&master, &[0u8; NONCE_LEN]).unwrap());
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let (_dir, local, crypt) = crypt_over_tempdir("correct horse");
        let plaintext = b"attack at dawn, retreat at dusk".to_vec();

        let written = write_via(&crypt, "/orders.txt", &plaintext).await;
        assert_eq!(written, plaintext.len() as u64);

        // The wrapped backend holds header + ciphertext, never the plaintext.
        let raw = read_via(local.as_ref(), "/orders.txt").await;
        assert_eq!(raw.len(), plaintext.len() + HEADER_LEN);
        assert_eq!(&raw[..4], MAGIC);
        assert!(!raw
            .windows(plaintext.len())
            .any(|window| window == plaintext.as_slice()));

        assert_eq!(read_via(&crypt, "/orders.txt").await, plaintext);
    }

    #[tokio::test]
    async fn test_stat_reports_plaintext_size() {
        let (_dir, local, crypt) = crypt_over_tempdir("pw");
        write_via(&crypt, "/f.bin", &[0xAB; 100]).await;

        assert_eq!(crypt.stat("/f.bin").await.unwrap().size(), 100);
        assert_eq!(
            local.stat("/f.bin").await.unwrap().size(),
            100 + HEADER_LEN as u64
        );
    }

    #[tokio::test]
    async fn test_empty_file_round_trip() {
        let (_dir, _local, crypt) = crypt_over_tempdir("pw");
        assert_eq!(write_via(&crypt, "/empty", b"").await, 0);
        assert_eq!(crypt.stat("/empty").await.unwrap().size(), 0);
        assert!(read_via(&crypt, "/empty").await.is_empty());
    }

    #[tokio::test]
    async fn test_open_at_offset_rejected() {
        let (_dir, _local, crypt) = crypt_over_tempdir("pw");
        write_via(&crypt, "/f", b"0123456789").await;
        let err = crypt.open("/f", 3).await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains('3'));
    }

    #[tokio::test]
    async fn test_append_rejected() {
        let (_dir, _local, crypt) = crypt_over_tempdir("pw");
        let err = crypt.create("/f", WriteMode::Append).await.unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_truncated_file_fails_to_decrypt() {
        let (_dir, local, crypt) = crypt_over_tempdir("pw");
        // Shorter than the header: opening succeeds, reading reports the fault.
        let mut writer = local.create("/stub", WriteMode::Overwrite).await.unwrap();
        writer.write_all(b"FCR1").await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = crypt.open("/stub", 0).await.unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_read_dir_and_dir_size_use_plaintext_sizes() {
        let (_dir, _local, crypt) = crypt_over_tempdir("pw");
        crypt.mkdir("/docs").await.unwrap();
        write_via(&crypt, "/docs/a", &[1u8; 10]).await;
        write_via(&crypt, "/docs/b", &[2u8; 30]).await;

        let entries = crypt.read_dir("/docs").await.unwrap();
        let total: u64 = entries.iter().map(|info| info.size()).sum();
        assert_eq!(total, 40);

        let usage = crypt.dir_size("/docs").await.unwrap();
        assert_eq!(usage.files, 2);
        assert_eq!(usage.size, 40);
    }

    #[tokio::test]
    async fn test_two_files_share_no_keystream() {
        let (_dir, local, crypt) = crypt_over_tempdir("pw");
        let plaintext = [0u8; 64];
        write_via(&crypt, "/a", &plaintext).await;
        write_via(&crypt, "/b", &plaintext).await;

        // Same plaintext, fresh nonce per file: ciphertexts must differ.
        let a = read_via(local.as_ref(), "/a").await;
        let b = read_via(local.as_ref(), "/b").await;
        assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }
}
