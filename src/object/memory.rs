//! In-process object store used for tests and the injected GCS transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{ListPage, ObjectAttrs, ObjectBody, ObjectClient, ObjectEntry};
use crate::error::{FsError, Result};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    modified: SystemTime,
    content_type: Option<String>,
    content_encoding: Option<String>,
    deleted: bool,
}

/// Complete [`ObjectClient`] over a sorted in-memory keyspace: delimiter
/// grouping, key-ordered pagination and optional soft-delete tombstones.
pub struct InMemoryObjectClient {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    page_size: usize,
    soft_delete: bool,
    unreachable: AtomicBool,
}

impl InMemoryObjectClient {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            page_size: 1000,
            soft_delete: false,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Cap listing pages at `page_size` rows.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Deletions leave tombstone rows in listings instead of dropping keys.
    pub fn with_soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Make every subsequent call fail, as an unreachable bucket would.
    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    /// Store an object directly, bypassing the transfer path.
    pub fn insert_raw(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                modified: SystemTime::now(),
                content_type: content_type.map(str::to_owned),
                content_encoding: content_encoding.map(str::to_owned),
                deleted: false,
            },
        );
    }

    fn guard(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FsError::backend(format!(
                "bucket {:?} is not reachable",
                self.bucket
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn check_bucket(&self) -> Result<()> {
        self.guard()
    }

    async fn head(&self, key: &str) -> Result<ObjectAttrs> {
        self.guard()?;
        let objects = self.objects.lock().unwrap();
        match objects.get(key) {
            Some(obj) if !obj.deleted => Ok(ObjectAttrs {
                size: obj.data.len() as u64,
                modified: obj.modified,
                content_type: obj.content_type.clone(),
                content_encoding: obj.content_encoding.clone(),
            }),
            _ => Err(FsError::NotFound(key.to_string())),
        }
    }

    async fn get(&self, key: &str, offset: u64) -> Result<ObjectBody> {
        self.guard()?;
        let objects = self.objects.lock().unwrap();
        let obj = match objects.get(key) {
            Some(obj) if !obj.deleted => obj,
            _ => return Err(FsError::NotFound(key.to_string())),
        };
        if offset > obj.data.len() as u64 {
            return Err(FsError::backend(format!(
                "requested range offset {offset} is past the end of {key:?}"
            )));
        }
        let body = obj.data.slice(offset as usize..);
        Ok(Box::new(std::io::Cursor::new(body)))
    }

    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        self.guard()?;
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let size = data.len() as u64;
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                modified: SystemTime::now(),
                content_type: content_type.map(str::to_owned),
                content_encoding: None,
                deleted: false,
            },
        );
        Ok(size)
    }

    async fn copy(&self, source_key: &str, target_key: &str) -> Result<()> {
        self.guard()?;
        let mut objects = self.objects.lock().unwrap();
        let source = match objects.get(source_key) {
            Some(obj) if !obj.deleted => obj.clone(),
            _ => return Err(FsError::NotFound(source_key.to_string())),
        };
        objects.insert(
            target_key.to_string(),
            StoredObject {
                modified: SystemTime::now(),
                ..source
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.guard()?;
        let mut objects = self.objects.lock().unwrap();
        if self.soft_delete {
            if let Some(obj) = objects.get_mut(key) {
                obj.deleted = true;
            }
        } else {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<String>,
        max_keys: Option<usize>,
    ) -> Result<ListPage> {
        self.guard()?;
        let objects = self.objects.lock().unwrap();
        let cap = max_keys
            .unwrap_or(self.page_size)
            .min(self.page_size)
            .max(1);
        let mut page = ListPage::default();
        let mut emitted = 0usize;
        let mut last: Option<String> = None;
        for (key, obj) in objects.iter() {
            if let Some(token) = &continuation {
                if key.as_str() <= token.as_str() {
                    continue;
                }
            }
            if !key.starts_with(prefix) {
                continue;
            }
            if emitted >= cap {
                page.next_token = last;
                return Ok(page);
            }
            let rel = &key[prefix.len()..];
            match delimiter {
                Some(delim) if rel.contains(delim) => {
                    let end = rel.find(delim).unwrap() + delim.len();
                    let common = format!("{prefix}{}", &rel[..end]);
                    if !page.common_prefixes.contains(&common) {
                        page.common_prefixes.push(common);
                        emitted += 1;
                    }
                }
                _ => {
                    page.objects.push(ObjectEntry {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        modified: obj.modified,
                        content_type: obj.content_type.clone(),
                        deleted: obj.deleted,
                    });
                    emitted += 1;
                }
            }
            last = Some(key.clone());
        }
        Ok(page)
    }
}
