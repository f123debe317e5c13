//! S3 transport over aws-sdk-s3.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{ListPage, ObjectAttrs, ObjectBody, ObjectClient, ObjectEntry, ObjectFs};
use crate::error::{FsError, Result};

/// Minimum part size accepted by S3 multipart uploads.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

fn default_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_op_timeout() -> u64 {
    super::DEFAULT_OP_DEADLINE.as_secs()
}

fn default_copy_timeout() -> u64 {
    super::DEFAULT_COPY_DEADLINE.as_secs()
}

/// S3 backend configuration.
///
/// `region` may be omitted only when a custom `endpoint` is set (MinIO and
/// friends); static credentials are optional and fall back to the
/// environment chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3FsConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint: Option<String>,
    pub storage_class: Option<String>,
    /// Confines the backend to `key_prefix/` inside the bucket.
    #[serde(default)]
    pub key_prefix: String,
    /// Part size in bytes for multipart uploads, min 5 MiB.
    #[serde(default = "default_part_size")]
    pub upload_part_size: u64,
    /// Deadline for metadata and single-object calls, seconds.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
    /// Deadline for server-side copies and whole-root scans, seconds.
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout_secs: u64,
}

impl Default for S3FsConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            storage_class: None,
            key_prefix: String::new(),
            upload_part_size: default_part_size(),
            op_timeout_secs: default_op_timeout(),
            copy_timeout_secs: default_copy_timeout(),
        }
    }
}

impl S3FsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(FsError::Config("s3: bucket cannot be empty".into()));
        }
        if self.region.as_deref().unwrap_or("").is_empty() && self.endpoint.is_none() {
            return Err(FsError::Config(
                "s3: region is required when no custom endpoint is set".into(),
            ));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(FsError::Config(
                "s3: access_key_id and secret_access_key must be set together".into(),
            ));
        }
        if self.key_prefix.starts_with('/') {
            return Err(FsError::Config("s3: key_prefix cannot start with /".into()));
        }
        if self.upload_part_size < MIN_PART_SIZE {
            return Err(FsError::Config(
                "s3: upload_part_size must be at least 5 MiB".into(),
            ));
        }
        if self.op_timeout_secs == 0 || self.copy_timeout_secs == 0 {
            return Err(FsError::Config("s3: timeouts must be positive".into()));
        }
        Ok(())
    }
}

impl ObjectFs {
    /// Connect an S3 backend from a validated config.
    pub async fn new_s3(config: S3FsConfig) -> Result<ObjectFs> {
        config.validate()?;
        let label = format!("S3Fs bucket {:?}", config.bucket);
        let client = S3ObjectClient::connect(&config).await;
        Ok(ObjectFs::new(
            label,
            Arc::new(client),
            &config.key_prefix,
            Duration::from_secs(config.op_timeout_secs),
            Duration::from_secs(config.copy_timeout_secs),
        ))
    }
}

struct S3ObjectClient {
    client: Client,
    bucket: String,
    part_size: usize,
    storage_class: Option<StorageClass>,
}

impl S3ObjectClient {
    async fn connect(config: &S3FsConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "static",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if config.endpoint.is_some() {
            // Custom endpoints (MinIO etc.) rarely support virtual hosting.
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        log::debug!("s3 client ready for bucket {:?}", config.bucket);
        Self {
            client,
            bucket: config.bucket.clone(),
            part_size: config.upload_part_size as usize,
            storage_class: config
                .storage_class
                .as_deref()
                .map(StorageClass::from),
        }
    }

    async fn multipart_put(
        &self,
        key: &str,
        content_type: Option<&str>,
        first: Vec<u8>,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_owned))
            .set_storage_class(self.storage_class.clone())
            .send()
            .await
            .map_err(|err| map_request_error(key, err))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        match self.upload_parts(key, &upload_id, first, body).await {
            Ok(total) => Ok(total),
            Err(err) => {
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = abort {
                    log::warn!(
                        "abort multipart upload {key:?} failed: {}",
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut chunk: Vec<u8>,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut total = 0u64;
        while !chunk.is_empty() {
            total += chunk.len() as u64;
            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|err| map_request_error(key, err))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(resp.e_tag().map(str::to_owned))
                    .build(),
            );
            part_number += 1;
            chunk = read_chunk(body, self.part_size).await?;
        }
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| map_request_error(key, err))?;
        Ok(total)
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    async fn check_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| map_request_error(&self.bucket, err))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<ObjectAttrs> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_request_error(key, err))?;
        Ok(ObjectAttrs {
            size: resp.content_length().map(|v| v.max(0) as u64).unwrap_or(0),
            modified: to_system_time(resp.last_modified()),
            content_type: resp.content_type().map(str::to_owned),
            content_encoding: resp.content_encoding().map(str::to_owned),
        })
    }

    async fn get(&self, key: &str, offset: u64) -> Result<ObjectBody> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range((offset > 0).then(|| format!("bytes={offset}-")))
            .send()
            .await
            .map_err(|err| map_request_error(key, err))?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let first = read_chunk(body, self.part_size).await?;
        if first.len() < self.part_size {
            let size = first.len() as u64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .set_content_type(content_type.map(str::to_owned))
                .set_storage_class(self.storage_class.clone())
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|err| map_request_error(key, err))?;
            return Ok(size);
        }
        self.multipart_put(key, content_type, first, body).await
    }

    async fn copy(&self, source_key: &str, target_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .bucket(&self.bucket)
            .key(target_key)
            .set_storage_class(self.storage_class.clone())
            .send()
            .await
            .map_err(|err| map_request_error(source_key, err))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_request_error(key, err))?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<String>,
        max_keys: Option<usize>,
    ) -> Result<ListPage> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_owned))
            .set_continuation_token(continuation)
            .set_max_keys(max_keys.map(|m| m as i32))
            .send()
            .await
            .map_err(|err| map_request_error(prefix, err))?;
        let mut page = ListPage::default();
        for obj in resp.contents() {
            let Some(key) = obj.key() else { continue };
            page.objects.push(ObjectEntry {
                key: key.to_string(),
                size: obj.size().map(|v| v.max(0) as u64).unwrap_or(0),
                modified: to_system_time(obj.last_modified()),
                content_type: None,
                deleted: false,
            });
        }
        for common in resp.common_prefixes() {
            if let Some(p) = common.prefix() {
                page.common_prefixes.push(p.to_string());
            }
        }
        page.next_token = match (
            resp.is_truncated().unwrap_or(false),
            resp.next_continuation_token(),
        ) {
            (true, Some(token)) => Some(token.to_string()),
            _ => None,
        };
        Ok(page)
    }
}

/// Map an SDK failure onto the error taxonomy by HTTP status.
fn map_request_error<E>(key: &str, err: SdkError<E>) -> FsError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ctx) = &err {
        match ctx.raw().status().as_u16() {
            404 => return FsError::NotFound(key.to_string()),
            403 => return FsError::PermissionDenied(key.to_string()),
            _ => {}
        }
    }
    FsError::backend(DisplayErrorContext(&err))
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    dt.and_then(|dt| {
        let secs = u64::try_from(dt.secs()).ok()?;
        Some(SystemTime::UNIX_EPOCH + Duration::new(secs, dt.subsec_nanos()))
    })
    .unwrap_or(SystemTime::UNIX_EPOCH)
}

async fn read_chunk(body: &mut (dyn AsyncRead + Send + Unpin), size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0usize;
    while filled < size {
        let n = body.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> S3FsConfig {
        S3FsConfig {
            bucket: "files".to_string(),
            region: Some("eu-west-1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(valid().validate().is_ok());

        let mut cfg = valid();
        cfg.bucket.clear();
        assert!(matches!(cfg.validate(), Err(FsError::Config(_))));

        let mut cfg = valid();
        cfg.region = None;
        assert!(cfg.validate().is_err());
        cfg.endpoint = Some("http://127.0.0.1:9000".to_string());
        assert!(cfg.validate().is_ok());

        let mut cfg = valid();
        cfg.access_key_id = Some("AKIA123".to_string());
        assert!(cfg.validate().is_err());
        cfg.secret_access_key = Some("secret".to_string());
        assert!(cfg.validate().is_ok());

        let mut cfg = valid();
        cfg.key_prefix = "/abs".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.upload_part_size = 1024;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let cfg: S3FsConfig =
            serde_json::from_str(r#"{"bucket":"b","region":"us-east-1"}"#).unwrap();
        assert_eq!(cfg.bucket, "b");
        assert_eq!(cfg.upload_part_size, MIN_PART_SIZE);
        assert_eq!(cfg.op_timeout_secs, 30);
        assert_eq!(cfg.copy_timeout_secs, 300);
        assert!(cfg.key_prefix.is_empty());
        assert!(cfg.validate().is_ok());

        let back = serde_json::to_string(&cfg).unwrap();
        let again: S3FsConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(again.bucket, cfg.bucket);
    }
}
