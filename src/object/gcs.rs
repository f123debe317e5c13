//! GCS backend configuration over an injected transport.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ObjectClient, ObjectFs};
use crate::error::{FsError, Result};

fn default_op_timeout() -> u64 {
    super::DEFAULT_OP_DEADLINE.as_secs()
}

fn default_copy_timeout() -> u64 {
    super::DEFAULT_COPY_DEADLINE.as_secs()
}

/// GCS backend configuration.
///
/// Credentials come either from a service-account file or from the ambient
/// environment (`automatic_credentials`), never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsFsConfig {
    pub bucket: String,
    pub credentials_file: Option<String>,
    #[serde(default)]
    pub automatic_credentials: bool,
    pub storage_class: Option<String>,
    /// Confines the backend to `key_prefix/` inside the bucket.
    #[serde(default)]
    pub key_prefix: String,
    /// Deadline for metadata and single-object calls, seconds.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
    /// Deadline for server-side copies and whole-root scans, seconds.
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout_secs: u64,
}

impl Default for GcsFsConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            credentials_file: None,
            automatic_credentials: false,
            storage_class: None,
            key_prefix: String::new(),
            op_timeout_secs: default_op_timeout(),
            copy_timeout_secs: default_copy_timeout(),
        }
    }
}

impl GcsFsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(FsError::Config("gcs: bucket cannot be empty".into()));
        }
        match (&self.credentials_file, self.automatic_credentials) {
            (Some(_), true) => {
                return Err(FsError::Config(
                    "gcs: credentials_file and automatic_credentials are mutually exclusive"
                        .into(),
                ))
            }
            (None, false) => {
                return Err(FsError::Config(
                    "gcs: either credentials_file or automatic_credentials is required".into(),
                ))
            }
            _ => {}
        }
        if self.key_prefix.starts_with('/') {
            return Err(FsError::Config(
                "gcs: key_prefix cannot start with /".into(),
            ));
        }
        if self.op_timeout_secs == 0 || self.copy_timeout_secs == 0 {
            return Err(FsError::Config("gcs: timeouts must be positive".into()));
        }
        Ok(())
    }
}

impl ObjectFs {
    /// GCS backend from a validated config and an injected transport.
    ///
    /// The transport carries the wire protocol; this crate ships no GCS SDK,
    /// so callers hand in an [`ObjectClient`] bound to their client of
    /// choice (tests use [`super::InMemoryObjectClient`]).
    pub fn new_gcs(config: GcsFsConfig, transport: Arc<dyn ObjectClient>) -> Result<ObjectFs> {
        config.validate()?;
        Ok(ObjectFs::new(
            format!("GCSFs bucket {:?}", config.bucket),
            transport,
            &config.key_prefix,
            Duration::from_secs(config.op_timeout_secs),
            Duration::from_secs(config.copy_timeout_secs),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::InMemoryObjectClient;
    use super::*;
    use crate::fs::Fs;

    fn valid() -> GcsFsConfig {
        GcsFsConfig {
            bucket: "media".to_string(),
            automatic_credentials: true,
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
        cfg.credentials_file = Some("/etc/sa.json".to_string());
        assert!(cfg.validate().is_err());
        cfg.automatic_credentials = false;
        assert!(cfg.validate().is_ok());

        let mut cfg = valid();
        cfg.automatic_credentials = false;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.key_prefix = "/abs".to_string();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_backend_over_injected_transport() {
        let mut cfg = valid();
        cfg.key_prefix = "tenant".to_string();
        let client = Arc::new(InMemoryObjectClient::new("media"));
        let fs = ObjectFs::new_gcs(cfg, client).unwrap();

        assert_eq!(fs.name(), "GCSFs bucket \"media\"");
        assert!(fs.stat("/").await.unwrap().is_dir());
        assert_eq!(fs.resolve("/doc.txt"), "tenant/doc.txt");
    }
}
