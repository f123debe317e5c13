//! File metadata value type shared by all storage backends.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Metadata for a single file or directory entry.
///
/// Directories can be real backend entries or emulated from a key prefix on
/// flat object stores; both forms look identical here. For directories the
/// size is advisory and commonly zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name (base name, not the full path)
    name: String,
    /// Size in bytes (0 for directories)
    size: u64,
    /// Whether the entry is a directory
    is_dir: bool,
    /// Last modification time
    modified: SystemTime,
    /// Content type as reported by the backend, when known
    content_type: Option<String>,
}

impl FileInfo {
    /// Create metadata for an entry.
    pub fn new(name: impl Into<String>, is_dir: bool, size: u64, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir,
            modified,
            content_type: None,
        }
    }

    /// Create metadata for a regular file.
    pub fn file(name: impl Into<String>, size: u64, modified: SystemTime) -> Self {
        Self::new(name, false, size, modified)
    }

    /// Create metadata for a directory, stamped with the current time.
    pub fn dir(name: impl Into<String>) -> Self {
        Self::new(name, true, 0, SystemTime::now())
    }

    /// Attach the backend-reported content type.
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Replace the reported size (used by overlays that adjust for framing).
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Check if this entry is a regular file.
    pub fn is_file(&self) -> bool {
        !self.is_dir
    }

    /// Last modification time.
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Content type as reported by the backend, when known.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}
