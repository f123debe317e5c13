//! Virtual folders: named storage roots mountable into a user's namespace.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::pathutil;

/// A named, quota-tracked storage root as the persistence layer sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFolder {
    pub name: String,
    /// Absolute path of the folder's data on its backend.
    pub mapped_path: String,
    #[serde(default)]
    pub used_quota_size: i64,
    #[serde(default)]
    pub used_quota_files: i64,
    /// Unix milliseconds of the last counter update, 0 when never updated.
    #[serde(default)]
    pub last_quota_update: i64,
}

/// Mounts a virtual folder at a path inside one user's namespace.
///
/// `quota_size`/`quota_files` are per-folder ceilings; 0 disables the
/// ceiling while the counters keep tracking usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMapping {
    pub folder_name: String,
    /// Mount point, an absolute path in the user's namespace.
    pub virtual_path: String,
    /// Absolute path of the folder's data on its backend.
    pub mapped_path: String,
    #[serde(default)]
    pub quota_size: i64,
    #[serde(default)]
    pub quota_files: i64,
}

impl FolderMapping {
    pub fn validate(&self) -> Result<()> {
        if self.folder_name.is_empty() {
            return Err(FsError::Config("folder name cannot be empty".into()));
        }
        if pathutil::clean(&self.virtual_path) == "/" {
            return Err(FsError::Config(format!(
                "folder {}: the namespace root cannot be a mount point",
                self.folder_name
            )));
        }
        if self.mapped_path.is_empty() {
            return Err(FsError::Config(format!(
                "folder {}: mapped path cannot be empty",
                self.folder_name
            )));
        }
        if self.quota_size < 0 || self.quota_files < 0 {
            return Err(FsError::Config(format!(
                "folder {}: quota limits cannot be negative, use 0 for unlimited",
                self.folder_name
            )));
        }
        Ok(())
    }
}

/// Picks the mapping whose mount point is the longest prefix of a request
/// path, matching on whole path segments. No match means the user's home
/// backend handles the path.
#[derive(Debug, Default)]
pub struct FolderResolver {
    mappings: Vec<FolderMapping>,
}

impl FolderResolver {
    pub fn new(mappings: Vec<FolderMapping>) -> Self {
        let mappings = mappings
            .into_iter()
            .map(|mut mapping| {
                mapping.virtual_path = pathutil::clean(&mapping.virtual_path);
                mapping
            })
            .collect();
        Self { mappings }
    }

    pub fn mappings(&self) -> &[FolderMapping] {
        &self.mappings
    }

    /// Resolves a namespace path to its mapping and the path inside the
    /// folder, re-rooted at `/`. None routes to the home backend.
    pub fn resolve(&self, virtual_path: &str) -> Option<(&FolderMapping, String)> {
        let cleaned = pathutil::clean(virtual_path);
        self.mappings
            .iter()
            .filter(|mapping| is_under(&cleaned, &mapping.virtual_path))
            .max_by_key(|mapping| mapping.virtual_path.len())
            .map(|mapping| (mapping, strip_mount(&cleaned, &mapping.virtual_path)))
    }

    pub fn is_mount_point(&self, virtual_path: &str) -> bool {
        let cleaned = pathutil::clean(virtual_path);
        self.mappings
            .iter()
            .any(|mapping| mapping.virtual_path == cleaned)
    }
}

/// True when `path` equals `root` or sits below it on a segment boundary.
pub(crate) fn is_under(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn strip_mount(path: &str, mount: &str) -> String {
    if path == mount {
        "/".to_string()
    } else {
        path[mount.len()..].to_string()
    }
}
