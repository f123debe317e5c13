//! Quota accounting against a persistence collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::folder::{FolderMapping, VirtualFolder};
use crate::fs::DirUsage;

/// Current counters for one quota scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub size: i64,
    pub files: i64,
    /// Unix milliseconds of the last update, 0 when never updated.
    pub last_update: i64,
}

/// User-level ceilings; 0 disables a ceiling.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub size: i64,
    pub files: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Persistence collaborator for folder mappings and quota counters.
///
/// Updates must be single atomic increments, never read-then-write, so
/// deltas from concurrently completing transfers commute. `reset` overwrites
/// the counters instead; both forms refresh the last-update timestamp.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn folder_mappings(&self, username: &str) -> Result<Vec<FolderMapping>>;

    async fn update_folder_quota(
        &self,
        name: &str,
        delta_size: i64,
        delta_files: i64,
        reset: bool,
    ) -> Result<()>;

    async fn update_user_quota(
        &self,
        username: &str,
        delta_size: i64,
        delta_files: i64,
        reset: bool,
    ) -> Result<()>;

    async fn folder_usage(&self, name: &str) -> Result<QuotaUsage>;

    async fn user_usage(&self, username: &str) -> Result<QuotaUsage>;
}

#[derive(Default)]
struct MemoryState {
    folders: HashMap<String, QuotaUsage>,
    users: HashMap<String, QuotaUsage>,
    mappings: HashMap<String, Vec<FolderMapping>>,
}

/// In-process [`DataProvider`] with the same atomicity contract as a SQL
/// backend: every update applies under one lock acquisition.
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a folder with its current counters.
    pub fn add_folder(&self, folder: &VirtualFolder) {
        let mut state = self.state.lock().unwrap();
        state.folders.insert(
            folder.name.clone(),
            QuotaUsage {
                size: folder.used_quota_size,
                files: folder.used_quota_files,
                last_update: folder.last_quota_update,
            },
        );
    }

    pub fn set_user_mappings(&self, username: &str, mappings: Vec<FolderMapping>) {
        let mut state = self.state.lock().unwrap();
        state.mappings.insert(username.to_string(), mappings);
    }
}

fn apply(usage: &mut QuotaUsage, delta_size: i64, delta_files: i64, reset: bool) {
    if reset {
        usage.size = delta_size;
        usage.files = delta_files;
    } else {
        usage.size += delta_size;
        usage.files += delta_files;
    }
    usage.last_update = now_ms();
}

#[async_trait]
impl DataProvider for MemoryProvider {
    async fn folder_mappings(&self, username: &str) -> Result<Vec<FolderMapping>> {
        let state = self.state.lock().unwrap();
        Ok(state.mappings.get(username).cloned().unwrap_or_default())
    }

    async fn update_folder_quota(
        &self,
        name: &str,
        delta_size: i64,
        delta_files: i64,
        reset: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let usage = state.folders.entry(name.to_string()).or_default();
        apply(usage, delta_size, delta_files, reset);
        Ok(())
    }

    async fn update_user_quota(
        &self,
        username: &str,
        delta_size: i64,
        delta_files: i64,
        reset: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let usage = state.users.entry(username.to_string()).or_default();
        apply(usage, delta_size, delta_files, reset);
        Ok(())
    }

    async fn folder_usage(&self, name: &str) -> Result<QuotaUsage> {
        let state = self.state.lock().unwrap();
        Ok(state.folders.get(name).copied().unwrap_or_default())
    }

    async fn user_usage(&self, username: &str) -> Result<QuotaUsage> {
        let state = self.state.lock().unwrap();
        Ok(state.users.get(username).copied().unwrap_or_default())
    }
}

/// Admission checks and counter maintenance for one user.
///
/// A write inside a mounted folder must clear both the folder ceiling and
/// the user ceiling; exceeding either rejects the write before any byte
/// reaches the backend. Deltas are committed to the matched folder's
/// counters, or to the user's when the path is unmapped.
pub struct QuotaManager {
    provider: Arc<dyn DataProvider>,
    username: String,
    limits: QuotaLimits,
}

impl QuotaManager {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        username: impl Into<String>,
        limits: QuotaLimits,
    ) -> Self {
        Self {
            provider,
            username: username.into(),
            limits,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    /// Rejects the write when the incoming bytes/files would exceed a
    /// ceiling. With no ceilings configured this never reads the provider.
    pub async fn check_write(
        &self,
        path: &str,
        scope: Option<&FolderMapping>,
        incoming_size: u64,
        incoming_files: i64,
    ) -> Result<()> {
        let incoming = incoming_size as i64;
        if let Some(mapping) = scope {
            if mapping.quota_size > 0 || mapping.quota_files > 0 {
                let used = self.provider.folder_usage(&mapping.folder_name).await?;
                if mapping.quota_size > 0 && used.size + incoming > mapping.quota_size {
                    return Err(FsError::QuotaExceeded(format!(
                        "writing {incoming_size} bytes to {path} exceeds the quota of folder {}",
                        mapping.folder_name
                    )));
                }
                if mapping.quota_files > 0 && used.files + incoming_files > mapping.quota_files {
                    return Err(FsError::QuotaExceeded(format!(
                        "{path} exceeds the file limit of folder {}",
                        mapping.folder_name
                    )));
                }
            }
        }
        if self.limits.size > 0 || self.limits.files > 0 {
            let used = self.provider.user_usage(&self.username).await?;
            if self.limits.size > 0 && used.size + incoming > self.limits.size {
                return Err(FsError::QuotaExceeded(format!(
                    "writing {incoming_size} bytes to {path} exceeds the quota of user {}",
                    self.username
                )));
            }
            if self.limits.files > 0 && used.files + incoming_files > self.limits.files {
                return Err(FsError::QuotaExceeded(format!(
                    "{path} exceeds the file limit of user {}",
                    self.username
                )));
            }
        }
        Ok(())
    }

    /// Applies a signed delta to the scope owning the path.
    pub async fn commit(
        &self,
        scope: Option<&FolderMapping>,
        delta_size: i64,
        delta_files: i64,
    ) -> Result<()> {
        if delta_size == 0 && delta_files == 0 {
            return Ok(());
        }
        match scope {
            Some(mapping) => {
                log::debug!(
                    "quota: folder {} {delta_size:+} bytes {delta_files:+} files",
                    mapping.folder_name
                );
                self.provider
                    .update_folder_quota(&mapping.folder_name, delta_size, delta_files, false)
                    .await
            }
            None => {
                log::debug!(
                    "quota: user {} {delta_size:+} bytes {delta_files:+} files",
                    self.username
                );
                self.provider
                    .update_user_quota(&self.username, delta_size, delta_files, false)
                    .await
            }
        }
    }

    /// Overwrites a folder's counters with freshly scanned usage.
    pub async fn reset_folder(&self, name: &str, usage: &DirUsage) -> Result<()> {
        self.provider
            .update_folder_quota(name, usage.size, usage.files, true)
            .await
    }

    /// Overwrites the user's counters with freshly scanned usage.
    pub async fn reset_user(&self, usage: &DirUsage) -> Result<()> {
        self.provider
            .update_user_quota(&self.username, usage.size, usage.files, true)
            .await
    }
}
