// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Per-user persistent storage: a btrfs subvolume on the shared host mount,
//! and the runtime-level named volume bound to it.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("path exists but is not a btrfs subvolume: {0}")]
    VolumeConflict(PathBuf),
    #[error("btrfs command failed: {command}: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("runtime volume operation failed: {0}")]
    RuntimeVolumeFailed(String),
}

/// A user's persistent working directory: `<mount>/<user>` on the shared
/// btrfs filesystem. Outlives any single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSubvolume {
    pub path: PathBuf,
    pub quota_bytes: u64,
}

impl UserSubvolume {
    pub fn for_user(mount: &std::path::Path, user: &str, quota_bytes: u64) -> Self {
        Self { path: mount.join(user), quota_bytes }
    }
}

/// A runtime-level named volume bound to a [`UserSubvolume`]. Re-created on
/// every container creation because the driver caches mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedVolume {
    pub name: String,
}

impl NamedVolume {
    pub fn for_user(user: &str) -> Self {
        Self { name: format!("sshcontainer-vfs-{user}") }
    }
}

/// The privileged host-tool seam the Volume Provisioner shells out through.
/// Kept as a trait for the same reason the Container Runtime Adapter is one:
/// no test should need a real btrfs filesystem to exercise C3's callers.
#[async_trait]
pub trait BtrfsExecutor: Send + Sync {
    /// Returns `Ok(true)` if `path` is already a subvolume, `Ok(false)` if it
    /// is absent, or `Err` if it exists but isn't a subvolume.
    async fn subvolume_exists(&self, path: &std::path::Path) -> Result<bool, VolumeError>;
    async fn create_subvolume(&self, path: &std::path::Path) -> Result<(), VolumeError>;
    async fn apply_quota(&self, path: &std::path::Path, quota_bytes: u64) -> Result<(), VolumeError>;
}
