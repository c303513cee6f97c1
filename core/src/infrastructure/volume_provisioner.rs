// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Volume Provisioner (C3): owns the host-side btrfs subvolume/qgroup
//! lifecycle and the runtime-level named volume bound to it. The btrfs
//! side is delegated to a [`BtrfsExecutor`] (real implementation shells out
//! via `tokio::process::Command` so the registry's write-lock holder never
//! blocks a worker thread on a subprocess) so tests can substitute a fake
//! rather than requiring a real btrfs filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::runtime::ContainerRuntime;
use crate::domain::volume::{BtrfsExecutor, NamedVolume, UserSubvolume, VolumeError};

/// Real [`BtrfsExecutor`] backed by the `btrfs` CLI.
pub struct RealBtrfs;

#[async_trait]
impl BtrfsExecutor for RealBtrfs {
    /// `Ok(true)` iff `btrfs subvolume show` recognizes `path` as a
    /// subvolume. If the path is simply absent, `Ok(false)`. If it exists
    /// but `btrfs subvolume show` rejects it (a plain directory, a file,
    /// anything else), that's a [`VolumeError::VolumeConflict`] rather than
    /// a bare existence test — a stray directory at the mountpoint must
    /// never be silently treated as the user's subvolume.
    async fn subvolume_exists(&self, path: &Path) -> Result<bool, VolumeError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }

        let output = Command::new("btrfs")
            .args(["subvolume", "show", path_str(path)])
            .output()
            .await
            .map_err(|e| VolumeError::CommandFailed {
                command: format!("btrfs subvolume show {}", path_str(path)),
                detail: e.to_string(),
            })?;

        if output.status.success() {
            Ok(true)
        } else {
            Err(VolumeError::VolumeConflict(path.to_path_buf()))
        }
    }

    async fn create_subvolume(&self, path: &Path) -> Result<(), VolumeError> {
        run_btrfs(&["subvolume", "create", path_str(path)]).await
    }

    async fn apply_quota(&self, path: &Path, quota_bytes: u64) -> Result<(), VolumeError> {
        run_btrfs(&["qgroup", "limit", &quota_bytes.to_string(), path_str(path)]).await
    }
}

async fn run_btrfs(args: &[&str]) -> Result<(), VolumeError> {
    let output = Command::new("btrfs")
        .args(args)
        .output()
        .await
        .map_err(|e| VolumeError::CommandFailed { command: format!("btrfs {}", args.join(" ")), detail: e.to_string() })?;

    if !output.status.success() {
        let detail = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(VolumeError::CommandFailed { command: format!("btrfs {}", args.join(" ")), detail });
    }
    Ok(())
}

pub struct VolumeProvisioner {
    mount: PathBuf,
    device: String,
    runtime: Arc<dyn ContainerRuntime>,
    btrfs: Arc<dyn BtrfsExecutor>,
}

impl VolumeProvisioner {
    pub fn new(mount: PathBuf, device: String, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_btrfs(mount, device, runtime, Arc::new(RealBtrfs))
    }

    pub fn with_btrfs(
        mount: PathBuf,
        device: String,
        runtime: Arc<dyn ContainerRuntime>,
        btrfs: Arc<dyn BtrfsExecutor>,
    ) -> Self {
        Self { mount, device, runtime, btrfs }
    }

    /// Creates `<mount>/<user>` as a btrfs subvolume if it does not already
    /// exist, then applies the quota. Idempotent: re-running against an
    /// existing subvolume only re-applies the quota.
    pub async fn ensure_subvolume(&self, user: &str, quota_bytes: u64) -> Result<UserSubvolume, VolumeError> {
        let subvolume = UserSubvolume::for_user(&self.mount, user, quota_bytes);

        if !self.btrfs.subvolume_exists(&subvolume.path).await? {
            self.btrfs.create_subvolume(&subvolume.path).await?;
            info!(path = %subvolume.path.display(), "created user subvolume");
        } else {
            debug!(path = %subvolume.path.display(), "user subvolume already exists");
        }

        self.btrfs.apply_quota(&subvolume.path, quota_bytes).await?;
        Ok(subvolume)
    }

    /// Drops and recreates the named volume bound to `subvolume`, since the
    /// volume driver caches mount options across container creations.
    pub async fn ensure_named_volume(&self, user: &str, subvolume: &UserSubvolume) -> Result<NamedVolume, VolumeError> {
        let volume = NamedVolume::for_user(user);
        self.runtime
            .ensure_named_volume(&volume.name, &self.device, path_str(&subvolume.path))
            .await
            .map_err(|e| VolumeError::RuntimeVolumeFailed(e.to_string()))?;
        Ok(volume)
    }

    /// Removes the runtime-level named volume only; the underlying
    /// subvolume and its quota are left untouched (persistence survives
    /// container removal).
    pub async fn release_named_volume(&self, user: &str) -> Result<(), VolumeError> {
        let volume = NamedVolume::for_user(user);
        self.runtime
            .remove_named_volume(&volume.name)
            .await
            .map_err(|e| VolumeError::RuntimeVolumeFailed(e.to_string()))
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}
