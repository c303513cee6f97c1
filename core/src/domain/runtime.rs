// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! The container runtime adapter's trait surface (C4). No code outside
//! `infrastructure::docker` should import a runtime-specific crate; every
//! other component talks to this trait only, so a test fake can stand in
//! for a real container engine.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::domain::config::{BindMount, DeviceMapping};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("failed to create container: {0}")]
    ContainerCreateFailed(String),
    #[error("failed to start container: {0}")]
    StartFailed(String),
    #[error("failed to exec in container: {0}")]
    ExecFailed(String),
    #[error("failed to attach additional network: {0}")]
    NetworkAttachFailed(String),
    #[error("container not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to create one user's container. Carries no per-session
/// state (environment is not baked in here — it flows through [`ExecSpec`]
/// on every session instead, since one container serves many sessions).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub read_only_root: bool,
    pub devices: Vec<DeviceMapping>,
    pub capabilities: Vec<String>,
    pub security_opts: Vec<String>,
    pub network_mode: String,
    pub named_volume: String,
    pub named_volume_guest_path: String,
    pub tmpfs_size_bytes: u64,
    pub extra_mounts: Vec<BindMount>,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub running: bool,
    pub primary_network: Option<String>,
}

/// A single command to run inside an already-running container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub user: String,
    pub tty: bool,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
}

/// One frame of exec output. In TTY mode the guest multiplexes nothing, so
/// only `Stdout` frames are produced; in non-TTY mode stdout/stderr stay
/// distinguishable.
#[derive(Debug, Clone)]
pub enum ExecFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type ExecOutputStream = Pin<Box<dyn Stream<Item = Result<ExecFrame, RuntimeError>> + Send>>;
pub type ExecInputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A live exec instance: an output stream and a half-closable input sink.
pub struct ExecHandle {
    pub exec_id: String,
    pub output: ExecOutputStream,
    pub input: ExecInputSink,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerId, RuntimeError>;
    async fn connect_additional_networks(&self, id: &ContainerId, networks: &[String]) -> Result<(), RuntimeError>;
    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &ContainerId, remove_volumes: bool) -> Result<(), RuntimeError>;
    async fn list_by_label(&self, label_key: &str, label_value: &str) -> Result<Vec<ContainerId>, RuntimeError>;
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo, RuntimeError>;

    async fn exec(&self, id: &ContainerId, spec: ExecSpec) -> Result<ExecHandle, RuntimeError>;
    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), RuntimeError>;

    /// Remove any stale named volume (ignoring not-found) then create a
    /// fresh one bound to the given btrfs subvolume on `device`.
    async fn ensure_named_volume(&self, name: &str, device: &str, subvolume_path: &str) -> Result<(), RuntimeError>;
    /// Remove a named volume, ignoring not-found. Never touches the
    /// underlying subvolume.
    async fn remove_named_volume(&self, name: &str) -> Result<(), RuntimeError>;
}
