// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Startup configuration, collected once from the process environment.

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::size::{self, ByteSize, SizeError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {source}")]
    InvalidSize { key: &'static str, source: SizeError },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A host bind mount, parsed from `src:dst[:ro]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub guest_path: String,
    pub read_only: bool,
}

impl BindMount {
    fn parse(spec: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [src, dst] => Ok(BindMount {
                host_path: src.to_string(),
                guest_path: dst.to_string(),
                read_only: false,
            }),
            [src, dst, mode] => Ok(BindMount {
                host_path: src.to_string(),
                guest_path: dst.to_string(),
                read_only: *mode == "ro",
            }),
            _ => Err(ConfigError::Invalid {
                key: "CONTAINER_MOUNTS",
                reason: format!("malformed mount spec {spec:?}, expected src:dst[:ro]"),
            }),
        }
    }
}

/// A host device mapping, parsed from `host[:guest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub host_path: String,
    pub guest_path: String,
    pub permissions: String,
}

impl DeviceMapping {
    fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((host, guest)) => DeviceMapping {
                host_path: host.to_string(),
                guest_path: guest.to_string(),
                permissions: "rwm".to_string(),
            },
            None => DeviceMapping {
                host_path: spec.to_string(),
                guest_path: spec.to_string(),
                permissions: "rwm".to_string(),
            },
        }
    }
}

/// Fully validated, immutable startup configuration. Every other component
/// consumes this type, never raw environment strings.
#[derive(Debug, Clone)]
pub struct Config {
    pub ssh_port: u16,
    pub ssh_host_key: PathBuf,
    pub log_level: u8,

    pub oauth_endpoint: String,
    pub client_id: String,
    pub client_secret: String,

    pub docker_image: String,
    pub docker_memory_limit: ByteSize,
    pub docker_nano_cpus: i64,
    pub docker_network_mode: String,
    pub docker_networks: Vec<String>,
    pub docker_devices: Vec<DeviceMapping>,
    pub docker_cap_add: Vec<String>,
    pub docker_sec_opt: Vec<String>,
    pub docker_read_only: bool,

    pub quota: ByteSize,
    pub quota_str: String,
    pub container_idle_timeout_secs: u64,
    pub container_cmd: Vec<String>,
    pub container_user: String,
    pub container_vfs_mount: String,
    pub container_mounts: Vec<BindMount>,

    pub container_id: String,
    pub block_device: String,
}

impl Config {
    /// Load and validate configuration from the process environment. This is
    /// the only place raw env strings are read; every field below is already
    /// parsed and validated by the time this returns.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ssh_port = opt_env("SSH_PORT")
            .unwrap_or_else(|| "2222".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid { key: "SSH_PORT", reason: "not a valid port number".into() })?;

        let ssh_host_key = PathBuf::from(opt_env("SSH_HOST_KEY").unwrap_or_else(|| "/app/ssh_host_key".to_string()));

        let log_level: u8 = opt_env("LOG_LEVEL")
            .unwrap_or_else(|| "4".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid { key: "LOG_LEVEL", reason: "not an integer 0-6".into() })?;

        let oauth_endpoint = opt_env("OAUTH_ENDPOINT").unwrap_or_else(|| "http://proxy:3000".to_string());
        let client_id = req_env("CLIENT_ID")?;
        let client_secret = req_env("CLIENT_SECRET")?;

        let docker_image = opt_env("DOCKER_IMAGE").unwrap_or_else(|| "ubuntu:latest".to_string());

        let memory_str = opt_env("DOCKER_MEMORY_LIMIT").unwrap_or_else(|| "512M".to_string());
        let docker_memory_limit = size::parse(&memory_str)
            .map_err(|source| ConfigError::InvalidSize { key: "DOCKER_MEMORY_LIMIT", source })?;

        let cpu_limit: f64 = opt_env("DOCKER_CPU_LIMIT")
            .unwrap_or_else(|| "1.0".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid { key: "DOCKER_CPU_LIMIT", reason: "not a valid float".into() })?;
        let docker_nano_cpus = (cpu_limit * 1_000_000_000.0).floor() as i64;

        let docker_network_mode = opt_env("DOCKER_NETWORK_MODE").unwrap_or_else(|| "bridge".to_string());
        let docker_networks = csv_list("DOCKER_NETWORKS");
        let docker_devices = csv_list("DOCKER_DEVICES").into_iter().map(|s| DeviceMapping::parse(&s)).collect();
        let docker_cap_add = csv_list("DOCKER_CAP_ADD");
        let docker_sec_opt = csv_list("DOCKER_SEC_OPT");
        let docker_read_only = opt_env("DOCKER_READ_ONLY")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let quota_str = opt_env("QUOTA").unwrap_or_else(|| "1G".to_string());
        let quota = size::parse(&quota_str).map_err(|source| ConfigError::InvalidSize { key: "QUOTA", source })?;

        let container_idle_timeout_secs: u64 = opt_env("CONTAINER_IDLE_TIMEOUT")
            .unwrap_or_else(|| "60".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid { key: "CONTAINER_IDLE_TIMEOUT", reason: "not a non-negative integer".into() })?;

        let container_cmd: Vec<String> = opt_env("CONTAINER_CMD")
            .unwrap_or_else(|| "/bin/bash".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let container_user = opt_env("CONTAINER_USER").unwrap_or_default();
        let container_vfs_mount = opt_env("CONTAINER_VFS_MOUNT").unwrap_or_else(|| "/workspace".to_string());

        let container_mounts = csv_list("CONTAINER_MOUNTS")
            .iter()
            .map(|s| BindMount::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        let container_id = req_env("CONTAINER_ID")?;
        let block_device = req_env("BLOCK_DEVICE")?;

        Ok(Config {
            ssh_port,
            ssh_host_key,
            log_level,
            oauth_endpoint,
            client_id,
            client_secret,
            docker_image,
            docker_memory_limit,
            docker_nano_cpus,
            docker_network_mode,
            docker_networks,
            docker_devices,
            docker_cap_add,
            docker_sec_opt,
            docker_read_only,
            quota,
            quota_str,
            container_idle_timeout_secs,
            container_cmd,
            container_user,
            container_vfs_mount,
            container_mounts,
            container_id,
            block_device,
        })
    }

}

impl std::fmt::Display for Config {
    /// Redacts `client_secret` even in human-facing summaries.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Config {{ ssh_port: {}, docker_image: {:?}, docker_memory_limit: {}, quota: {}, idle_timeout: {}s, client_secret: \"<redacted>\" }}",
            self.ssh_port,
            self.docker_image,
            size::format(self.docker_memory_limit.bytes()),
            size::format(self.quota.bytes()),
            self.container_idle_timeout_secs,
        )
    }
}

fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn req_env(key: &'static str) -> Result<String, ConfigError> {
    opt_env(key).ok_or(ConfigError::Missing(key))
}

fn csv_list(key: &str) -> Vec<String> {
    opt_env(key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}
