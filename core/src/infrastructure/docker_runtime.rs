// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Bollard-backed implementation of [`ContainerRuntime`] (C4). No other
//! module in this crate imports `bollard` directly.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as DockerConfig, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::network::ConnectNetworkOptions;
use bollard::service::{HostConfig, LogOutput};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::domain::runtime::{
    ContainerId, ContainerInfo, ContainerRuntime, ContainerSpec, ExecFrame, ExecHandle, ExecSpec,
    RuntimeError,
};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the platform default (unix socket on Linux/macOS,
    /// named pipe on Windows), matching the daemon's own container runtime.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let mut binds: Vec<String> = spec
            .extra_mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", m.host_path, m.guest_path, mode)
            })
            .collect();
        binds.push(format!("{}:{}", spec.named_volume, spec.named_volume_guest_path));

        let devices = spec
            .devices
            .iter()
            .map(|d| bollard::models::DeviceMapping {
                path_on_host: Some(d.host_path.clone()),
                path_in_container: Some(d.guest_path.clone()),
                cgroup_permissions: Some(d.permissions.clone()),
            })
            .collect::<Vec<_>>();

        let host_config = HostConfig {
            binds: Some(binds),
            network_mode: Some(spec.network_mode.clone()),
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            readonly_rootfs: Some(spec.read_only_root),
            devices: Some(devices),
            cap_add: Some(spec.capabilities.clone()),
            security_opt: Some(spec.security_opts.clone()),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), format!("size={}", spec.tmpfs_size_bytes))])),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: spec.name.clone(), platform: None };
        let config = DockerConfig {
            image: Some(spec.image.clone()),
            tty: Some(true),
            cmd: if spec.command.is_empty() { None } else { Some(spec.command.clone()) },
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let res = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::ContainerCreateFailed(e.to_string()))?;

        info!(container_id = %res.id, "created user container");
        Ok(ContainerId(res.id))
    }

    async fn connect_additional_networks(&self, id: &ContainerId, networks: &[String]) -> Result<(), RuntimeError> {
        for network in networks {
            let options = ConnectNetworkOptions { container: id.0.clone(), ..Default::default() };
            if let Err(e) = self.docker.connect_network(network, options).await {
                let err = RuntimeError::NetworkAttachFailed(format!("{network}: {e}"));
                warn!(container_id = %id, network, error = %err, "network attach failed, force-removing container");
                if let Err(remove_err) = self.remove(id, true).await {
                    warn!(container_id = %id, error = %remove_err, "failed to force-remove container after network attach failure");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(&id.0, None)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, remove_volumes: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions { force: true, v: remove_volumes, ..Default::default() };
        match self.docker.remove_container(&id.0, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(RuntimeError::RuntimeUnavailable(e.to_string())),
        }
    }

    async fn list_by_label(&self, label_key: &str, label_value: &str) -> Result<Vec<ContainerId>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{label_key}={label_value}")]);
        let options = ListContainersOptions { all: true, filters, ..Default::default() };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        Ok(containers.into_iter().filter_map(|c| c.id.map(ContainerId)).collect())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(&id.0, None)
            .await
            .map_err(|e| RuntimeError::NotFound(e.to_string()))?;
        let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
        let primary_network = inspect
            .network_settings
            .and_then(|n| n.networks)
            .and_then(|nets| nets.keys().next().cloned());
        Ok(ContainerInfo { id: id.clone(), running, primary_network })
    }

    async fn exec(&self, id: &ContainerId, spec: ExecSpec) -> Result<ExecHandle, RuntimeError> {
        let exec_config = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(true),
            tty: Some(spec.tty),
            env: Some(spec.env.clone()),
            user: if spec.user.is_empty() { None } else { Some(spec.user.clone()) },
            cmd: Some(spec.cmd.clone()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&id.0, exec_config)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let start_opts = StartExecOptions { detach: false, ..Default::default() };
        let started = self
            .docker
            .start_exec(&exec.id, Some(start_opts))
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let frames: std::pin::Pin<Box<dyn Stream<Item = Result<ExecFrame, RuntimeError>> + Send>> =
                    Box::pin(output.map(|item| {
                        item.map(|log| match log {
                            LogOutput::StdOut { message } => ExecFrame::Stdout(message.to_vec()),
                            LogOutput::StdErr { message } => ExecFrame::Stderr(message.to_vec()),
                            LogOutput::StdIn { message } => ExecFrame::Stdout(message.to_vec()),
                            LogOutput::Console { message } => ExecFrame::Stdout(message.to_vec()),
                        })
                        .map_err(|e| RuntimeError::ExecFailed(e.to_string()))
                    }));
                let sink: std::pin::Pin<Box<dyn AsyncWrite + Send>> = Box::pin(input);
                Ok(ExecHandle { exec_id: exec.id, output: frames, input: sink })
            }
            StartExecResults::Detached => Err(RuntimeError::ExecFailed("exec unexpectedly detached".into())),
        }
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), RuntimeError> {
        let options = ResizeExecOptions { height: rows, width: cols };
        match self.docker.resize_exec(exec_id, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, exec_id, "resize_exec failed");
                Err(RuntimeError::ExecFailed(e.to_string()))
            }
        }
    }

    async fn ensure_named_volume(&self, name: &str, device: &str, subvolume_path: &str) -> Result<(), RuntimeError> {
        if let Err(e) = self.remove_named_volume(name).await {
            warn!(error = %e, name, "stale named volume removal failed, continuing");
        }

        let mut driver_opts = HashMap::new();
        driver_opts.insert("type".to_string(), "none".to_string());
        driver_opts.insert("device".to_string(), device.to_string());
        driver_opts.insert("o".to_string(), format!("bind,{subvolume_path}"));

        let options = CreateVolumeOptions { name: name.to_string(), driver: "local".to_string(), driver_opts, ..Default::default() };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn remove_named_volume(&self, name: &str) -> Result<(), RuntimeError> {
        match self.docker.remove_volume(name, Some(RemoveVolumeOptions { force: true })).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(RuntimeError::RuntimeUnavailable(e.to_string())),
        }
    }
}
