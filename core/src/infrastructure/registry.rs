// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-memory implementation of [`Registry`] (C5): username -> container,
//! refcounted across concurrent sessions, reaped once idle. Lock ordering
//! is the map's `RwLock` before any individual entry's `Mutex`; no runtime
//! I/O is ever performed while either is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::config::Config;
use crate::domain::container::{Registry, RegistryError, UserContainerState};
use crate::domain::runtime::{ContainerId, ContainerRuntime, ContainerSpec};
use crate::infrastructure::volume_provisioner::VolumeProvisioner;

pub const OWNER_LABEL_KEY: &str = "owner";
pub const OWNER_LABEL_VALUE: &str = "sshcontainer";
pub const OWNER_USER_LABEL_KEY: &str = "owner.user";

/// How often the background reaper scans for idle entries.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

pub struct InMemoryRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<VolumeProvisioner>,
    config: Config,
    /// The gateway's own primary network, discovered by self-inspecting its
    /// container at startup, so every new user container joins it alongside
    /// whatever `DOCKER_NETWORKS` names. `None` if the gateway itself has no
    /// primary network (e.g. `network_mode: none`).
    gateway_network: Option<String>,
    idle_timeout: Duration,
    entries: RwLock<HashMap<String, Arc<Mutex<UserContainerState>>>>,
    reaper: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl InMemoryRegistry {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<VolumeProvisioner>,
        config: Config,
        gateway_network: Option<String>,
    ) -> Arc<Self> {
        let idle_timeout = Duration::from_secs(config.container_idle_timeout_secs);
        let registry = Arc::new(Self {
            runtime,
            provisioner,
            config,
            gateway_network,
            idle_timeout,
            entries: RwLock::new(HashMap::new()),
            reaper: Mutex::new(None),
        });

        let token = CancellationToken::new();
        let reaper_token = token.clone();
        let background = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reaper_token.cancelled() => break,
                    _ = tokio::time::sleep(REAP_INTERVAL) => {
                        let reaped = background.reap_once().await;
                        if reaped > 0 {
                            info!(reaped, "reaped idle containers");
                        }
                    }
                }
            }
        });
        if let Ok(mut guard) = registry.reaper.try_lock() {
            *guard = Some((handle, token));
        }

        registry
    }

    async fn create_container_for(&self, user: &str) -> Result<ContainerId, RegistryError> {
        let subvolume = self.provisioner.ensure_subvolume(user, self.config.quota.bytes()).await?;
        let named_volume = self.provisioner.ensure_named_volume(user, &subvolume).await?;

        let mut labels = HashMap::new();
        labels.insert(OWNER_LABEL_KEY.to_string(), OWNER_LABEL_VALUE.to_string());
        labels.insert(OWNER_USER_LABEL_KEY.to_string(), user.to_string());

        let spec = ContainerSpec {
            name: format!("sshcontainer-{user}"),
            image: self.config.docker_image.clone(),
            command: self.config.container_cmd.clone(),
            labels,
            memory_bytes: self.config.docker_memory_limit.bytes() as i64,
            nano_cpus: self.config.docker_nano_cpus,
            read_only_root: self.config.docker_read_only,
            devices: self.config.docker_devices.clone(),
            capabilities: self.config.docker_cap_add.clone(),
            security_opts: self.config.docker_sec_opt.clone(),
            network_mode: self.config.docker_network_mode.clone(),
            named_volume: named_volume.name,
            named_volume_guest_path: self.config.container_vfs_mount.clone(),
            tmpfs_size_bytes: 64 * 1024 * 1024,
            extra_mounts: self.config.container_mounts.clone(),
        };

        let id = self.runtime.create(spec).await?;

        // New containers join the operator-configured extra networks plus
        // the gateway's own primary network (discovered by self-inspection
        // at startup), so the gateway can reach a user's container even
        // when the two don't otherwise share `DOCKER_NETWORK_MODE`.
        let mut additional_networks = self.config.docker_networks.clone();
        if let Some(gateway_network) = &self.gateway_network {
            if gateway_network != &self.config.docker_network_mode && !additional_networks.contains(gateway_network) {
                additional_networks.push(gateway_network.clone());
            }
        }

        if !additional_networks.is_empty() {
            // The adapter itself force-removes the container on a network
            // attach failure (spec §4.4), but the create/connect/start
            // sequence has no single owner of rollback responsibility, so
            // this call site also guards against an adapter that merely
            // propagates the error without cleaning up.
            if let Err(e) = self.runtime.connect_additional_networks(&id, &additional_networks).await {
                self.force_remove_after_create_failure(&id, "connect_additional_networks").await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.runtime.start(&id).await {
            self.force_remove_after_create_failure(&id, "start").await;
            return Err(e.into());
        }

        Ok(id)
    }

    /// Best-effort cleanup of a container created but not fully brought up.
    /// Failures here are logged, never propagated — the original creation
    /// error is what the caller needs to see.
    async fn force_remove_after_create_failure(&self, id: &ContainerId, step: &str) {
        if let Err(e) = self.runtime.remove(id, true).await {
            warn!(container_id = %id, step, error = %e, "failed to roll back container after creation failure");
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn acquire(&self, user: &str, _env: &[String]) -> Result<ContainerId, RegistryError> {
        // Fast path: entry already exists.
        {
            let map = self.entries.read().await;
            if let Some(entry) = map.get(user) {
                let mut state = entry.lock().await;
                state.acquire();
                return Ok(state.container_id.clone());
            }
        }

        // Slow path: create under the write lock so two concurrent logins
        // for a brand-new user cannot race each other into double-creation.
        let mut map = self.entries.write().await;
        if let Some(entry) = map.get(user) {
            let mut state = entry.lock().await;
            state.acquire();
            return Ok(state.container_id.clone());
        }

        let container_id = self.create_container_for(user).await?;
        let state = UserContainerState::new(container_id.clone());
        map.insert(user.to_string(), Arc::new(Mutex::new(state)));
        Ok(container_id)
    }

    async fn release(&self, user: &str) {
        let map = self.entries.read().await;
        if let Some(entry) = map.get(user) {
            let mut state = entry.lock().await;
            state.release();
        }
    }

    async fn reap_once(&self) -> usize {
        let expired: Vec<String> = {
            let map = self.entries.read().await;
            let mut expired = Vec::new();
            for (user, entry) in map.iter() {
                let state = entry.lock().await;
                if state.is_idle() && state.idle_for() >= self.idle_timeout {
                    expired.push(user.clone());
                }
            }
            expired
        };

        let mut reaped = 0;
        for user in expired {
            let container_id = {
                let mut map = self.entries.write().await;
                match map.get(&user) {
                    Some(entry) => {
                        let state = entry.lock().await;
                        if !state.is_idle() || state.idle_for() < self.idle_timeout {
                            continue;
                        }
                        let id = state.container_id.clone();
                        drop(state);
                        map.remove(&user);
                        id
                    }
                    None => continue,
                }
            };

            if let Err(e) = self.runtime.remove(&container_id, true).await {
                warn!(user, error = %e, "idle reap failed, container left running");
                continue;
            }
            if let Err(e) = self.provisioner.release_named_volume(&user).await {
                warn!(user, error = %e, "failed to release named volume after reap");
            }
            reaped += 1;
        }
        reaped
    }

    async fn shutdown(&self) {
        if let Some((handle, token)) = self.reaper.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }

        match self.runtime.list_by_label(OWNER_LABEL_KEY, OWNER_LABEL_VALUE).await {
            Ok(ids) => {
                for id in ids {
                    if let Err(e) = self.runtime.remove(&id, true).await {
                        error!(container_id = %id, error = %e, "failed to remove container during shutdown");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to list owned containers during shutdown"),
        }
    }
}
