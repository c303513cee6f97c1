// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Daemon Lifecycle (C9): startup wiring, signal handling, shutdown.
//!
//! Startup order: tracing init -> `Config::from_env` -> Docker connect ->
//! volume provisioner -> registry (spawns the reaper) -> SSH front-end
//! bind. Only configuration and runtime-construction errors here are
//! fatal; everything past the bind runs until a signal asks it to stop.

mod ssh_server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sshgw_core::domain::config::Config;
use sshgw_core::infrastructure::docker_runtime::DockerRuntime;
use sshgw_core::infrastructure::oauth_authenticator::OAuthAuthenticator;
use sshgw_core::infrastructure::registry::InMemoryRegistry;
use sshgw_core::infrastructure::volume_provisioner::VolumeProvisioner;
use sshgw_core::domain::runtime::ContainerRuntime;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn init_logging(log_level: u8) -> Result<()> {
    let directive = match log_level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_new(directive).context("invalid LOG_LEVEL directive")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Config is resolved fully, synchronously, before any `await`.
    let config = Config::from_env().context("failed to load configuration")?;
    init_logging(config.log_level)?;
    info!(%config, "starting ssh-container gateway");

    let runtime = Arc::new(DockerRuntime::connect().context("failed to connect to container runtime")?);
    runtime.healthcheck().await.context("container runtime healthcheck failed")?;

    let self_id = sshgw_core::domain::runtime::ContainerId(config.container_id.clone());
    let self_info = ContainerRuntime::inspect(runtime.as_ref(), &self_id)
        .await
        .context("failed to inspect the gateway's own container")?;
    if let Some(network) = &self_info.primary_network {
        info!(network, "discovered gateway's own primary network, new user containers will join it");
    }
    let gateway_network = self_info.primary_network.clone();

    let mount = PathBuf::from(&config.container_vfs_mount);
    let provisioner = Arc::new(VolumeProvisioner::new(mount, config.block_device.clone(), runtime.clone()));

    let authenticator = Arc::new(OAuthAuthenticator::new(
        config.oauth_endpoint.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
    ));

    let registry = InMemoryRegistry::new(runtime.clone(), provisioner, config.clone(), gateway_network);

    // Cancelling this unblocks every live session's reader pump (child
    // tokens observe a parent's cancellation), so sessions can release
    // their registry entries instead of being `abort()`-ed mid-exec.
    let shutdown_token = CancellationToken::new();

    let front_end = ssh_server::SshFrontEnd::bind(
        &config,
        authenticator,
        registry.clone(),
        runtime.clone(),
        shutdown_token.clone(),
    )
    .await
    .context("failed to bind SSH front-end")?;

    let server_task = tokio::spawn(async move { front_end.serve().await });

    shutdown_signal().await;
    info!("shutdown signal received, draining sessions");
    shutdown_token.cancel();
    registry.shutdown().await;
    server_task.abort();

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
