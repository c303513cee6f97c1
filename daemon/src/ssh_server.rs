// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! SSH Front-End (C8): the crate's only `russh` seam. One [`GatewayHandler`]
//! is constructed per incoming TCP connection, per russh's handler model.
//! It holds references to the shared authenticator and session broker and
//! turns channel/session requests into calls on the broker.
//!
//! Everything outside the password-auth, session and pty/resize paths is
//! denied per the gateway's scope: sftp is acknowledged then immediately
//! closed with exit 0 (a quiet no-op rather than a hard protocol error, so
//! well-behaved clients degrade gracefully); port forwarding, agent
//! forwarding, X11 and public-key auth are all refused.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Config as RusshConfig, Handler, Msg, Server as RusshServer, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::KeyPair;
use sshgw_core::application::session_broker::SessionBroker;
use sshgw_core::domain::auth::Authenticator;
use sshgw_core::domain::config::Config as GatewayConfig;
use sshgw_core::domain::container::Registry;
use sshgw_core::domain::runtime::ContainerRuntime;
use sshgw_core::domain::session::{SessionExit, SessionRequest, WindowSize};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const STDIN_PIPE_CAPACITY: usize = 64 * 1024;

/// Per-channel state held between `channel_open_session` and whichever of
/// `shell_request`/`exec_request` arrives next, plus whatever is still
/// needed after the session starts (the stdin pipe's write half and the
/// resize sender).
struct ChannelState {
    stdin_writer: DuplexStream,
    resize_tx: mpsc::Sender<WindowSize>,
    pty: Option<WindowSize>,
    /// `VAR=value` pairs accumulated from `env` channel requests sent
    /// before the shell/exec request; forwarded verbatim into the exec
    /// spec (never baked into the container itself, per the registry's
    /// acquire contract).
    env: Vec<String>,
    /// This channel's session context: a child of the daemon's shutdown
    /// token. Cancelled explicitly on `channel_close` so a client
    /// disconnecting while the guest is silent still unblocks the
    /// broker's reader pump; cancelled implicitly when the daemon shuts
    /// down, since a child token observes its parent's cancellation.
    cancel: CancellationToken,
    /// Taken by `spawn_session` the first time a shell/exec request
    /// arrives; `None` afterward (and for any later request on the same
    /// channel, which is refused).
    pending: Option<(DuplexStream, mpsc::Receiver<WindowSize>)>,
}

pub struct GatewayHandler {
    authenticator: Arc<dyn Authenticator>,
    broker: Arc<SessionBroker>,
    shutdown: CancellationToken,
    username: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

#[async_trait]
impl Handler for GatewayHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.authenticator.authenticate(user, password).await {
            info!(user, "authentication succeeded");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            warn!(user, "authentication denied");
            Ok(Auth::Reject { proceed_with_methods: None })
        }
    }

    async fn auth_publickey(&mut self, user: &str, _key: &russh_keys::key::PublicKey) -> Result<Auth, Self::Error> {
        warn!(user, "public-key auth attempted, denied (password-only gateway)");
        Ok(Auth::Reject { proceed_with_methods: None })
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, session: &mut Session) -> Result<bool, Self::Error> {
        let (writer, reader) = tokio::io::duplex(STDIN_PIPE_CAPACITY);
        let (resize_tx, resize_rx) = mpsc::channel(4);
        let cancel = self.shutdown.child_token();
        self.channels.insert(
            channel.id(),
            ChannelState { stdin_writer: writer, resize_tx, pty: None, env: Vec::new(), cancel, pending: Some((reader, resize_rx)) },
        );
        let _ = session;
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.env.push(format!("{variable_name}={variable_value}"));
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty = Some(WindowSize { rows: row_height as u16, cols: col_width as u16 });
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            let _ = state.resize_tx.send(WindowSize { rows: row_height as u16, cols: col_width as u16 }).await;
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.spawn_session(channel, None, session).await
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let command_line = String::from_utf8_lossy(data).to_string();
        let command = shell_words_split(&command_line);
        self.spawn_session(channel, Some(command), session).await
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            let _ = state.stdin_writer.write_all(data).await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            let _ = state.stdin_writer.shutdown().await;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            // Unblocks the broker's reader pump even if the guest is
            // silent and never produces output or EOF on its own.
            state.cancel.cancel();
        }
        Ok(())
    }

    async fn subsystem_request(&mut self, channel: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        warn!(name, "subsystem request denied, closing channel with a clean exit");
        session.channel_success(channel);
        session.exit_status_request(channel, 0);
        session.close(channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!("direct-tcpip channel requested, denied (port forwarding is out of scope)");
        Ok(false)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        warn!(address, port = *port, "tcpip-forward requested, denied");
        Ok(false)
    }

    async fn cancel_tcpip_forward(&mut self, _address: &str, _port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn x11_request(
        &mut self,
        _channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!("X11 forwarding requested, denied (no-op)");
        Ok(())
    }
}

impl GatewayHandler {
    async fn spawn_session(
        &mut self,
        channel: ChannelId,
        command: Option<Vec<String>>,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let username = match &self.username {
            Some(u) => u.clone(),
            None => {
                warn!("session request before successful authentication");
                session.close(channel);
                return Ok(());
            }
        };

        let (reader, resize_rx, pty, env, cancel) = match self.channels.get_mut(&channel) {
            Some(state) => match state.pending.take() {
                Some((reader, resize_rx)) => {
                    (reader, resize_rx, state.pty, std::mem::take(&mut state.env), state.cancel.clone())
                }
                None => {
                    warn!("duplicate shell/exec request on one channel, denied");
                    session.close(channel);
                    return Ok(());
                }
            },
            None => {
                warn!("session request on an unknown channel");
                session.close(channel);
                return Ok(());
            }
        };

        let (stdout_tx, mut stdout_rx) = mpsc::channel::<Vec<u8>>(32);
        let (stderr_tx, mut stderr_rx) = mpsc::channel::<Vec<u8>>(32);

        let handle = session.handle();
        let channel_id = channel;

        let stdout_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stdout_rx.recv().await {
                if stdout_handle.data(channel_id, CryptoVec::from(chunk)).await.is_err() {
                    break;
                }
            }
        });
        let stderr_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stderr_rx.recv().await {
                if stderr_handle.extended_data(channel_id, 1, CryptoVec::from(chunk)).await.is_err() {
                    break;
                }
            }
        });

        let req = SessionRequest {
            session_id: Uuid::new_v4().to_string(),
            username,
            env,
            command,
            pty,
            stdin: Box::pin(reader),
            stdout: stdout_tx,
            stderr: stderr_tx,
            resize_rx,
        };

        let broker = Arc::clone(&self.broker);
        let exit_handle = handle.clone();
        tokio::spawn(async move {
            let exit = broker.run(req, cancel).await;
            let code = match exit {
                SessionExit::Clean => 0,
                SessionExit::Error => 1,
            };
            let _ = exit_handle.exit_status_request(channel_id, code).await;
            let _ = exit_handle.eof(channel_id).await;
            let _ = exit_handle.close(channel_id).await;
        });

        session.channel_success(channel);
        Ok(())
    }
}

/// Splits an SSH `exec` command line into argv the way a POSIX shell would
/// for the simple cases this gateway needs: whitespace-separated tokens
/// with single/double-quoted segments kept intact.
fn shell_words_split(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub struct SshFrontEnd {
    russh_config: Arc<RusshConfig>,
    bind_addr: String,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    default_command: Vec<String>,
    guest_user: String,
    shutdown: CancellationToken,
}

impl SshFrontEnd {
    pub async fn bind(
        config: &GatewayConfig,
        authenticator: Arc<dyn Authenticator>,
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let key_pair = load_host_key(&config.ssh_host_key).await?;
        let russh_config = Arc::new(RusshConfig { keys: vec![key_pair], ..Default::default() });
        Ok(Self {
            russh_config,
            bind_addr: format!("0.0.0.0:{}", config.ssh_port),
            authenticator,
            registry,
            runtime,
            default_command: config.container_cmd.clone(),
            guest_user: config.container_user.clone(),
            shutdown,
        })
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        info!(addr = %self.bind_addr, "ssh front-end listening");
        let mut server = SshFrontEndServer {
            authenticator: self.authenticator,
            registry: self.registry,
            runtime: self.runtime,
            default_command: self.default_command,
            guest_user: self.guest_user,
            shutdown: self.shutdown,
        };
        russh::server::run(self.russh_config, &self.bind_addr, &mut server)
            .await
            .map_err(|e| anyhow::anyhow!("ssh server loop failed: {e}"))
    }
}

struct SshFrontEndServer {
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    default_command: Vec<String>,
    guest_user: String,
    shutdown: CancellationToken,
}

impl RusshServer for SshFrontEndServer {
    type Handler = GatewayHandler;

    fn new_client(&mut self, peer_addr: Option<std::net::SocketAddr>) -> GatewayHandler {
        if let Some(addr) = peer_addr {
            info!(%addr, "accepted ssh connection");
        }
        let broker = Arc::new(SessionBroker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.runtime),
            self.default_command.clone(),
            self.guest_user.clone(),
        ));
        GatewayHandler {
            authenticator: Arc::clone(&self.authenticator),
            broker,
            shutdown: self.shutdown.child_token(),
            username: None,
            channels: HashMap::new(),
        }
    }
}

/// Loads the PEM host key at `path`. A missing or unreadable key aborts
/// startup (spec §4.2 lists the host key path among the fields whose
/// absence is fatal) rather than silently minting a fresh identity on
/// every restart.
async fn load_host_key(path: &std::path::Path) -> anyhow::Result<KeyPair> {
    use anyhow::Context;

    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        anyhow::bail!("SSH host key not found at {}", path.display());
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read SSH host key at {}", path.display()))?;
    let text = std::str::from_utf8(&bytes).context("SSH host key file is not valid UTF-8 PEM")?;
    russh_keys::decode_secret_key(text, None).context("failed to decode SSH host key")
}
