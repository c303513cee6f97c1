// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Per-session orchestration (C6): acquire a container, open an exec, pump
//! bytes in both directions, forward resize events, release on every exit
//! path. The broker never calls `Remove` directly — container lifetime is
//! owned solely by the registry.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Instrument};

use crate::domain::container::Registry;
use crate::domain::runtime::{ContainerId, ContainerRuntime, ExecFrame, ExecSpec};
use crate::domain::session::{ResizeEvent, SessionExit, SessionRequest, WindowSize};

const READ_CHUNK: usize = 8192;

pub struct SessionBroker {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    default_command: Vec<String>,
    guest_user: String,
}

impl SessionBroker {
    pub fn new(
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        default_command: Vec<String>,
        guest_user: String,
    ) -> Self {
        Self { registry, runtime, default_command, guest_user }
    }

    /// Runs one session to completion: steps 1-6 of the design. Always
    /// releases the registry entry on the way out, regardless of how the
    /// session ended. `cancel` is the session's context: it is cancelled
    /// when the SSH channel closes or the daemon shuts down, either of
    /// which unblocks the reader pump even if the guest never produces
    /// output or EOF.
    pub async fn run(&self, req: SessionRequest, cancel: CancellationToken) -> SessionExit {
        let span = tracing::info_span!("session", user = %req.username, session_id = %req.session_id);
        self.run_inner(req, cancel).instrument(span).await
    }

    async fn run_inner(&self, req: SessionRequest, cancel: CancellationToken) -> SessionExit {
        let SessionRequest { username, env, command, pty, stdin, stdout, stderr, resize_rx, .. } = req;

        let container_id = match self.registry.acquire(&username, &env).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "failed to acquire container");
                return SessionExit::Error;
            }
        };

        let exit = self
            .run_exec(&container_id, env, command, pty, stdin, stdout, stderr, resize_rx, cancel)
            .await;

        self.registry.release(&username).await;
        exit
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_exec(
        &self,
        container_id: &ContainerId,
        env: Vec<String>,
        command: Option<Vec<String>>,
        pty: Option<WindowSize>,
        mut stdin: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
        mut resize_rx: mpsc::Receiver<ResizeEvent>,
        cancel: CancellationToken,
    ) -> SessionExit {
        let cmd = command.unwrap_or_else(|| self.default_command.clone());
        let spec = ExecSpec { user: self.guest_user.clone(), tty: pty.is_some(), env, cmd };

        let handle = match self.runtime.exec(container_id, spec).await {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "failed to open exec");
                return SessionExit::Error;
            }
        };
        let exec_id = handle.exec_id;
        let mut output = handle.output;
        let mut input = handle.input;

        if let Some(size) = pty {
            if let Err(e) = self.runtime.resize_exec(&exec_id, size.rows, size.cols).await {
                warn!(error = %e, "initial resize failed");
            }
        }

        // `cancel` doubles as the coordination token for all three pumps:
        // the caller cancels it when the SSH channel closes or the daemon
        // shuts down, which unblocks the reader pump below exactly like a
        // guest EOF would; the reader pump additionally cancels it once it
        // finishes on its own, to stop the writer and resize forwarder.
        let token = cancel;
        let is_tty = pty.is_some();

        // Reader pump: guest -> client. Terminates on guest EOF, error, or
        // external cancellation (channel close / daemon shutdown).
        let reader_token = token.clone();
        let reader = async move {
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => return Ok(()),
                    frame = output.next() => {
                        match frame {
                            Some(Ok(ExecFrame::Stdout(bytes))) => {
                                if stdout.send(bytes).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Some(Ok(ExecFrame::Stderr(bytes))) => {
                                // TTY sessions only ever see a flat stdout stream.
                                let target = if is_tty { &stdout } else { &stderr };
                                if target.send(bytes).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Some(Err(e)) => return Err(e.to_string()),
                            None => return Ok(()),
                        }
                    }
                }
            }
        };

        // Writer pump: client -> guest. Half-closes the write side on
        // client EOF so the guest observes EOF on its stdin.
        let writer_token = token.clone();
        let writer = async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    n = stdin.read(&mut buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if input.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            let _ = input.shutdown().await;
        };

        // Resize forwarder: logs and continues on transient errors.
        let resize_token = token.clone();
        let runtime = Arc::clone(&self.runtime);
        let resize_exec_id = exec_id.clone();
        let resizer = async move {
            loop {
                tokio::select! {
                    _ = resize_token.cancelled() => break,
                    event = resize_rx.recv() => {
                        match event {
                            Some(size) => {
                                if let Err(e) = runtime.resize_exec(&resize_exec_id, size.rows, size.cols).await {
                                    warn!(error = %e, "resize failed, continuing");
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        };

        let writer_handle = tokio::spawn(writer);
        let resizer_handle = tokio::spawn(resizer);

        // Wait for the reader pump; it is the one that observes guest EOF,
        // a pump error, or the shared token's cancellation (SSH channel
        // close or daemon shutdown, wired in by the caller).
        let reader_result = reader.await;

        token.cancel();
        let _ = writer_handle.await;
        resizer_handle.abort();

        match reader_result {
            Ok(()) => SessionExit::Clean,
            Err(e) => {
                error!(error = %e, "stream pump failed");
                SessionExit::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::RegistryError;
    use crate::domain::runtime::{ContainerInfo, ExecHandle, RuntimeError};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;
    use tokio::io::AsyncRead;

    struct FakeRegistry {
        container_id: ContainerId,
        acquired: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn acquire(&self, user: &str, _env: &[String]) -> Result<ContainerId, RegistryError> {
            self.acquired.lock().unwrap().push(user.to_string());
            Ok(self.container_id.clone())
        }
        async fn release(&self, user: &str) {
            self.released.lock().unwrap().push(user.to_string());
        }
        async fn reap_once(&self) -> usize {
            0
        }
        async fn shutdown(&self) {}
    }

    struct FakeRuntime;

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create(&self, _spec: crate::domain::runtime::ContainerSpec) -> Result<ContainerId, RuntimeError> {
            unimplemented!()
        }
        async fn connect_additional_networks(&self, _id: &ContainerId, _networks: &[String]) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn start(&self, _id: &ContainerId) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn remove(&self, _id: &ContainerId, _remove_volumes: bool) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn list_by_label(&self, _k: &str, _v: &str) -> Result<Vec<ContainerId>, RuntimeError> {
            unimplemented!()
        }
        async fn inspect(&self, _id: &ContainerId) -> Result<ContainerInfo, RuntimeError> {
            unimplemented!()
        }
        async fn exec(&self, _id: &ContainerId, _spec: ExecSpec) -> Result<ExecHandle, RuntimeError> {
            let frames = vec![Ok(ExecFrame::Stdout(b"hello\n".to_vec()))];
            Ok(ExecHandle {
                exec_id: "exec-1".into(),
                output: Box::pin(stream::iter(frames)),
                input: Box::pin(tokio::io::sink()),
            })
        }
        async fn resize_exec(&self, _exec_id: &str, _rows: u16, _cols: u16) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn ensure_named_volume(&self, _name: &str, _device: &str, _subvolume_path: &str) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn remove_named_volume(&self, _name: &str) -> Result<(), RuntimeError> {
            unimplemented!()
        }
    }

    /// A guest that never produces output and never closes its stream —
    /// stands in for a silent, long-running process.
    struct SilentRuntime;

    #[async_trait]
    impl ContainerRuntime for SilentRuntime {
        async fn create(&self, _spec: crate::domain::runtime::ContainerSpec) -> Result<ContainerId, RuntimeError> {
            unimplemented!()
        }
        async fn connect_additional_networks(&self, _id: &ContainerId, _networks: &[String]) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn start(&self, _id: &ContainerId) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn remove(&self, _id: &ContainerId, _remove_volumes: bool) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn list_by_label(&self, _k: &str, _v: &str) -> Result<Vec<ContainerId>, RuntimeError> {
            unimplemented!()
        }
        async fn inspect(&self, _id: &ContainerId) -> Result<ContainerInfo, RuntimeError> {
            unimplemented!()
        }
        async fn exec(&self, _id: &ContainerId, _spec: ExecSpec) -> Result<ExecHandle, RuntimeError> {
            Ok(ExecHandle {
                exec_id: "exec-silent".into(),
                output: Box::pin(stream::pending()),
                input: Box::pin(tokio::io::sink()),
            })
        }
        async fn resize_exec(&self, _exec_id: &str, _rows: u16, _cols: u16) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn ensure_named_volume(&self, _name: &str, _device: &str, _subvolume_path: &str) -> Result<(), RuntimeError> {
            unimplemented!()
        }
        async fn remove_named_volume(&self, _name: &str) -> Result<(), RuntimeError> {
            unimplemented!()
        }
    }

    fn empty_stdin() -> std::pin::Pin<Box<dyn AsyncRead + Send>> {
        Box::pin(tokio::io::empty())
    }

    #[tokio::test]
    async fn echoes_guest_stdout_and_reports_clean_exit() {
        let registry = Arc::new(FakeRegistry {
            container_id: ContainerId("sshcontainer-alice".into()),
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        });
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime);
        let broker = SessionBroker::new(registry.clone(), runtime, vec!["/bin/bash".into()], String::new());

        let (stdout_tx, mut stdout_rx) = mpsc::channel(8);
        let (stderr_tx, _stderr_rx) = mpsc::channel(8);
        let (_resize_tx, resize_rx) = mpsc::channel(1);

        let req = SessionRequest {
            session_id: "s1".into(),
            username: "alice".into(),
            env: vec![],
            command: Some(vec!["echo".into(), "hello".into()]),
            pty: None,
            stdin: empty_stdin(),
            stdout: stdout_tx,
            stderr: stderr_tx,
            resize_rx,
        };

        let exit = broker.run(req, CancellationToken::new()).await;
        assert_eq!(exit, SessionExit::Clean);
        assert_eq!(stdout_rx.recv().await, Some(b"hello\n".to_vec()));
        assert_eq!(registry.acquired.lock().unwrap().as_slice(), &["alice".to_string()]);
        assert_eq!(registry.released.lock().unwrap().as_slice(), &["alice".to_string()]);
    }

    /// A client that disconnects while the guest is silent must still have
    /// its registry entry released: cancelling the session's token has to
    /// unblock the reader pump on its own, without any guest output or EOF.
    #[tokio::test]
    async fn cancellation_unblocks_a_silent_reader_pump_and_releases_the_registry() {
        let registry = Arc::new(FakeRegistry {
            container_id: ContainerId("sshcontainer-alice".into()),
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        });
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(SilentRuntime);
        let broker = Arc::new(SessionBroker::new(registry.clone(), runtime, vec!["/bin/bash".into()], String::new()));

        let (stdout_tx, _stdout_rx) = mpsc::channel(8);
        let (stderr_tx, _stderr_rx) = mpsc::channel(8);
        let (_resize_tx, resize_rx) = mpsc::channel(1);

        let req = SessionRequest {
            session_id: "s1".into(),
            username: "alice".into(),
            env: vec![],
            command: None,
            pty: None,
            stdin: empty_stdin(),
            stdout: stdout_tx,
            stderr: stderr_tx,
            resize_rx,
        };

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { broker.run(req, run_cancel).await });

        // Give the session a moment to block inside the reader pump before
        // simulating the SSH channel closing.
        tokio::task::yield_now().await;
        cancel.cancel();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("cancellation must unblock the reader pump promptly")
            .unwrap();
        assert_eq!(exit, SessionExit::Clean);
        assert_eq!(registry.released.lock().unwrap().as_slice(), &["alice".to_string()]);
    }
}
