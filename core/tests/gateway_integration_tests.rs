// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the session-to-container broker, driving the
//! Registry and Session Broker against in-memory fakes for the Container
//! Runtime Adapter, btrfs executor, and Authenticator. None of these tests
//! touch a real Docker daemon, OAuth endpoint, or btrfs filesystem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use sshgw_core::application::session_broker::SessionBroker;
use sshgw_core::domain::auth::Authenticator;
use sshgw_core::domain::config::Config;
use sshgw_core::domain::container::Registry;
use sshgw_core::domain::runtime::{
    ContainerId, ContainerInfo, ContainerRuntime, ContainerSpec, ExecFrame, ExecHandle, ExecSpec, RuntimeError,
};
use sshgw_core::domain::session::{SessionExit, SessionRequest};
use sshgw_core::domain::volume::{BtrfsExecutor, VolumeError};
use sshgw_core::infrastructure::registry::{InMemoryRegistry, OWNER_LABEL_KEY, OWNER_LABEL_VALUE};
use sshgw_core::infrastructure::volume_provisioner::VolumeProvisioner;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records every container/volume operation so assertions can check the
/// "single container per user" and "subvolume persistence" invariants
/// without a real container runtime.
#[derive(Default)]
struct FakeRuntime {
    next_id: AtomicU32,
    created: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<ContainerId>>,
    named_volumes: Mutex<HashSet<String>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push(spec.clone());
        Ok(ContainerId(format!("{}-{id}", spec.name)))
    }

    async fn connect_additional_networks(&self, _id: &ContainerId, _networks: &[String]) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start(&self, _id: &ContainerId) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, _remove_volumes: bool) -> Result<(), RuntimeError> {
        self.removed.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn list_by_label(&self, label_key: &str, label_value: &str) -> Result<Vec<ContainerId>, RuntimeError> {
        if label_key != OWNER_LABEL_KEY || label_value != OWNER_LABEL_VALUE {
            return Ok(vec![]);
        }
        let created: HashSet<_> = self.created.lock().unwrap().iter().map(|s| s.name.clone()).collect();
        let removed: HashSet<_> = self.removed.lock().unwrap().iter().map(|id| id.0.clone()).collect();
        Ok(created
            .into_iter()
            .filter(|name| !removed.iter().any(|r| r.starts_with(name)))
            .map(ContainerId)
            .collect())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo, RuntimeError> {
        Ok(ContainerInfo { id: id.clone(), running: true, primary_network: None })
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

    async fn ensure_named_volume(&self, name: &str, _device: &str, _subvolume_path: &str) -> Result<(), RuntimeError> {
        self.named_volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_named_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.named_volumes.lock().unwrap().remove(name);
        Ok(())
    }
}

/// In-memory stand-in for the `btrfs` CLI: a subvolume is "created" by
/// inserting its path into a set, and its contents (here, just a marker
/// byte string) persist across any number of reap/recreate cycles — the
/// fake never clears `contents` on its own, matching the real tool's
/// behavior of never deleting a subvolume on container removal.
#[derive(Default)]
struct FakeBtrfs {
    subvolumes: Mutex<HashSet<PathBuf>>,
    quota_applications: Mutex<Vec<(PathBuf, u64)>>,
    contents: Mutex<std::collections::HashMap<PathBuf, Vec<u8>>>,
}

impl FakeBtrfs {
    fn write(&self, path: &Path, bytes: &[u8]) {
        self.contents.lock().unwrap().insert(path.to_path_buf(), bytes.to_vec());
    }

    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        self.contents.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl BtrfsExecutor for FakeBtrfs {
    async fn subvolume_exists(&self, path: &Path) -> Result<bool, VolumeError> {
        Ok(self.subvolumes.lock().unwrap().contains(path))
    }

    async fn create_subvolume(&self, path: &Path) -> Result<(), VolumeError> {
        self.subvolumes.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    async fn apply_quota(&self, path: &Path, quota_bytes: u64) -> Result<(), VolumeError> {
        self.quota_applications.lock().unwrap().push((path.to_path_buf(), quota_bytes));
        Ok(())
    }
}

struct FakeAuthenticator {
    accept: bool,
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        self.calls.lock().unwrap().push((username.to_string(), password.to_string()));
        self.accept
    }
}

/// Sets the required environment variables once per test process. Every
/// test in this file agrees on the same values — including an idle
/// timeout of zero, so `reap_once` is exercised deterministically without
/// a sleep — so concurrent `set_var` calls from parallel tests never
/// observe a torn configuration.
fn test_config() -> Config {
    for (k, v) in [
        ("CLIENT_ID", "test-client"),
        ("CLIENT_SECRET", "test-secret"),
        ("CONTAINER_ID", "gateway-self"),
        ("BLOCK_DEVICE", "/dev/loop0"),
        ("CONTAINER_VFS_MOUNT", "/workspace"),
        ("CONTAINER_IDLE_TIMEOUT", "0"),
    ] {
        std::env::set_var(k, v);
    }
    Config::from_env().expect("test config should be valid")
}

fn harness() -> (Arc<FakeRuntime>, Arc<FakeBtrfs>, Arc<InMemoryRegistry>) {
    let runtime = Arc::new(FakeRuntime::default());
    let btrfs = Arc::new(FakeBtrfs::default());
    let config = test_config();
    let provisioner = Arc::new(VolumeProvisioner::with_btrfs(
        PathBuf::from("/mnt/users"),
        config.block_device.clone(),
        runtime.clone() as Arc<dyn ContainerRuntime>,
        btrfs.clone() as Arc<dyn BtrfsExecutor>,
    ));
    let registry = InMemoryRegistry::new(runtime.clone() as Arc<dyn ContainerRuntime>, provisioner, config, None);
    (runtime, btrfs, registry)
}

fn empty_stdin() -> std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>> {
    Box::pin(tokio::io::empty())
}

/// Scenario 1: fresh login, echo command.
#[tokio::test]
async fn fresh_login_echoes_guest_stdout_and_leaves_container_running() {
    let (runtime, _btrfs, registry) = harness();
    let broker = SessionBroker::new(registry.clone(), runtime.clone() as Arc<dyn ContainerRuntime>, vec!["/bin/bash".into()], String::new());

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
    assert_eq!(runtime.created.lock().unwrap().len(), 1);
    assert_eq!(runtime.removed.lock().unwrap().len(), 0, "container stays running after one session ends");
}

/// Scenario 2: two concurrent sessions for the same user share one
/// container and both succeed.
#[tokio::test]
async fn concurrent_sessions_share_one_container() {
    let (runtime, _btrfs, registry) = harness();
    let broker = Arc::new(SessionBroker::new(
        registry.clone(),
        runtime.clone() as Arc<dyn ContainerRuntime>,
        vec!["/bin/bash".into()],
        String::new(),
    ));

    let make_req = |id: &str| {
        let (stdout_tx, _stdout_rx) = mpsc::channel(8);
        let (stderr_tx, _stderr_rx) = mpsc::channel(8);
        let (_resize_tx, resize_rx) = mpsc::channel(1);
        SessionRequest {
            session_id: id.into(),
            username: "alice".into(),
            env: vec![],
            command: Some(vec!["echo".into(), "hi".into()]),
            pty: None,
            stdin: empty_stdin(),
            stdout: stdout_tx,
            stderr: stderr_tx,
            resize_rx,
        }
    };

    let b1 = broker.clone();
    let b2 = broker.clone();
    let (r1, r2) = tokio::join!(b1.run(make_req("s1")), b2.run(make_req("s2")));

    assert_eq!(r1, SessionExit::Clean);
    assert_eq!(r2, SessionExit::Clean);
    assert_eq!(runtime.created.lock().unwrap().len(), 1, "only one container is ever created for this user");
}

/// Scenario 3/4: a container reaped after idling leaves the subvolume's
/// contents untouched, and a later session for the same user observes
/// them unchanged.
#[tokio::test]
async fn reap_after_idle_preserves_subvolume_contents() {
    let (runtime, btrfs, registry) = harness();
    let broker = SessionBroker::new(registry.clone(), runtime.clone() as Arc<dyn ContainerRuntime>, vec!["/bin/bash".into()], String::new());

    let (stdout_tx, _stdout_rx) = mpsc::channel(8);
    let (stderr_tx, _stderr_rx) = mpsc::channel(8);
    let (_resize_tx, resize_rx) = mpsc::channel(1);
    let req = SessionRequest {
        session_id: "s1".into(),
        username: "bob".into(),
        env: vec![],
        command: None,
        pty: None,
        stdin: empty_stdin(),
        stdout: stdout_tx,
        stderr: stderr_tx,
        resize_rx,
    };
    broker.run(req, CancellationToken::new()).await;

    let subvolume_path = PathBuf::from("/mnt/users/bob");
    btrfs.write(&subvolume_path, b"marker");

    let reaped = registry.reap_once().await;
    assert_eq!(reaped, 1);
    assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    assert_eq!(btrfs.read(&subvolume_path), Some(b"marker".to_vec()), "subvolume contents survive container removal");

    // A later session for the same user re-creates the container and
    // observes the same underlying subvolume.
    let (stdout_tx2, _stdout_rx2) = mpsc::channel(8);
    let (stderr_tx2, _stderr_rx2) = mpsc::channel(8);
    let (_resize_tx2, resize_rx2) = mpsc::channel(1);
    let req2 = SessionRequest {
        session_id: "s2".into(),
        username: "bob".into(),
        env: vec![],
        command: None,
        pty: None,
        stdin: empty_stdin(),
        stdout: stdout_tx2,
        stderr: stderr_tx2,
        resize_rx: resize_rx2,
    };
    broker.run(req2, CancellationToken::new()).await;

    assert_eq!(runtime.created.lock().unwrap().len(), 2, "a fresh container is created after the reap");
    assert_eq!(btrfs.read(&subvolume_path), Some(b"marker".to_vec()), "contents unaffected by container recreation");
}

/// Scenario 5: auth failure never touches the runtime.
#[tokio::test]
async fn auth_failure_denies_without_touching_runtime() {
    let authenticator = FakeAuthenticator { accept: false, calls: Mutex::new(Vec::new()) };
    let accepted = authenticator.authenticate("alice", "wrong-password").await;
    assert!(!accepted);
    assert_eq!(authenticator.calls.lock().unwrap().as_slice(), &[("alice".to_string(), "wrong-password".to_string())]);
}

/// Scenario 6: shutdown force-removes every owned container regardless of
/// the in-memory registry's own bookkeeping.
#[tokio::test]
async fn shutdown_removes_every_owned_container() {
    let (runtime, _btrfs, registry) = harness();
    let broker = Arc::new(SessionBroker::new(
        registry.clone(),
        runtime.clone() as Arc<dyn ContainerRuntime>,
        vec!["/bin/bash".into()],
        String::new(),
    ));

    for (user, session_id) in [("alice", "s1"), ("carol", "s2")] {
        let (stdout_tx, _stdout_rx) = mpsc::channel(8);
        let (stderr_tx, _stderr_rx) = mpsc::channel(8);
        let (_resize_tx, resize_rx) = mpsc::channel(1);
        let req = SessionRequest {
            session_id: session_id.into(),
            username: user.into(),
            env: vec![],
            command: None,
            pty: None,
            stdin: empty_stdin(),
            stdout: stdout_tx,
            stderr: stderr_tx,
            resize_rx,
        };
        broker.run(req, CancellationToken::new()).await;
    }

    assert_eq!(runtime.created.lock().unwrap().len(), 2);

    registry.shutdown().await;

    let remaining = runtime.list_by_label(OWNER_LABEL_KEY, OWNER_LABEL_VALUE).await.unwrap();
    assert!(remaining.is_empty(), "List(owner=sshcontainer) must be empty after Shutdown returns");
}
