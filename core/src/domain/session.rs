// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Ephemeral per-session state (C6). A [`SessionRequest`] is constructed by
//! whatever accepts SSH channels (outside this crate) and handed to the
//! session broker; it does not persist beyond one session.

use std::pin::Pin;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error piping session stream: {0}")]
    Io(String),
    #[error(transparent)]
    Runtime(#[from] crate::domain::runtime::RuntimeError),
}

/// Initial terminal geometry for a PTY session.
#[derive(Debug, Clone, Copy)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// A window-change notification forwarded from the SSH channel.
pub type ResizeEvent = WindowSize;

/// Everything the session broker needs to know about one incoming session,
/// supplied by the SSH front-end.
pub struct SessionRequest {
    pub session_id: String,
    pub username: String,
    pub env: Vec<String>,
    pub command: Option<Vec<String>>,
    pub pty: Option<WindowSize>,
    /// Bytes typed by the client, in order.
    pub stdin: Pin<Box<dyn AsyncRead + Send>>,
    /// Guest stdout bytes are pushed here, in order.
    pub stdout: mpsc::Sender<Vec<u8>>,
    /// Guest stderr bytes are pushed here, in order (non-PTY sessions only).
    pub stderr: mpsc::Sender<Vec<u8>>,
    pub resize_rx: mpsc::Receiver<ResizeEvent>,
}

/// Outcome reported back to the SSH channel once a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Clean,
    Error,
}

impl SessionExit {
    pub fn code(self) -> u32 {
        match self {
            SessionExit::Clean => 0,
            SessionExit::Error => 1,
        }
    }
}
