// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! The per-user container registry's domain types (C5): the mapping from
//! username to live container handle, refcounted across concurrent
//! sessions, reaped once idle.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::runtime::{ContainerId, RuntimeError};
use crate::domain::volume::VolumeError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// In-memory state for one user's live container. Invariants (enforced by
/// the registry, not this type): the refcount is incremented before any
/// exec is opened and decremented exactly once when that exec's session
/// ends; removal only happens while the entry's mutex is held and the
/// refcount is zero; `last_used` is refreshed on every acquire and release.
#[derive(Debug, Clone)]
pub struct UserContainerState {
    pub container_id: ContainerId,
    pub refcount: u32,
    pub last_used: Instant,
}

impl UserContainerState {
    pub fn new(container_id: ContainerId) -> Self {
        Self { container_id, refcount: 1, last_used: Instant::now() }
    }

    pub fn acquire(&mut self) {
        self.refcount += 1;
        self.last_used = Instant::now();
    }

    /// Decrements, floored at zero, and refreshes `last_used` regardless.
    pub fn release(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
        self.last_used = Instant::now();
    }

    pub fn is_idle(&self) -> bool {
        self.refcount == 0
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Public contract for the registry, expressed as a trait so an in-memory
/// implementation and a test fake are interchangeable (see design notes).
#[async_trait]
pub trait Registry: Send + Sync {
    /// Returns the live container id for `user`, creating one if absent.
    /// `env` is accepted for symmetry with the session broker's call site
    /// but is never baked into the container — it is only ever threaded
    /// through the exec call that follows.
    async fn acquire(&self, user: &str, env: &[String]) -> Result<ContainerId, RegistryError>;

    /// Decrements the refcount for `user`, if an entry exists. Never
    /// removes the entry — only the reaper does that.
    async fn release(&self, user: &str);

    /// Scans for idle, timed-out entries and removes them. Returns the
    /// number of entries removed. Individual removal failures are logged
    /// and swallowed; this never returns an error.
    async fn reap_once(&self) -> usize;

    /// Stops the reaper and force-removes every container carrying the
    /// ownership label, regardless of what the in-memory map still holds.
    async fn shutdown(&self);
}
