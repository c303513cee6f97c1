// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! OAuth2 password-grant authentication (C7).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("OAuth endpoint returned a non-200 status")]
    Denied,
    #[error("transport error reaching OAuth endpoint: {0}")]
    Transport(String),
}

/// Authenticates a username/password pair against an external OAuth2
/// password-grant endpoint. No caching: every call hits the endpoint.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> bool;
}
