// Copyright (c) 2026 SSH Container Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

//! OAuth2 password-grant `Authenticator` (C7), built on `reqwest::Client`.
//! The password is moved straight into the form body and never logged.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::auth::Authenticator;

pub struct OAuthAuthenticator {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
}

impl OAuthAuthenticator {
    pub fn new(endpoint: String, client_id: String, client_secret: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, client_id, client_secret }
    }
}

#[async_trait]
impl Authenticator for OAuthAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];

        let response = match self.client.post(&self.endpoint).form(&form).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "oauth endpoint unreachable");
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            debug!(username, status = %response.status(), "oauth login denied");
            return false;
        }

        true
    }
}
