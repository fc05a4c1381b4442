// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token endpoint calls: authorization-code exchange and refresh.
//!
//! Neither call is retried here. Exchange failures carry status and body;
//! refresh failures collapse to `None` because callers have a fallback chain.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::credential::{epoch_ms, is_refreshable, Credential};
use crate::error::AuthError;

/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Standard OAuth2 token response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry in epoch milliseconds.
    pub fn expires_at(&self) -> u64 {
        expires_at_from(self.expires_in)
    }
}

/// Result of a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewedToken {
    pub access: String,
    pub expires_at: u64,
    /// Set only when the provider rotated the refresh token.
    pub refresh: Option<String>,
}

/// `now + expires_in * 1000`, defaulting to one hour. Saturates on absurd
/// lifetimes from the provider.
pub fn expires_at_from(expires_in: Option<u64>) -> u64 {
    let lifetime_ms = expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).saturating_mul(1000);
    epoch_ms().saturating_add(lifetime_ms)
}

/// Client for the provider's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    token_url: String,
    default_client_id: String,
    client_secret: Option<String>,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, config: &BrokerConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            default_client_id: config.default_client_id().to_owned(),
            client_secret: config.client_secret.clone(),
        }
    }

    /// Exchange an authorization code for tokens (form body).
    pub async fn exchange(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> anyhow::Result<TokenResponse> {
        let secret = client_secret.or(self.client_secret.as_deref());
        let mut form = vec![
            ("code", code),
            ("client_id", client_id),
            ("code_verifier", code_verifier),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(secret) = secret {
            form.push(("client_secret", secret));
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| AuthError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Exchange { status: status.as_u16(), body }.into());
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|_| AuthError::Exchange { status: status.as_u16(), body })?;
        info!(has_refresh = token.refresh_token.is_some(), "authorization code exchanged");
        Ok(token)
    }

    /// Renew an access token.
    ///
    /// Returns `None` without any network call for access-only sentinels, and
    /// `None` on transport errors, non-2xx answers, or unparsable bodies.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Option<RenewedToken> {
        if !is_refreshable(refresh_token) {
            debug!("skipping refresh of non-refreshable credential");
            return None;
        }
        let client_id = client_id.unwrap_or(&self.default_client_id);
        let secret = client_secret.or(self.client_secret.as_deref());
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];
        if let Some(secret) = secret {
            form.push(("client_secret", secret));
        }

        let resp = match self.http.post(&self.token_url).form(&form).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(err = %e, "token refresh request failed");
                return None;
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, body = %text, "token refresh rejected");
            return None;
        }
        let token: TokenResponse = match resp.json().await {
            Ok(token) => token,
            Err(e) => {
                warn!(err = %e, "unparsable refresh response");
                return None;
            }
        };
        if token.access_token.is_empty() {
            return None;
        }

        debug!(expires_in = ?token.expires_in, "access token refreshed");
        Some(RenewedToken {
            expires_at: token.expires_at(),
            access: token.access_token,
            refresh: token.refresh_token.filter(|r| !r.is_empty()),
        })
    }

    /// Refresh `credential` with its own client, returning the renewed copy.
    pub async fn refresh_credential(&self, credential: &Credential) -> Option<Credential> {
        let renewed = self
            .refresh(
                &credential.refresh,
                credential.client_id.as_deref(),
                credential.client_secret.as_deref(),
            )
            .await?;
        let mut updated = credential.renewed(renewed.access, renewed.expires_at);
        if let Some(rotated) = renewed.refresh {
            updated.refresh = rotated;
        }
        Some(updated)
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
