// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential model shared by every source: the persisted store, the Gemini
//! CLI credential file, and the Application Default Credentials file.
//!
//! Each source normalizes into the same [`Credential`] shape and is tagged
//! with its [`SourceKind`], so precedence lives in one place ([`merge`]).

pub mod merge;
pub mod source;
pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Provider id under which the broker persists its credential.
pub const PROVIDER_ID: &str = "google";

/// Refresh-token prefix marking a credential that cannot be refreshed.
pub const ACCESS_ONLY_PREFIX: &str = "access-only:";

/// A normalized OAuth credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// Refresh token, or an [`ACCESS_ONLY_PREFIX`] sentinel.
    pub refresh: String,
    /// Absolute deadline in epoch milliseconds. `0` means unknown.
    #[serde(rename = "expiresAt", default)]
    pub expires_at: u64,
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret", default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(rename = "quotaProjectID", default, skip_serializing_if = "Option::is_none")]
    pub quota_project_id: Option<String>,
}

impl Credential {
    /// Credential with a usable access token but no genuine refresh token.
    pub fn access_only(access: String, expires_at: u64) -> Self {
        Self {
            access: Some(access),
            refresh: format!("{ACCESS_ONLY_PREFIX}{}", epoch_ms()),
            expires_at,
            client_id: None,
            client_secret: None,
            quota_project_id: None,
        }
    }

    pub fn is_refreshable(&self) -> bool {
        is_refreshable(&self.refresh)
    }

    pub fn has_access(&self) -> bool {
        self.access.as_deref().is_some_and(|a| !a.is_empty())
    }

    /// True when the access token is missing or at/after its deadline.
    pub fn needs_refresh(&self, now_ms: u64) -> bool {
        !self.has_access() || self.expires_at <= now_ms
    }

    /// Copy of this credential carrying a freshly issued access token.
    pub fn renewed(&self, access: String, expires_at: u64) -> Self {
        Self { access: Some(access), expires_at, ..self.clone() }
    }
}

/// Whether a refresh token can be sent to the token endpoint.
pub fn is_refreshable(refresh: &str) -> bool {
    !refresh.is_empty() && !refresh.starts_with(ACCESS_ONLY_PREFIX)
}

/// Where a credential was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// The broker's own store.
    Persisted,
    /// The Gemini CLI's `oauth_creds.json`.
    ExternalFile,
    /// gcloud Application Default Credentials.
    Adc,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persisted => "persisted",
            Self::ExternalFile => "external-file",
            Self::Adc => "adc",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedCredential {
    pub kind: SourceKind,
    pub credential: Credential,
}

impl SourcedCredential {
    pub fn new(kind: SourceKind, credential: Credential) -> Self {
        Self { kind, credential }
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
