// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential source readers.
//!
//! External files belong to other tools: they are only ever read. A missing,
//! unreadable, or malformed file is the same as "no credential".

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::credential::store::CredentialStore;
use crate::credential::{Credential, SourceKind, SourcedCredential, PROVIDER_ID};

/// Gemini CLI `oauth_creds.json`.
#[derive(Debug, Default, Deserialize)]
struct CliCreds {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    expiry_date: Option<serde_json::Number>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

/// gcloud `application_default_credentials.json`.
#[derive(Debug, Default, Deserialize)]
struct AdcCreds {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    quota_project_id: Option<String>,
}

/// An external, tool-owned credential source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalSource {
    /// Ordered candidate paths; the first usable file wins.
    GeminiCli(Vec<PathBuf>),
    /// A single ADC file.
    Adc(Option<PathBuf>),
}

impl ExternalSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::GeminiCli(_) => SourceKind::ExternalFile,
            Self::Adc(_) => SourceKind::Adc,
        }
    }

    pub async fn read(&self) -> Option<SourcedCredential> {
        let credential = match self {
            Self::GeminiCli(paths) => read_cli_file(paths).await,
            Self::Adc(path) => read_adc_file(path.as_deref()?).await,
        }?;
        Some(SourcedCredential::new(self.kind(), credential))
    }
}

/// External sources in fallback order: Gemini CLI file, then ADC.
pub fn external_sources(config: &BrokerConfig) -> Vec<ExternalSource> {
    vec![ExternalSource::GeminiCli(config.creds_paths()), ExternalSource::Adc(config.adc_path())]
}

/// Read every source, keeping the ones that produced a credential.
pub async fn read_all(sources: &[ExternalSource]) -> Vec<SourcedCredential> {
    let mut found = Vec::with_capacity(sources.len());
    for source in sources {
        if let Some(cred) = source.read().await {
            found.push(cred);
        }
    }
    found
}

/// Read the broker's own credential.
pub async fn read_persisted<S: CredentialStore>(
    store: &S,
) -> anyhow::Result<Option<SourcedCredential>> {
    let stored = store.get(PROVIDER_ID).await?;
    Ok(stored.map(|c| SourcedCredential::new(SourceKind::Persisted, c)))
}

async fn read_cli_file(paths: &[PathBuf]) -> Option<Credential> {
    for path in paths {
        let Some(creds) = read_json::<CliCreds>(path).await else {
            continue;
        };
        if let Some(cred) = normalize_cli(creds) {
            debug!(path = %path.display(), "found Gemini CLI credentials");
            return Some(cred);
        }
    }
    None
}

async fn read_adc_file(path: &Path) -> Option<Credential> {
    let creds = read_json::<AdcCreds>(path).await?;
    let cred = normalize_adc(creds);
    if cred.is_some() {
        debug!(path = %path.display(), "found authorized_user ADC credentials");
    }
    cred
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&data) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(path = %path.display(), "ignoring unparsable credential file: {e}");
            None
        }
    }
}

fn normalize_cli(creds: CliCreds) -> Option<Credential> {
    let access = creds.access_token.filter(|s| !s.is_empty());
    let refresh = creds.refresh_token.filter(|s| !s.is_empty());
    let expires_at = creds.expiry_date.as_ref().and_then(number_to_ms).unwrap_or(0);

    let mut cred = match (access, refresh) {
        (None, None) => return None,
        (Some(access), None) => Credential::access_only(access, expires_at),
        (access, Some(refresh)) => Credential {
            access,
            refresh,
            expires_at,
            client_id: None,
            client_secret: None,
            quota_project_id: None,
        },
    };
    cred.client_id = creds.client_id;
    cred.client_secret = creds.client_secret;
    Some(cred)
}

fn normalize_adc(creds: AdcCreds) -> Option<Credential> {
    if creds.kind.as_deref() != Some("authorized_user") {
        return None;
    }
    let refresh = creds.refresh_token.filter(|s| !s.is_empty())?;
    Some(Credential {
        access: None,
        refresh,
        expires_at: 0,
        client_id: creds.client_id,
        client_secret: creds.client_secret,
        quota_project_id: creds.quota_project_id,
    })
}

fn number_to_ms(n: &serde_json::Number) -> Option<u64> {
    n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

#[cfg(test)]
#[path = "source_tests.rs"]
mod tests;
