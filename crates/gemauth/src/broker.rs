// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auth broker: owns the callback listener, the store, and the HTTP client,
//! and exposes the connect, import, status, and fetch operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::callback::CallbackListener;
use crate::config::BrokerConfig;
use crate::credential::merge::best_external;
use crate::credential::source::{external_sources, read_all, ExternalSource};
use crate::credential::store::{CredentialStore, FileStore};
use crate::credential::{
    epoch_ms, Credential, SourceKind, SourcedCredential, ACCESS_ONLY_PREFIX, PROVIDER_ID,
};
use crate::error::AuthError;
use crate::fetch::{ApiRequest, ApiResponse, AuthenticatedFetch};
use crate::health::{check_health, required_scopes, HealthStatus};
use crate::pkce::{build_auth_url, generate_state, scopes, PkceCodes};
use crate::token::TokenClient;

/// How often `import_external` re-reads the external files.
pub const IMPORT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

pub const LOGIN_INSTRUCTIONS: &str =
    "Complete sign-in in your browser. The redirect back to this machine is detected automatically.";
pub const IMPORT_INSTRUCTIONS: &str = "Run `gemini` and finish Google login (or run \
     `gcloud auth application-default login`), then wait here while the credential is imported.";

/// Per-attempt authorization state. Lives in memory only and is consumed by
/// [`AuthBroker::callback`].
#[derive(Debug, Clone)]
pub struct AuthorizationSession {
    pub state: String,
    pub verifier: String,
    pub challenge: String,
    pub client_id: String,
    pub redirect_uri: String,
}

/// Result of starting a connect.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    pub instructions: &'static str,
    pub session: AuthorizationSession,
}

/// Snapshot of the credential the broker would use right now.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    pub has_access_token: bool,
    pub refreshable: bool,
    pub expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_project_id: Option<String>,
    /// Token-info verdict, when there is an access token to check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
}

impl StatusReport {
    fn disconnected() -> Self {
        Self {
            connected: false,
            source: None,
            has_access_token: false,
            refreshable: false,
            expired: true,
            expires_in_secs: None,
            quota_project_id: None,
            health: None,
        }
    }
}

/// Google OAuth credential broker.
pub struct AuthBroker<S> {
    config: BrokerConfig,
    store: Arc<S>,
    http: reqwest::Client,
    tokens: TokenClient,
    listener: CallbackListener,
    fetch: AuthenticatedFetch<S>,
}

impl AuthBroker<FileStore> {
    /// Broker over the JSON file store at the configured path.
    pub fn from_config(config: BrokerConfig) -> anyhow::Result<Self> {
        let store = FileStore::new(config.store_path());
        Self::new(config, store)
    }
}

impl<S: CredentialStore> AuthBroker<S> {
    /// Broker reading the external sources named by `config`.
    pub fn new(config: BrokerConfig, store: S) -> anyhow::Result<Self> {
        let sources = external_sources(&config);
        Self::with_sources(config, store, sources)
    }

    /// Broker with an explicit, ordered external source list.
    pub fn with_sources(
        config: BrokerConfig,
        store: S,
        sources: Vec<ExternalSource>,
    ) -> anyhow::Result<Self> {
        let http = crate::http_client()?;
        let store = Arc::new(store);
        let tokens = TokenClient::new(http.clone(), &config);
        let fetch = AuthenticatedFetch::new(
            http.clone(),
            tokens.clone(),
            Arc::clone(&store),
            sources,
            config.simulate_expiry,
        );
        let listener = CallbackListener::new(config.port_min, config.port_max);
        Ok(Self { config, store, http, tokens, listener, fetch })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn listener(&self) -> &CallbackListener {
        &self.listener
    }

    /// Start a connect: bind the listener and build a single-use
    /// authorization URL. Any codes left over from earlier attempts are
    /// dropped.
    pub async fn authorize(&self) -> anyhow::Result<Authorization> {
        let redirect_uri = self.listener.start().await?;
        self.listener.clear().await;

        let pkce = PkceCodes::generate();
        let state = generate_state();
        let client_id = self.config.default_client_id().to_owned();
        let url = build_auth_url(
            &self.config.auth_url,
            &client_id,
            &redirect_uri,
            &scopes(self.config.extra_scope),
            &pkce.challenge,
            &state,
        )?;
        info!(%redirect_uri, "authorization started");

        Ok(Authorization {
            url,
            instructions: LOGIN_INSTRUCTIONS,
            session: AuthorizationSession {
                state,
                verifier: pkce.verifier,
                challenge: pkce.challenge,
                client_id,
                redirect_uri,
            },
        })
    }

    /// Finish a connect: wait for the redirect, exchange the code, and
    /// persist the credential.
    pub async fn callback(&self, session: AuthorizationSession) -> anyhow::Result<Credential> {
        let code =
            self.listener.wait_for_code(&session.state, self.config.callback_timeout()).await?;
        let external = read_all(self.fetch.sources()).await;
        let external_secret =
            best_external(&external).and_then(|found| found.credential.client_secret.as_deref());
        let token = self
            .tokens
            .exchange(
                &code,
                &session.redirect_uri,
                &session.verifier,
                &session.client_id,
                external_secret,
            )
            .await?;

        let mut credential = Credential {
            access: Some(token.access_token.clone()),
            refresh: String::new(),
            expires_at: token.expires_at(),
            client_id: Some(session.client_id),
            client_secret: None,
            quota_project_id: None,
        };
        match token.refresh_token.filter(|r| !r.is_empty()) {
            Some(refresh) => credential.refresh = refresh,
            None => adopt_external_refresh(&mut credential, &external),
        }

        match self.check(&token.access_token).await {
            HealthStatus::Ok => {}
            HealthStatus::ScopeMissing(missing) => {
                warn!(missing = %missing.join(" "), "new token lacks required scopes")
            }
            other => warn!(health = %other, "could not validate new token"),
        }

        self.store.set(PROVIDER_ID, credential.clone()).await?;
        info!(refreshable = credential.is_refreshable(), "login complete");
        Ok(credential)
    }

    /// Import a credential from the Gemini CLI file or ADC, waiting for one
    /// to appear, then refresh/validate it and persist it.
    pub async fn import_external(&self) -> anyhow::Result<Credential> {
        let found = self.wait_for_external().await?;
        let kind = found.kind;
        let mut credential = found.credential;

        if credential.needs_refresh(epoch_ms()) {
            credential = self.renew_import(&credential, kind).await?;
        }
        let access = credential.access.clone().unwrap_or_default();
        match self.check(&access).await {
            HealthStatus::Ok => {}
            HealthStatus::TokenExpired => {
                debug!(source = %kind, "imported token rejected; refreshing again");
                credential = self.renew_import(&credential, kind).await?;
            }
            other => warn!(source = %kind, health = %other, "imported token not fully validated"),
        }

        self.store.set(PROVIDER_ID, credential.clone()).await?;
        info!(source = %kind, "imported external credential");
        Ok(credential)
    }

    async fn wait_for_external(&self) -> anyhow::Result<SourcedCredential> {
        let deadline = Instant::now() + self.config.import_wait();
        loop {
            let found = read_all(self.fetch.sources()).await;
            if let Some(best) = best_external(&found) {
                return Ok(best.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AuthError::ImportTimeout.into());
            }
            tokio::time::sleep(IMPORT_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn renew_import(
        &self,
        credential: &Credential,
        kind: SourceKind,
    ) -> anyhow::Result<Credential> {
        self.tokens
            .refresh_credential(credential)
            .await
            .ok_or_else(|| anyhow::anyhow!("could not refresh the imported {kind} credential"))
    }

    /// Send `request` with the freshest credential, refreshing and
    /// recovering as needed.
    pub async fn fetch(&self, request: &ApiRequest) -> anyhow::Result<ApiResponse> {
        self.fetch.execute(request).await
    }

    /// The credential a request would start from right now.
    pub async fn resolve(&self) -> anyhow::Result<Option<SourcedCredential>> {
        self.fetch.resolve().await
    }

    pub async fn status(&self) -> anyhow::Result<StatusReport> {
        let Some(active) = self.resolve().await? else {
            return Ok(StatusReport::disconnected());
        };
        let cred = &active.credential;
        let now = epoch_ms();
        let health = match cred.access.as_deref().filter(|a| !a.is_empty()) {
            Some(access) => Some(self.check(access).await.to_string()),
            None => None,
        };
        Ok(StatusReport {
            connected: true,
            source: Some(active.kind),
            has_access_token: cred.has_access(),
            refreshable: cred.is_refreshable(),
            expired: cred.needs_refresh(now),
            expires_in_secs: (cred.expires_at > now).then(|| (cred.expires_at - now) / 1000),
            quota_project_id: cred.quota_project_id.clone(),
            health,
        })
    }

    /// Stop the callback listener.
    pub async fn stop(&self) {
        self.listener.stop().await;
    }

    async fn check(&self, access: &str) -> HealthStatus {
        check_health(
            &self.http,
            &self.config.token_info_url,
            access,
            &required_scopes(self.config.extra_scope),
        )
        .await
    }
}

/// No refresh token came back: borrow the best external one, or mark the
/// credential access-only.
fn adopt_external_refresh(credential: &mut Credential, external: &[SourcedCredential]) {
    match best_external(external) {
        Some(found) => {
            debug!(source = %found.kind, "reusing external refresh token");
            credential.refresh = found.credential.refresh.clone();
            credential.client_id = found.credential.client_id.clone();
            credential.client_secret = found.credential.client_secret.clone();
            credential.quota_project_id = found.credential.quota_project_id.clone();
        }
        None => {
            debug!("no refresh token available; storing access-only credential");
            credential.refresh = format!("{ACCESS_ONLY_PREFIX}{}", epoch_ms());
        }
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
