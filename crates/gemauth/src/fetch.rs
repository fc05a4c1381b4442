// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated fetch: every upstream API call goes through here.
//!
//! Per request:
//! 1. resolve the freshest credential (persisted store merged with sources);
//! 2. refresh first if the access token is missing or expired, persisting it;
//! 3. strip caller auth (`authorization`, `x-goog-api-key`, `?key=`) and
//!    inject the bearer token plus quota project;
//! 4. on 401, refresh once and retry once, or hand back the 401;
//! 5. on a 403 scope error, walk the recovery sources in order, refreshing
//!    and retrying with each until a retry is not itself a scope error;
//! 6. anything else is returned untouched.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode, Url};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credential::merge::merge;
use crate::credential::source::{read_all, read_persisted, ExternalSource};
use crate::credential::store::CredentialStore;
use crate::credential::{epoch_ms, Credential, SourcedCredential, PROVIDER_ID};
use crate::token::TokenClient;

/// Lowercased body marker of Google's "insufficient scope" 403.
pub const SCOPE_ERROR_MARKER: &str = "insufficient authentication scopes";

pub const API_KEY_HEADER: &str = "x-goog-api-key";
pub const USER_PROJECT_HEADER: &str = "x-goog-user-project";

/// A fully buffered outbound request, replayable for retries.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url, headers: HeaderMap::new(), body: None }
    }

    pub fn parse(method: Method, url: &str) -> anyhow::Result<Self> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A fully buffered response. Buffering lets the scope check read the body
/// and still hand the same response back.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A 403 whose body says the token lacks a required OAuth scope.
pub fn is_scope_error(response: &ApiResponse) -> bool {
    response.status == StatusCode::FORBIDDEN
        && response.text().to_lowercase().contains(SCOPE_ERROR_MARKER)
}

/// Copy of `request` authenticated with `credential`.
pub fn prepare(request: &ApiRequest, credential: &Credential) -> anyhow::Result<ApiRequest> {
    let mut prepared = request.clone();
    prepared.headers.remove(AUTHORIZATION);
    prepared.headers.remove(API_KEY_HEADER);
    strip_key_param(&mut prepared.url);

    if let Some(access) = credential.access.as_deref().filter(|a| !a.is_empty()) {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {access}"))?;
        bearer.set_sensitive(true);
        prepared.headers.insert(AUTHORIZATION, bearer);
    }
    if let Some(project) = credential.quota_project_id.as_deref() {
        prepared.headers.insert(USER_PROJECT_HEADER, HeaderValue::from_str(project)?);
    }
    Ok(prepared)
}

fn strip_key_param(url: &mut Url) {
    if !url.query_pairs().any(|(k, _)| k == "key") {
        return;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| *k != "key")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }
}

/// The request-time state machine described in the module docs.
pub struct AuthenticatedFetch<S> {
    http: reqwest::Client,
    tokens: TokenClient,
    store: Arc<S>,
    /// External sources: merged into resolution, and the ordered recovery
    /// chain for scope errors.
    sources: Vec<ExternalSource>,
    force_expiry: bool,
    refresh_lock: Mutex<()>,
}

impl<S: CredentialStore> AuthenticatedFetch<S> {
    pub fn new(
        http: reqwest::Client,
        tokens: TokenClient,
        store: Arc<S>,
        sources: Vec<ExternalSource>,
        force_expiry: bool,
    ) -> Self {
        Self { http, tokens, store, sources, force_expiry, refresh_lock: Mutex::new(()) }
    }

    pub fn sources(&self) -> &[ExternalSource] {
        &self.sources
    }

    /// Freshest credential across the store and every external source.
    pub async fn resolve(&self) -> anyhow::Result<Option<SourcedCredential>> {
        let persisted = read_persisted(self.store.as_ref()).await?;
        let external = read_all(&self.sources).await;
        Ok(merge(persisted, &external))
    }

    pub async fn execute(&self, request: &ApiRequest) -> anyhow::Result<ApiResponse> {
        let Some(active) = self.resolve().await? else {
            debug!("no credential available; sending request unauthenticated");
            return self.send(request).await;
        };
        debug!(source = %active.kind, "resolved credential");

        let mut credential = active.credential;
        if self.force_expiry || credential.needs_refresh(epoch_ms()) {
            match self.renew(&credential).await? {
                Some(renewed) => credential = renewed,
                None => warn!(source = %active.kind, "proactive refresh failed; using current token"),
            }
        }

        let mut response = self.send(&prepare(request, &credential)?).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            let Some(renewed) = self.renew(&credential).await? else {
                debug!("refresh after 401 failed; returning original response");
                return Ok(response);
            };
            info!("retrying request after 401 with refreshed token");
            response = self.send(&prepare(request, &renewed)?).await?;
        }

        if is_scope_error(&response) {
            return self.recover_scope(request, response).await;
        }
        Ok(response)
    }

    /// Refresh and persist, serialized so concurrent requests share one
    /// refresh instead of racing on the same refresh token.
    async fn renew(&self, stale: &Credential) -> anyhow::Result<Option<Credential>> {
        let _guard = self.refresh_lock.lock().await;
        if !self.force_expiry {
            if let Some(current) = self.store.get(PROVIDER_ID).await? {
                let renewed_meanwhile = current.refresh == stale.refresh
                    && current.access != stale.access
                    && !current.needs_refresh(epoch_ms());
                if renewed_meanwhile {
                    return Ok(Some(current));
                }
            }
        }
        let Some(renewed) = self.tokens.refresh_credential(stale).await else {
            return Ok(None);
        };
        self.store.set(PROVIDER_ID, renewed.clone()).await?;
        Ok(Some(renewed))
    }

    async fn recover_scope(
        &self,
        request: &ApiRequest,
        original: ApiResponse,
    ) -> anyhow::Result<ApiResponse> {
        warn!("upstream rejected token scopes; trying external credentials");
        for source in &self.sources {
            let Some(found) = source.read().await else {
                continue;
            };
            if !found.credential.is_refreshable() {
                continue;
            }
            let Some(renewed) = self.tokens.refresh_credential(&found.credential).await else {
                debug!(source = %found.kind, "refresh with external credential failed");
                continue;
            };
            self.store.set(PROVIDER_ID, renewed.clone()).await?;
            info!(source = %found.kind, "retrying request with imported credential");

            let retried = self.send(&prepare(request, &renewed)?).await?;
            if !is_scope_error(&retried) {
                return Ok(retried);
            }
        }
        Ok(original)
    }

    async fn send(&self, request: &ApiRequest) -> anyhow::Result<ApiResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(ApiResponse { status, headers, body })
    }
}

#[cfg(test)]
#[path = "fetch_tests.rs"]
mod tests;
