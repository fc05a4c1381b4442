// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loopback HTTP listener receiving the OAuth browser redirect.
//!
//! The handler records `state -> code` and wakes waiters directly; nothing
//! polls. A "most recent code" slot covers redirects that drop or rewrite
//! `state`. Consuming it clears every pending entry, so one listener serves
//! one in-flight authorization at a time. A provider error redirect registers
//! no code but fails the current wait instead of letting it time out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AuthError;

pub const CALLBACK_PATH: &str = "/auth/callback";

const SUCCESS_TEXT: &str = "Authorization successful. You can close this tab.";
const FAILURE_TEXT: &str = "Authorization failed. You can close this tab.";

#[derive(Debug, Default)]
struct Pending {
    codes: HashMap<String, String>,
    latest: Option<String>,
    denied: Option<AuthError>,
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl Shared {
    async fn deliver(&self, state: String, code: String) {
        let mut pending = self.pending.lock().await;
        pending.codes.insert(state, code.clone());
        pending.latest = Some(code);
        drop(pending);
        self.notify.notify_waiters();
    }

    async fn deny(&self, error: String, description: Option<String>) {
        let denial = AuthError::AuthorizationDenied { error, description };
        self.pending.lock().await.denied = Some(denial);
        self.notify.notify_waiters();
    }

    /// Exact `state` match first, then the most recent code (clearing all),
    /// then a recorded denial.
    async fn take(&self, state: &str) -> Option<Result<String, AuthError>> {
        let mut pending = self.pending.lock().await;
        if let Some(code) = pending.codes.remove(state) {
            if pending.latest.as_deref() == Some(code.as_str()) {
                pending.latest = None;
            }
            return Some(Ok(code));
        }
        if let Some(latest) = pending.latest.take() {
            pending.codes.clear();
            pending.denied = None;
            debug!("callback state mismatch; using most recent code");
            return Some(Ok(latest));
        }
        pending.denied.take().map(Err)
    }
}

struct Running {
    addr: SocketAddr,
    redirect_uri: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Local callback server bound to the first free port of a range.
pub struct CallbackListener {
    port_min: u16,
    port_max: u16,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl CallbackListener {
    /// A listener for the inclusive range `port_min..=port_max`. Nothing is
    /// bound until [`start`](Self::start).
    pub fn new(port_min: u16, port_max: u16) -> Self {
        Self { port_min, port_max, shared: Arc::default(), running: Mutex::new(None) }
    }

    /// Bind and serve, returning the redirect URI. Idempotent.
    pub async fn start(&self) -> anyhow::Result<String> {
        let mut running = self.running.lock().await;
        if let Some(ref r) = *running {
            return Ok(r.redirect_uri.clone());
        }

        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let redirect_uri = format!("http://127.0.0.1:{}{CALLBACK_PATH}", addr.port());

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
            .with_state(Arc::clone(&self.shared));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(err = %e, "callback server exited with error");
            }
        });

        info!(port = addr.port(), "OAuth callback listener started");
        *running = Some(Running { addr, redirect_uri: redirect_uri.clone(), shutdown, task });
        Ok(redirect_uri)
    }

    async fn bind(&self) -> anyhow::Result<TcpListener> {
        for port in self.port_min..=self.port_max {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!(port, err = %e, "callback port unavailable"),
            }
        }
        Err(AuthError::PortRangeExhausted { min: self.port_min, max: self.port_max }.into())
    }

    /// Shut the server down and wait for it to exit. No-op when stopped.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.task.await {
            warn!(err = %e, "callback server task failed");
        }
        info!(port = running.addr.port(), "OAuth callback listener stopped");
    }

    /// Redirect URI of the running server, if any.
    pub async fn redirect_uri(&self) -> Option<String> {
        self.running.lock().await.as_ref().map(|r| r.redirect_uri.clone())
    }

    /// Bound address of the running server, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Drop every pending code.
    pub async fn clear(&self) {
        let mut pending = self.shared.pending.lock().await;
        pending.codes.clear();
        pending.latest = None;
        pending.denied = None;
    }

    /// Record a code as if the browser had delivered it.
    pub async fn deliver(&self, state: &str, code: &str) {
        self.shared.deliver(state.to_owned(), code.to_owned()).await;
    }

    /// Wait for the code matching `state` (or the most recent code).
    ///
    /// Fails with [`AuthError::CallbackTimeout`] once `timeout` elapses, or
    /// [`AuthError::AuthorizationDenied`] if the provider redirected with an
    /// error. Either way the caller must restart from a fresh URL.
    pub async fn wait_for_code(&self, state: &str, timeout: Duration) -> anyhow::Result<String> {
        let wait = async {
            loop {
                // Register interest before checking so a delivery in between
                // still wakes us.
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(outcome) = self.shared.take(state).await {
                    return outcome;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AuthError::CallbackTimeout.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn handle_callback(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    if let Some(error) = params.error.filter(|e| !e.is_empty()) {
        warn!(%error, "authorization denied by provider");
        let description = params.error_description.filter(|d| !d.is_empty());
        let text = description.clone().unwrap_or_else(|| FAILURE_TEXT.to_owned());
        shared.deny(error, description).await;
        return (StatusCode::BAD_REQUEST, text);
    }
    let code = params.code.filter(|c| !c.is_empty());
    let state = params.state.filter(|s| !s.is_empty());
    let (Some(code), Some(state)) = (code, state) else {
        return (StatusCode::BAD_REQUEST, FAILURE_TEXT.to_owned());
    };
    shared.deliver(state, code).await;
    debug!("authorization code received");
    (StatusCode::OK, SUCCESS_TEXT.to_owned())
}

#[cfg(test)]
#[path = "callback_tests.rs"]
mod tests;
