// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gemauth: Google OAuth (PKCE) credential broker.
//!
//! Obtains, persists, refreshes, and imports Google OAuth credentials and
//! injects them into outbound API requests through [`broker::AuthBroker`].

pub mod broker;
pub mod callback;
pub mod config;
pub mod credential;
pub mod error;
pub mod fetch;
pub mod health;
pub mod pkce;
pub mod token;

use std::sync::Once;
use std::time::Duration;

static CRYPTO_INIT: Once = Once::new();

/// Per-request timeout for provider and upstream calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Install the ring crypto provider for reqwest/rustls.
/// Only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Shared HTTP client for token, token-info, and API calls.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    ensure_crypto();
    Ok(reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?)
}
