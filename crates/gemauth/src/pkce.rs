// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth authorization code + PKCE (RFC 7636) helpers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use reqwest::Url;
use sha2::{Digest, Sha256};

pub const SCOPE_CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const SCOPE_USERINFO_EMAIL: &str = "https://www.googleapis.com/auth/userinfo.email";
pub const SCOPE_USERINFO_PROFILE: &str = "https://www.googleapis.com/auth/userinfo.profile";
/// Requested only when the extra-scope toggle is on.
pub const SCOPE_GENERATIVE_LANGUAGE: &str =
    "https://www.googleapis.com/auth/generative-language.retriever";

/// Verifier/challenge pair for one authorization attempt.
#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub verifier: String,
    pub challenge: String,
}

impl PkceCodes {
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = compute_code_challenge(&verifier);
        Self { verifier, challenge }
    }
}

/// Fresh 43-char verifier from 32 bytes of OS-seeded randomness.
pub fn generate_code_verifier() -> String {
    random_token()
}

/// S256 transform: unpadded base64url of the verifier's SHA-256.
pub fn compute_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Opaque anti-forgery `state`, independent of the verifier.
pub fn generate_state() -> String {
    random_token()
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Scopes requested at authorization time.
pub fn scopes(extra_scope: bool) -> Vec<&'static str> {
    let mut scopes = vec![SCOPE_CLOUD_PLATFORM, SCOPE_USERINFO_EMAIL, SCOPE_USERINFO_PROFILE];
    if extra_scope {
        scopes.push(SCOPE_GENERATIVE_LANGUAGE);
    }
    scopes
}

/// Build the full authorization URL.
///
/// `access_type=offline` asks for a refresh token and `prompt=consent`
/// forces one to be issued again on repeat logins.
pub fn build_auth_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[&str],
    code_challenge: &str,
    state: &str,
) -> anyhow::Result<String> {
    let scope = scopes.join(" ");
    let url = Url::parse_with_params(
        auth_url,
        &[
            ("access_type", "offline"),
            ("client_id", client_id),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
            ("prompt", "consent"),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
        ],
    )?;
    Ok(url.into())
}

#[cfg(test)]
#[path = "pkce_tests.rs"]
mod tests;
