// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token liveness and scope check against the token-info endpoint.

use std::fmt;

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::pkce::{SCOPE_CLOUD_PLATFORM, SCOPE_GENERATIVE_LANGUAGE};

/// Verdict of a health check. Expired and under-scoped tokens recover
/// differently (refresh vs. re-consent or import), so they stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    /// Non-2xx from token-info: revoked, expired, or malformed.
    TokenExpired,
    /// Live token lacking these scopes.
    ScopeMissing(Vec<String>),
    /// The endpoint could not be reached.
    Unreachable(String),
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::TokenExpired => "token_expired",
            Self::ScopeMissing(_) => "scope_missing",
            Self::Unreachable(_) => "unreachable",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeMissing(scopes) => write!(f, "scope_missing ({})", scopes.join(" ")),
            Self::Unreachable(msg) => write!(f, "unreachable ({msg})"),
            other => f.write_str(other.reason()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    scope: String,
}

/// Scopes an access token must carry.
pub fn required_scopes(extra_scope: bool) -> Vec<&'static str> {
    let mut scopes = vec![SCOPE_CLOUD_PLATFORM];
    if extra_scope {
        scopes.push(SCOPE_GENERATIVE_LANGUAGE);
    }
    scopes
}

/// GET `<token_info_url>?access_token=...` and classify the answer.
pub async fn check_health(
    http: &reqwest::Client,
    token_info_url: &str,
    access_token: &str,
    required: &[&str],
) -> HealthStatus {
    let url = match Url::parse_with_params(token_info_url, &[("access_token", access_token)]) {
        Ok(url) => url,
        Err(e) => return HealthStatus::Unreachable(e.to_string()),
    };
    let resp = match http.get(url).send().await {
        Ok(resp) => resp,
        Err(e) => return HealthStatus::Unreachable(e.to_string()),
    };
    if !resp.status().is_success() {
        debug!(status = %resp.status(), "token-info rejected access token");
        return HealthStatus::TokenExpired;
    }

    // A 2xx without a parsable scope list grants nothing.
    let info: TokenInfo = resp.json().await.unwrap_or_default();
    let granted: Vec<&str> = info.scope.split_whitespace().collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|scope| !granted.contains(*scope))
        .map(|scope| (*scope).to_owned())
        .collect();
    if missing.is_empty() {
        HealthStatus::Ok
    } else {
        debug!(missing = missing.len(), "access token lacks required scopes");
        HealthStatus::ScopeMissing(missing)
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
