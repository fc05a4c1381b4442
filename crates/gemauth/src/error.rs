// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Errors the broker surfaces to callers that need to branch on them.
///
/// Everything else travels as `anyhow::Error`; these are recovered with
/// `err.downcast_ref::<AuthError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No port in the configured callback range could be bound.
    PortRangeExhausted { min: u16, max: u16 },
    /// The browser redirect did not arrive before the deadline.
    CallbackTimeout,
    /// The provider redirected back with `error=...`.
    AuthorizationDenied { error: String, description: Option<String> },
    /// The token endpoint answered with a non-2xx status.
    Exchange { status: u16, body: String },
    /// The token endpoint could not be reached or returned garbage.
    Transport(String),
    /// No credential exists in any source.
    NotConnected,
    /// No external credential appeared while waiting for an import.
    ImportTimeout,
}

impl AuthError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortRangeExhausted { .. } => "PORT_RANGE_EXHAUSTED",
            Self::CallbackTimeout => "CALLBACK_TIMEOUT",
            Self::AuthorizationDenied { .. } => "AUTHORIZATION_DENIED",
            Self::Exchange { .. } => "EXCHANGE_FAILED",
            Self::Transport(_) => "TRANSPORT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ImportTimeout => "IMPORT_TIMEOUT",
        }
    }

    /// What the user should do next.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::PortRangeExhausted { .. } => {
                "free a port in the callback range or configure a different range"
            }
            Self::CallbackTimeout | Self::AuthorizationDenied { .. } | Self::Exchange { .. } => {
                "run the login again and open the new link; old links cannot be reused"
            }
            Self::Transport(_) => "check network connectivity and retry",
            Self::NotConnected => "run `gemauth login` or `gemauth import` first",
            Self::ImportTimeout => {
                "run `gemini` (or `gcloud auth application-default login`), then retry the import"
            }
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortRangeExhausted { min, max } => {
                write!(f, "unable to start local OAuth callback server on ports {min}-{max}")
            }
            Self::CallbackTimeout => f.write_str("OAuth login timed out waiting for the browser"),
            Self::AuthorizationDenied { error, description } => match description {
                Some(desc) => write!(f, "authorization failed: {error}: {desc}"),
                None => write!(f, "authorization failed: {error}"),
            },
            Self::Exchange { status, body } => {
                write!(f, "token exchange failed ({status}): {body}")
            }
            Self::Transport(msg) => write!(f, "token endpoint unreachable: {msg}"),
            Self::NotConnected => f.write_str("no Google OAuth credential available"),
            Self::ImportTimeout => f.write_str("no external Google credential found"),
        }
    }
}

impl std::error::Error for AuthError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
