// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_TOKEN_INFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Public installed-app client id used by the Gemini CLI.
pub const GEMINI_CLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";

pub const DEFAULT_PORT_MIN: u16 = 1717;
pub const DEFAULT_PORT_MAX: u16 = 1730;
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_IMPORT_WAIT_MS: u64 = 2 * 60 * 1000;

/// Configuration for the OAuth broker.
#[derive(Debug, Clone, clap::Args)]
pub struct BrokerConfig {
    /// Explicit path to the Gemini CLI credential file (checked before defaults).
    #[arg(long, env = "GEMINI_OAUTH_CREDS_PATH")]
    pub creds_path: Option<PathBuf>,

    /// Path to the Application Default Credentials file.
    #[arg(long, env = "GEMAUTH_ADC_PATH")]
    pub adc_path: Option<PathBuf>,

    /// OAuth client id override.
    #[arg(long, env = "GEMAUTH_OAUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret override (confidential clients only).
    #[arg(long, env = "GEMAUTH_OAUTH_CLIENT_SECRET")]
    pub client_secret: Option<String>,

    /// Treat every stored access token as expired (diagnostics).
    #[arg(long, env = "GEMAUTH_SIMULATE_TOKEN_EXPIRY")]
    pub simulate_expiry: bool,

    /// Request the generative-language scope in addition to cloud-platform.
    #[arg(long, env = "GEMAUTH_ENABLE_EXTRA_SCOPE")]
    pub extra_scope: bool,

    /// First port tried for the local callback listener.
    #[arg(long, default_value_t = DEFAULT_PORT_MIN, env = "GEMAUTH_CALLBACK_PORT_MIN")]
    pub port_min: u16,

    /// Last port tried for the local callback listener (inclusive).
    #[arg(long, default_value_t = DEFAULT_PORT_MAX, env = "GEMAUTH_CALLBACK_PORT_MAX")]
    pub port_max: u16,

    /// How long to wait for the browser redirect, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_CALLBACK_TIMEOUT_MS, env = "GEMAUTH_CALLBACK_TIMEOUT_MS")]
    pub callback_timeout_ms: u64,

    /// How long `import` waits for an external credential to appear, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_IMPORT_WAIT_MS, env = "GEMAUTH_IMPORT_WAIT_MS")]
    pub import_wait_ms: u64,

    /// Path of the persisted credential store.
    #[arg(long, env = "GEMAUTH_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    #[arg(long, hide = true, default_value = GOOGLE_AUTH_URL, env = "GEMAUTH_AUTH_URL")]
    pub auth_url: String,

    #[arg(long, hide = true, default_value = GOOGLE_TOKEN_URL, env = "GEMAUTH_TOKEN_URL")]
    pub token_url: String,

    #[arg(long, hide = true, default_value = GOOGLE_TOKEN_INFO_URL, env = "GEMAUTH_TOKEN_INFO_URL")]
    pub token_info_url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            creds_path: None,
            adc_path: None,
            client_id: None,
            client_secret: None,
            simulate_expiry: false,
            extra_scope: false,
            port_min: DEFAULT_PORT_MIN,
            port_max: DEFAULT_PORT_MAX,
            callback_timeout_ms: DEFAULT_CALLBACK_TIMEOUT_MS,
            import_wait_ms: DEFAULT_IMPORT_WAIT_MS,
            store_path: None,
            auth_url: GOOGLE_AUTH_URL.to_owned(),
            token_url: GOOGLE_TOKEN_URL.to_owned(),
            token_info_url: GOOGLE_TOKEN_INFO_URL.to_owned(),
        }
    }
}

impl BrokerConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn import_wait(&self) -> Duration {
        Duration::from_millis(self.import_wait_ms)
    }

    /// Client id for new authorizations: override, then the Gemini CLI default.
    pub fn default_client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(GEMINI_CLI_CLIENT_ID)
    }

    /// Resolved store path: explicit override, then `<state dir>/credentials.json`.
    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| state_dir().join("credentials.json"))
    }

    /// Candidate Gemini CLI credential files, override first.
    pub fn creds_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.creds_path.iter().cloned().collect();
        if let Some(home) = home_dir() {
            paths.push(home.join(".gemini/oauth_creds.json"));
            paths.push(home.join(".config/gemini/oauth_creds.json"));
            paths.push(home.join(".config/google-gemini/oauth_creds.json"));
        }
        paths
    }

    /// The ADC file: override, then the gcloud default location.
    pub fn adc_path(&self) -> Option<PathBuf> {
        self.adc_path.clone().or_else(default_adc_path)
    }
}

/// Resolve the state directory for broker data.
///
/// Checks `GEMAUTH_STATE_DIR`, then `$XDG_STATE_HOME/gemauth`,
/// then `$HOME/.local/state/gemauth`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GEMAUTH_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("gemauth");
    }
    if let Some(home) = home_dir() {
        return home.join(".local/state/gemauth");
    }
    PathBuf::from(".gemauth")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")).map(PathBuf::from)
}

#[cfg(not(windows))]
fn default_adc_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".config/gcloud/application_default_credentials.json"))
}

#[cfg(windows)]
fn default_adc_path() -> Option<PathBuf> {
    std::env::var_os("APPDATA")
        .map(|dir| PathBuf::from(dir).join("gcloud/application_default_credentials.json"))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
