use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::{env_flag, is_local_endpoint_url};

const API_URL_ENV: &str = "ADCHAT_API_URL";
const AUTH_TOKEN_ENV: &str = "ADCHAT_AUTH_TOKEN";
const EMAIL_ENV: &str = "ADCHAT_EMAIL";
const SEND_POLICY_ENV: &str = "ADCHAT_SEND_POLICY";
const ATTACHMENTS_ENV: &str = "ADCHAT_ATTACHMENTS";
const REQUEST_TIMEOUT_ENV: &str = "ADCHAT_REQUEST_TIMEOUT_SECS";

pub(crate) const CONFIG_ENV_KEYS: [&str; 6] = [
    API_URL_ENV,
    AUTH_TOKEN_ENV,
    EMAIL_ENV,
    SEND_POLICY_ENV,
    ATTACHMENTS_ENV,
    REQUEST_TIMEOUT_ENV,
];

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

/// What happens to a `send` issued while another session is still streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicy {
    /// The new send is refused and the active session keeps running.
    #[default]
    Reject,
    /// The active session is cancelled and replaced by the new one.
    Supersede,
}

impl SendPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "supersede" | "replace" => Some(Self::Supersede),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_url: String,
    pub auth_token: Option<String>,
    pub email: Option<String>,
    pub send_policy: SendPolicy,
    pub attachments_enabled: bool,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            email: None,
            send_policy: SendPolicy::default(),
            attachments_enabled: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url = std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let auth_token = non_empty_env(AUTH_TOKEN_ENV);
        let email = non_empty_env(EMAIL_ENV);

        let send_policy = match non_empty_env(SEND_POLICY_ENV) {
            Some(raw) => SendPolicy::parse(&raw).with_context(|| {
                format!("Invalid {SEND_POLICY_ENV} '{raw}': expected 'reject' or 'supersede'")
            })?,
            None => SendPolicy::default(),
        };

        let attachments_enabled = env_flag(ATTACHMENTS_ENV).unwrap_or(true);

        let request_timeout_secs = match non_empty_env(REQUEST_TIMEOUT_ENV) {
            Some(raw) => raw.trim().parse::<u64>().with_context(|| {
                format!("Invalid {REQUEST_TIMEOUT_ENV} '{raw}': expected whole seconds")
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            api_url,
            auth_token,
            email,
            send_policy,
            attachments_enabled,
            request_timeout_secs,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid {API_URL_ENV} '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        if !self.is_local_endpoint() && self.auth_token.is_none() && self.email.is_none() {
            bail!(
                "{AUTH_TOKEN_ENV} or {EMAIL_ENV} must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            bail!(
                "{REQUEST_TIMEOUT_ENV} must be between 1 and {MAX_REQUEST_TIMEOUT_SECS} (got {})",
                self.request_timeout_secs
            );
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
