//! Client and CLI settings read from `GENERATOR_*` and tuning variables.
//!
//! Unset variables fall back to a backend on `localhost:8000`. A `.env` file is
//! only consulted when the binary calls [`Config::dotenv_load`].
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub auth_token: Option<String>,
    /// Wait after 99% before finalizing locally with the held preview.
    pub grace_window: Duration,
    pub fallback: RetryPolicy,
    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let api_url = "http://localhost:8000".to_string();
        Config {
            ws_url: derive_ws_url(&api_url),
            api_url,
            auth_token: None,
            grace_window: Duration::from_secs(12),
            fallback: RetryPolicy::default(),
            request_timeout: None,
        }
    }
}

impl Config {
    pub fn dotenv_load() {
        dotenv::dotenv().ok();
    }

    pub fn new() -> AppResult<Self> {
        let defaults = Config::default();
        let api_url = env::var("GENERATOR_API_URL")
            .unwrap_or_else(|_| defaults.api_url.clone())
            .trim_end_matches('/')
            .to_string();
        let ws_url = env::var("GENERATOR_WS_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| derive_ws_url(&api_url));

        let grace_secs: u64 = parse_var("GRACE_WINDOW_SECS", defaults.grace_window.as_secs())?;
        let max_attempts: u32 = parse_var("FALLBACK_MAX_ATTEMPTS", defaults.fallback.max_attempts)?;
        let delay_ms: u64 = parse_var(
            "FALLBACK_RETRY_DELAY_MS",
            defaults.fallback.initial_delay.as_millis() as u64,
        )?;
        let request_timeout = match env::var("REQUEST_TIMEOUT_SECS") {
            Ok(raw) => Some(Duration::from_secs(parse_value("REQUEST_TIMEOUT_SECS", &raw)?)),
            Err(_) => None,
        };

        Ok(Config {
            api_url,
            ws_url,
            auth_token: env::var("GENERATOR_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            grace_window: Duration::from_secs(grace_secs),
            fallback: RetryPolicy {
                max_attempts: max_attempts.max(1),
                initial_delay: Duration::from_millis(delay_ms),
                ..defaults.fallback
            },
            request_timeout,
        })
    }

    /// Override the API base URL. The WebSocket URL follows it unless it was
    /// set explicitly.
    pub fn with_api_url(mut self, url: &str) -> Self {
        let ws_was_derived = self.ws_url == derive_ws_url(&self.api_url);
        self.api_url = url.trim_end_matches('/').to_string();
        if ws_was_derived {
            self.ws_url = derive_ws_url(&self.api_url);
        }
        self
    }

    pub fn print_env_vars(&self) {
        tracing::info!(
            api_url = %self.api_url,
            ws_url = %self.ws_url,
            auth = self.auth_token.is_some(),
            grace_window_secs = self.grace_window.as_secs(),
            fallback_attempts = self.fallback.max_attempts,
            "Effective configuration"
        );
    }
}

/// `http://host` becomes `ws://host`, `https://host` becomes `wss://host`.
pub fn derive_ws_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> AppResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} has invalid value '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_scheme() {
        assert_eq!(derive_ws_url("http://localhost:8000/"), "ws://localhost:8000");
        assert_eq!(derive_ws_url("https://gen.example.com"), "wss://gen.example.com");
        assert_eq!(derive_ws_url("ws://already"), "ws://already");
    }

    #[test]
    fn defaults_match_backend_contract() {
        let c = Config::default();
        assert_eq!(c.grace_window, Duration::from_secs(12));
        assert_eq!(c.ws_url, "ws://localhost:8000");
        assert!(c.auth_token.is_none());
    }

    #[test]
    fn invalid_number_is_a_config_error() {
        let err = parse_value::<u64>("GRACE_WINDOW_SECS", "twelve").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn api_override_rederives_ws() {
        let c = Config::default().with_api_url("https://remote:9000/");
        assert_eq!(c.api_url, "https://remote:9000");
        assert_eq!(c.ws_url, "wss://remote:9000");
    }

    #[test]
    fn api_override_keeps_explicit_ws() {
        let mut c = Config::default();
        c.ws_url = "wss://push.example.com".to_string();
        let c = c.with_api_url("https://remote:9000");
        assert_eq!(c.api_url, "https://remote:9000");
        assert_eq!(c.ws_url, "wss://push.example.com");
    }
}
