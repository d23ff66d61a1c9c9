use std::time::Duration;

use secrecy::Secret;
use serde::Deserialize;

use crate::error::{AuthError, Result};

/// Prefix of the environment variables read by [`AuthConfig::from_env`]
pub const ENV_PREFIX: &str = "SIWE_AUTH_";

/// Configuration for the sign-in flow and its identity service
///
/// This struct contains the settings needed to talk to the nonce/session
/// service and to drive the wallet:
/// - Where the service lives and which origin the login is bound to
/// - An optional API key sent as the `apikey` header
/// - Timeouts for HTTP calls and for the wallet prompt
///
/// # Example
/// ```rust
/// use siwe_auth::AuthConfig;
///
/// let config = AuthConfig::new("https://auth.example.com/auth/v1", "https://app.example.com");
/// assert!(config.self_check);
/// assert_eq!(config.request_timeout_secs, 30);
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the identity service; `/nonce` and `/eth` are appended to it
    pub base_url: String,
    /// Origin URL the nonce is bound to, sent as `url` in the nonce request
    pub origin_url: String,
    /// API key for the identity service
    ///
    /// GoTrue deployments behind Supabase reject requests without it.
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
    /// Timeout for each HTTP request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long to wait for the wallet to return a signature, in seconds
    ///
    /// `None` waits until the signer answers or the caller drops the future.
    #[serde(default)]
    pub signing_timeout_secs: Option<u64>,
    /// Recover the signer locally and compare it to the wallet address
    #[serde(default = "default_self_check")]
    pub self_check: bool,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_self_check() -> bool {
    true
}

impl AuthConfig {
    pub fn new(base_url: impl Into<String>, origin_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            origin_url: origin_url.into(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            signing_timeout_secs: None,
            self_check: default_self_check(),
        }
    }

    /// Load the configuration from `SIWE_AUTH_*` environment variables
    ///
    /// `SIWE_AUTH_BASE_URL` and `SIWE_AUTH_ORIGIN_URL` are required;
    /// `SIWE_AUTH_API_KEY`, `SIWE_AUTH_REQUEST_TIMEOUT_SECS`,
    /// `SIWE_AUTH_SIGNING_TIMEOUT_SECS` and `SIWE_AUTH_SELF_CHECK` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load the configuration from an iterator of `(name, value)` pairs
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: AuthConfig = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| AuthError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(AuthError::Config("base_url must not be empty".to_string()));
        }
        if self.origin_url.trim().is_empty() {
            return Err(AuthError::Config("origin_url must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(AuthError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn signing_timeout(&self) -> Option<Duration> {
        self.signing_timeout_secs.map(Duration::from_secs)
    }
}
