//! Client for the identity service's nonce and signature exchange endpoints.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    config::AuthConfig,
    error::{AuthError, Result},
    session::{NonceChallenge, SessionCredential},
};

/// Body of `POST {base}/nonce`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NonceRequest {
    pub wallet_address: String,
    /// Decimal chain id
    pub chain_id: String,
    /// Origin the login is bound to
    pub url: String,
}

/// Body of `POST {base}/eth`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExchangeRequest {
    pub nonce_id: String,
    pub signature: String,
}

/// Errors from a single call to the identity service
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response (connect, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-2xx status
    #[error("server responded with {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx response whose body is not the expected JSON
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            BackendError::Transport(e) => e.status().map(|s| s.as_u16()),
            BackendError::Decode(_) => None,
        }
    }
}

/// The identity service as seen by the auth flow
///
/// Nonce issuance, single-use enforcement and session minting all live
/// behind this trait; the flow only sequences the calls.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Ask for a fresh challenge bound to a wallet, chain and origin
    async fn request_nonce(
        &self,
        request: &NonceRequest,
    ) -> std::result::Result<NonceChallenge, BackendError>;

    /// Trade a signed challenge for a session credential
    async fn exchange(
        &self,
        request: &ExchangeRequest,
    ) -> std::result::Result<SessionCredential, BackendError>;
}

/// HTTP implementation of [`AuthBackend`] for GoTrue-style services
#[derive(Debug, Clone)]
pub struct HttpAuthBackend {
    base_url: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl HttpAuthBackend {
    /// # Errors
    /// - `Config` - invalid settings, or an API key that is not a valid header value
    pub fn new(config: &AuthConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers: Self::build_headers(config)?,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body and deserialize a 2xx JSON response
    async fn post_json<B, T>(&self, path: &str, body: &B) -> std::result::Result<T, BackendError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url);

        let resp = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            log::error!("POST {url} failed with {status}: {body}");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    fn build_headers(config: &AuthConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        if let Some(ref key) = config.api_key {
            let mut val = HeaderValue::from_str(key.expose_secret()).map_err(|_| {
                AuthError::Config("api_key is not a valid HTTP header value".to_string())
            })?;
            val.set_sensitive(true);
            headers.insert("apikey", val);
        }

        Ok(headers)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn request_nonce(
        &self,
        request: &NonceRequest,
    ) -> std::result::Result<NonceChallenge, BackendError> {
        self.post_json("nonce", request).await
    }

    async fn exchange(
        &self,
        request: &ExchangeRequest,
    ) -> std::result::Result<SessionCredential, BackendError> {
        self.post_json("eth", request).await
    }
}
