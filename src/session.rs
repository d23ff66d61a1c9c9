use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

/// Login challenge issued by the nonce service
///
/// The `nonce` is signed verbatim as a personal message; `id` is what the
/// exchange call refers back to. A challenge belongs to exactly one attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceChallenge {
    pub id: String,
    pub nonce: String,
}

/// Coarse sign-in status shown to the application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthStatus {
    /// A wallet is linked and a sign-in attempt is underway
    Connected,
    /// A session credential has been obtained
    Authenticated,
    /// Nothing in progress, or the last attempt failed or was reset
    Unknown,
}

/// Session issued by the identity service after a verified signature
///
/// The tokens are wrapped in [`Secret`] so they never show up in `Debug`
/// output or logs. This crate does not persist the credential.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionCredential {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub user: User,
}

/// User record attached to a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub aud: String,
    pub role: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub app_metadata: AppMetadata,
    #[serde(default)]
    pub user_metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub identities: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub providers: Vec<String>,
}

/// Claims carried by the session's access token
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AccessClaims {
    /// User id the token was issued for
    pub sub: String,
    /// Expiration timestamp (Unix timestamp)
    pub exp: i64,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SessionCredential {
    /// Decode the access token's claims without checking its signature
    ///
    /// The client never holds the service's signing key; the claims are read
    /// for display and expiry bookkeeping only and must not be trusted for
    /// authorization decisions.
    pub fn access_claims(&self) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<AccessClaims>(
            self.access_token.expose_secret(),
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .map_err(|e| AuthError::InvalidToken(format!("Failed to decode access token: {e}")))?;
        Ok(token_data.claims)
    }

    /// Expiry time of the access token, from its `exp` claim
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        let claims = self.access_claims()?;
        DateTime::from_timestamp(claims.exp, 0).ok_or_else(|| {
            AuthError::InvalidToken(format!("exp {} is out of range", claims.exp))
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.expires_at()? <= now)
    }
}
