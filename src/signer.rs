//! The wallet side of the protocol: something that can `personal_sign`.

use async_trait::async_trait;
use k256::ecdsa::SigningKey;

use crate::{
    crypto::{address::Address, personal_message, recovery::RecoverableSignature},
    error::{AuthError, Result},
};

/// Why a signer did not return a signature
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    /// The user declined the request or closed the wallet prompt
    #[error("request rejected by user")]
    Rejected,

    /// The wallet cannot sign for this account right now
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// A wallet able to sign UTF-8 text as an Ethereum personal message
///
/// Implementations return the 65-byte signature hex-encoded, with `v` in
/// either the `0/1` or the `27/28` form.
#[async_trait]
pub trait PersonalSigner: Send + Sync {
    async fn sign_personal_message(
        &self,
        address: &Address,
        message: &str,
    ) -> std::result::Result<String, SignerError>;
}

/// In-process signer holding a secp256k1 private key
///
/// Useful for servers, scripts and tests that sign in with a key they hold
/// directly instead of through a browser wallet.
#[derive(Clone)]
pub struct LocalKeySigner {
    signing_key: SigningKey,
    address: Address,
}

impl LocalKeySigner {
    pub fn new(signing_key: SigningKey) -> Self {
        let address = Address::from_public_key(signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    /// Generate a signer with a fresh random key
    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Load a signer from a hex-encoded 32-byte private key
    pub fn from_hex(private_key_hex: &str) -> Result<Self> {
        let trimmed = private_key_hex.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| AuthError::InvalidKey(format!("invalid hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| AuthError::InvalidKey(format!("not a secp256k1 scalar: {e}")))?;
        Ok(Self::new(signing_key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign `message` as a personal message
    pub fn sign_message(&self, message: &str) -> Result<RecoverableSignature> {
        let digest = personal_message::hash(message);
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| AuthError::InvalidKey(format!("signing failed: {e}")))?;
        Ok(RecoverableSignature::from_parts(&signature, recovery_id))
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PersonalSigner for LocalKeySigner {
    async fn sign_personal_message(
        &self,
        address: &Address,
        message: &str,
    ) -> std::result::Result<String, SignerError> {
        if *address != self.address {
            return Err(SignerError::Unavailable(format!("no key for account {address}")));
        }

        self.sign_message(message)
            .map(|signature| signature.to_hex())
            .map_err(|e| SignerError::Unavailable(e.to_string()))
    }
}
