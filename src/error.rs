use std::fmt;

use crate::{
    auth::FlowState,
    client::{BackendError, ExchangeRequest, NonceRequest},
};

/// Errors raised while signing in with an Ethereum key
///
/// Each variant belongs to one [`FailureKind`], which is what the auth flow
/// records in its `Failed` state and what callers map to user notifications.
/// The variants keep the technical detail (status codes, response bodies,
/// the request that was sent) for diagnostics.
///
/// # Example
/// ```rust
/// use siwe_auth::{AuthError, FailureKind, Result};
///
/// fn notify(result: Result<()>) {
///     match result {
///         Ok(()) => println!("Signed in"),
///         Err(e) if e.kind() == FailureKind::UserAborted => println!("Signing cancelled"),
///         Err(e) => println!("{}", e.kind().user_message()),
///     }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Signature bytes could not be parsed
    ///
    /// This error occurs when:
    /// - The hex string is not valid hex
    /// - The decoded signature is neither 65 bytes nor a 64-byte compact signature
    /// - The recovery byte `v` is not one of 0, 1, 27 or 28
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Public key recovery failed for a well-formed signature
    ///
    /// This error occurs when `r` or `s` is zero or outside the curve order,
    /// or when `r` is not the x-coordinate of a point on the curve.
    #[error("Signature recovery failed: {0}")]
    RecoveryFailure(String),

    /// The nonce endpoint failed or answered with a non-2xx status
    #[error("Nonce request failed: {source}")]
    NonceRequest {
        request: NonceRequest,
        #[source]
        source: BackendError,
    },

    /// The signature exchange endpoint failed or answered with a non-2xx status
    #[error("Signature exchange failed: {source}")]
    Exchange {
        request: ExchangeRequest,
        #[source]
        source: BackendError,
    },

    /// The wallet declined to sign, was closed, or never answered
    #[error("Signing aborted: {0}")]
    UserAborted(String),

    /// The nonce service handed out a challenge id this client already used
    #[error("Challenge {0} was already used by a previous attempt")]
    ReusedChallenge(String),

    /// A challenge or signature from another attempt was passed in
    #[error("Challenge {challenge_id} does not belong to the current attempt")]
    StaleChallenge { challenge_id: String },

    /// An operation was called out of protocol order
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: FlowState,
    },

    /// Account address string is not 20 hex-encoded bytes
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Private key bytes are not a valid secp256k1 scalar
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Access token could not be decoded as a JWT
    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    /// Configuration could not be loaded or applied
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse failure categories, one per user-facing notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MalformedSignature,
    RecoveryFailure,
    NonceRequest,
    Exchange,
    UserAborted,
    ReusedChallenge,
    Usage,
    Local,
}

impl FailureKind {
    /// Short notification text suitable for showing to an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::MalformedSignature => "The wallet returned a signature that could not be read.",
            FailureKind::RecoveryFailure => "The wallet returned an invalid signature.",
            FailureKind::NonceRequest => "Could not start sign-in. Please try again.",
            FailureKind::Exchange => "The server rejected the sign-in. Please try again.",
            FailureKind::UserAborted => "Sign-in was cancelled in the wallet.",
            FailureKind::ReusedChallenge => "The server reused an old sign-in challenge. Please try again.",
            FailureKind::Usage => "Sign-in steps were called out of order.",
            FailureKind::Local => "Sign-in is not configured correctly.",
        }
    }

    /// Whether starting a new attempt from `request_nonce` can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::NonceRequest
                | FailureKind::Exchange
                | FailureKind::UserAborted
                | FailureKind::ReusedChallenge
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::MalformedSignature => "malformed signature",
            FailureKind::RecoveryFailure => "recovery failure",
            FailureKind::NonceRequest => "nonce request error",
            FailureKind::Exchange => "exchange error",
            FailureKind::UserAborted => "user aborted",
            FailureKind::ReusedChallenge => "reused challenge",
            FailureKind::Usage => "usage error",
            FailureKind::Local => "local error",
        };
        f.write_str(name)
    }
}

impl AuthError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AuthError::MalformedSignature(_) => FailureKind::MalformedSignature,
            AuthError::RecoveryFailure(_) => FailureKind::RecoveryFailure,
            AuthError::NonceRequest { .. } => FailureKind::NonceRequest,
            AuthError::Exchange { .. } => FailureKind::Exchange,
            AuthError::UserAborted(_) => FailureKind::UserAborted,
            AuthError::ReusedChallenge(_) => FailureKind::ReusedChallenge,
            AuthError::StaleChallenge { .. } | AuthError::InvalidState { .. } => FailureKind::Usage,
            AuthError::InvalidAddress(_)
            | AuthError::InvalidKey(_)
            | AuthError::InvalidToken(_)
            | AuthError::Config(_) => FailureKind::Local,
        }
    }

    /// HTTP status of a failed backend call, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::NonceRequest { source, .. } | AuthError::Exchange { source, .. } => {
                source.status()
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
