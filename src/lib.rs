//! # siwe-auth
//!
//! A Rust client for **Sign-In with Ethereum** style authentication against a
//! GoTrue-compatible identity service. The user proves control of an
//! Ethereum key by signing a server-issued nonce, and the signature is
//! traded for a session credential.
//!
//! ## Features
//!
//! - **Personal Message Codec** - EIP-191 `personal_sign` encoding and Keccak-256 hashing
//! - **Signer Recovery** - Recover the signing address from a 65-byte signature, accepting `v` as 0/1 or 27/28
//! - **Auth Flow State Machine** - Nonce request, signing and exchange as explicit, ordered transitions
//! - **Local Self-Check** - Compare the recovered signer to the wallet address before exchanging
//! - **Pluggable Seams** - Bring your own backend ([`AuthBackend`]) or wallet ([`PersonalSigner`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use siwe_auth::{AuthConfig, AuthFlow, LocalKeySigner};
//!
//! # async fn run() -> siwe_auth::Result<()> {
//! let config = AuthConfig::new("https://auth.example.com/auth/v1", "https://app.example.com");
//! let mut flow = AuthFlow::from_config(&config)?;
//! let signer = LocalKeySigner::random();
//!
//! // Step by step
//! let challenge = flow.request_nonce(signer.address(), 1, &config.origin_url).await?;
//! let signed = flow.sign_challenge(&challenge, &signer).await?;
//! let credential = flow.exchange(&signed.challenge_id, &signed.signature).await?;
//! println!("Authenticated as {}", credential.user.id);
//!
//! // Or in one call
//! flow.reset();
//! flow.login(signer.address(), 1, &signer).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Recovering a signer
//!
//! ```rust
//! use siwe_auth::{recover_signer_for_message, LocalKeySigner};
//!
//! let signer = LocalKeySigner::random();
//! let signature = signer.sign_message("login-to-app-12345").unwrap();
//! let recovered = recover_signer_for_message(&signature.to_hex(), "login-to-app-12345").unwrap();
//! assert_eq!(recovered, signer.address());
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod session;
pub mod signer;

// Re-export main types for easier access
pub use auth::{AuthFlow, FlowState, SelfCheck, SignedChallenge};
pub use client::{AuthBackend, BackendError, ExchangeRequest, HttpAuthBackend, NonceRequest};
pub use config::AuthConfig;
pub use crypto::address::Address;
pub use crypto::recovery::{recover_signer, recover_signer_for_message, RecoverableSignature};
pub use error::{AuthError, FailureKind, Result};
pub use session::{AuthStatus, NonceChallenge, SessionCredential, User};
pub use signer::{LocalKeySigner, PersonalSigner, SignerError};
