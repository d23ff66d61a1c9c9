use std::{
    collections::{HashSet, VecDeque},
    fmt,
    time::Duration,
};

use uuid::Uuid;

use crate::{
    client::{AuthBackend, ExchangeRequest, HttpAuthBackend, NonceRequest},
    config::AuthConfig,
    crypto::{address::Address, personal_message, recovery::RecoverableSignature},
    error::{AuthError, FailureKind, Result},
    session::{AuthStatus, NonceChallenge, SessionCredential},
    signer::{PersonalSigner, SignerError},
};

/// Where a sign-in attempt stands
///
/// One protocol step is pending at a time:
/// `Idle → NonceRequested → Signing → Verifying → Authenticated`.
/// Any failure moves to `Failed`; [`AuthFlow::reset`] returns to `Idle` from
/// anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    NonceRequested,
    /// Waiting on the wallet, or holding a signature not yet exchanged
    Signing,
    Verifying,
    Authenticated,
    Failed(FailureKind),
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Idle => f.write_str("idle"),
            FlowState::NonceRequested => f.write_str("nonce requested"),
            FlowState::Signing => f.write_str("signing"),
            FlowState::Verifying => f.write_str("verifying"),
            FlowState::Authenticated => f.write_str("authenticated"),
            FlowState::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// Outcome of the local signer self-check
///
/// This is a diagnostic only. The identity service verifies the signature
/// itself, so a mismatch is recorded and the exchange still goes ahead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelfCheck {
    /// The signature recovers to the wallet address the nonce was issued for
    Match,
    /// The signature recovers to some other account
    Mismatch {
        expected: Address,
        recovered: Address,
    },
    /// Self-check disabled by configuration
    Skipped,
}

/// A signature over the current challenge, ready to be exchanged
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedChallenge {
    pub challenge_id: String,
    /// Lowercase `0x`-prefixed signature hex, `v` as the wallet returned it
    pub signature: String,
    pub self_check: SelfCheck,
}

/// Most recent challenge ids remembered for replay detection
pub const RETIRED_CHALLENGE_CAPACITY: usize = 1024;

/// Challenge ids that must never be exchanged again, oldest evicted first
struct RetiredChallenges {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RetiredChallenges {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Attempt {
    id: Uuid,
    wallet: Address,
    chain_id: u64,
    challenge: NonceChallenge,
    signed: Option<SignedChallenge>,
}

/// Drives the nonce → sign → exchange sign-in protocol
///
/// The flow owns the state of a single login attempt. Every transition takes
/// `&mut self`, so only one step can be pending at a time; starting a new
/// attempt abandons the previous one and its challenge is never exchanged.
///
/// The last [`RETIRED_CHALLENGE_CAPACITY`] challenge ids that have been
/// exchanged or abandoned are remembered, and a nonce service that hands one
/// out again is rejected.
///
/// Dropping a pending `request_nonce`, `sign_challenge` or `exchange` future
/// ends the attempt: the flow then reports `Failed` and the next call starts
/// from there.
///
/// # Example
/// ```rust,no_run
/// use siwe_auth::{AuthConfig, AuthFlow, LocalKeySigner};
///
/// # async fn run() -> siwe_auth::Result<()> {
/// let config = AuthConfig::from_env()?;
/// let mut flow = AuthFlow::from_config(&config)?;
/// let signer = LocalKeySigner::from_hex("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")?;
///
/// let credential = flow.login(signer.address(), 1, &signer).await?;
/// println!("Signed in as {}", credential.user.id);
/// # Ok(())
/// # }
/// ```
pub struct AuthFlow<B> {
    backend: B,
    origin_url: String,
    signing_timeout: Option<Duration>,
    self_check: bool,
    state: FlowState,
    attempt: Option<Attempt>,
    credential: Option<SessionCredential>,
    retired: RetiredChallenges,
    /// Set while a service or wallet call is awaited; still set afterwards
    /// only if the caller dropped the future
    pending: Option<FailureKind>,
}

impl AuthFlow<HttpAuthBackend> {
    /// Create a flow talking to the HTTP identity service named in `config`
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        Ok(Self::new(HttpAuthBackend::new(config)?, config))
    }
}

impl<B: AuthBackend> AuthFlow<B> {
    pub fn new(backend: B, config: &AuthConfig) -> Self {
        Self {
            backend,
            origin_url: config.origin_url.clone(),
            signing_timeout: config.signing_timeout(),
            self_check: config.self_check,
            state: FlowState::Idle,
            attempt: None,
            credential: None,
            retired: RetiredChallenges::with_capacity(RETIRED_CHALLENGE_CAPACITY),
            pending: None,
        }
    }

    /// Start a new attempt by requesting a challenge for `wallet`
    ///
    /// Can be called from any state. An unfinished attempt is abandoned and
    /// its challenge retired; a held credential is dropped.
    ///
    /// # Errors
    /// - `NonceRequest` - transport failure, non-2xx status or bad body
    /// - `ReusedChallenge` - the service returned a challenge id seen before
    pub async fn request_nonce(
        &mut self,
        wallet: Address,
        chain_id: u64,
        origin_url: &str,
    ) -> Result<NonceChallenge> {
        self.settle_interrupted();
        self.abandon_attempt();
        self.state = FlowState::Idle;

        let attempt_id = Uuid::new_v4();
        let request = NonceRequest {
            wallet_address: wallet.to_checksum(),
            chain_id: chain_id.to_string(),
            url: origin_url.to_string(),
        };
        log::info!("Sign-in attempt {attempt_id} for {wallet} on chain {chain_id}");

        self.pending = Some(FailureKind::NonceRequest);
        let outcome = self.backend.request_nonce(&request).await;
        self.pending = None;

        let challenge = match outcome {
            Ok(challenge) => challenge,
            Err(source) => return Err(self.fail(AuthError::NonceRequest { request, source })),
        };

        if self.retired.contains(&challenge.id) {
            return Err(self.fail(AuthError::ReusedChallenge(challenge.id)));
        }

        self.attempt = Some(Attempt {
            id: attempt_id,
            wallet,
            chain_id,
            challenge: challenge.clone(),
            signed: None,
        });
        self.state = FlowState::NonceRequested;
        Ok(challenge)
    }

    /// Have `signer` sign the current challenge's nonce as a personal message
    ///
    /// With the self-check enabled the signer is recovered locally and
    /// compared to the wallet address; the outcome is recorded in the
    /// returned [`SignedChallenge`].
    ///
    /// # Errors
    /// - `InvalidState` - no challenge is waiting to be signed
    /// - `StaleChallenge` - `challenge` is not the current attempt's
    /// - `UserAborted` - the signer refused, failed, or timed out
    /// - `MalformedSignature` / `RecoveryFailure` - the returned signature is unusable
    pub async fn sign_challenge<S>(
        &mut self,
        challenge: &NonceChallenge,
        signer: &S,
    ) -> Result<SignedChallenge>
    where
        S: PersonalSigner + ?Sized,
    {
        self.settle_interrupted();
        if self.state != FlowState::NonceRequested {
            return Err(AuthError::InvalidState {
                operation: "sign a challenge",
                state: self.state,
            });
        }
        let wallet = match &self.attempt {
            Some(attempt) if attempt.challenge == *challenge => attempt.wallet,
            _ => {
                return Err(AuthError::StaleChallenge {
                    challenge_id: challenge.id.clone(),
                })
            }
        };

        self.state = FlowState::Signing;
        self.pending = Some(FailureKind::UserAborted);
        let signing = signer.sign_personal_message(&wallet, &challenge.nonce);
        let outcome = match self.signing_timeout {
            Some(limit) => match tokio::time::timeout(limit, signing).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SignerError::Unavailable(format!(
                    "no signature after {}s",
                    limit.as_secs()
                ))),
            },
            None => signing.await,
        };
        self.pending = None;

        let signature_hex = match outcome {
            Ok(signature_hex) => signature_hex,
            Err(e) => return Err(self.fail(AuthError::UserAborted(e.to_string()))),
        };

        let signed = match self.check_signature(wallet, challenge, &signature_hex) {
            Ok(signed) => signed,
            Err(e) => return Err(self.fail(e)),
        };

        if let Some(attempt) = self.attempt.as_mut() {
            attempt.signed = Some(signed.clone());
        }
        Ok(signed)
    }

    /// Trade the signed challenge for a session credential
    ///
    /// `challenge_id` and `signature` must be the ones produced by
    /// [`AuthFlow::sign_challenge`] in this attempt. The challenge is retired
    /// before the call goes out, whatever its result.
    ///
    /// # Errors
    /// - `InvalidState` - there is no signed challenge to exchange
    /// - `StaleChallenge` - id or signature belong to a different attempt
    /// - `Exchange` - transport failure, non-2xx status or bad body
    pub async fn exchange(
        &mut self,
        challenge_id: &str,
        signature: &str,
    ) -> Result<&SessionCredential> {
        self.settle_interrupted();
        let invalid_state = AuthError::InvalidState {
            operation: "exchange a signature",
            state: self.state,
        };
        if self.state != FlowState::Signing {
            return Err(invalid_state);
        }
        let (attempt_id, signed) = match &self.attempt {
            Some(Attempt {
                id,
                signed: Some(signed),
                ..
            }) => (*id, signed),
            _ => return Err(invalid_state),
        };

        let same_signature = RecoverableSignature::from_hex(signature)
            .map(|parsed| parsed.to_hex() == signed.signature)
            .unwrap_or(false);
        if signed.challenge_id != challenge_id || !same_signature {
            return Err(AuthError::StaleChallenge {
                challenge_id: challenge_id.to_string(),
            });
        }

        let request = ExchangeRequest {
            nonce_id: signed.challenge_id.clone(),
            signature: signed.signature.clone(),
        };
        self.retired.insert(request.nonce_id.clone());
        self.state = FlowState::Verifying;

        self.pending = Some(FailureKind::Exchange);
        let outcome = self.backend.exchange(&request).await;
        self.pending = None;

        match outcome {
            Ok(credential) => {
                log::info!(
                    "Sign-in attempt {attempt_id} authenticated user {}",
                    credential.user.id
                );
                self.state = FlowState::Authenticated;
                Ok(&*self.credential.insert(credential))
            }
            Err(source) => Err(self.fail(AuthError::Exchange { request, source })),
        }
    }

    /// Run a whole attempt: request a nonce, sign it, exchange it
    ///
    /// The nonce is bound to the configured origin URL.
    pub async fn login<S>(
        &mut self,
        wallet: Address,
        chain_id: u64,
        signer: &S,
    ) -> Result<&SessionCredential>
    where
        S: PersonalSigner + ?Sized,
    {
        let origin_url = self.origin_url.clone();
        let challenge = self.request_nonce(wallet, chain_id, &origin_url).await?;
        let signed = self.sign_challenge(&challenge, signer).await?;
        self.exchange(&signed.challenge_id, &signed.signature).await
    }

    /// Return to `Idle`, dropping the challenge, signature and credential
    pub fn reset(&mut self) {
        self.settle_interrupted();
        let dirty =
            self.state != FlowState::Idle || self.attempt.is_some() || self.credential.is_some();
        self.abandon_attempt();
        self.state = FlowState::Idle;
        if dirty {
            log::debug!("Auth flow reset");
        }
    }

    /// Current state; `Failed` if the caller dropped a pending step
    pub fn state(&self) -> FlowState {
        match self.pending {
            Some(kind) => FlowState::Failed(kind),
            None => self.state,
        }
    }

    pub fn status(&self) -> AuthStatus {
        match self.state() {
            FlowState::Authenticated => AuthStatus::Authenticated,
            FlowState::NonceRequested | FlowState::Signing | FlowState::Verifying => {
                AuthStatus::Connected
            }
            FlowState::Idle | FlowState::Failed(_) => AuthStatus::Unknown,
        }
    }

    pub fn attempt_id(&self) -> Option<Uuid> {
        self.current_attempt().map(|attempt| attempt.id)
    }

    pub fn wallet(&self) -> Option<Address> {
        self.current_attempt().map(|attempt| attempt.wallet)
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.current_attempt().map(|attempt| attempt.chain_id)
    }

    pub fn challenge(&self) -> Option<&NonceChallenge> {
        self.current_attempt().map(|attempt| &attempt.challenge)
    }

    pub fn signed_challenge(&self) -> Option<&SignedChallenge> {
        self.current_attempt()
            .and_then(|attempt| attempt.signed.as_ref())
    }

    pub fn credential(&self) -> Option<&SessionCredential> {
        self.credential.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Parse the wallet's signature and run the optional self-check
    fn check_signature(
        &self,
        wallet: Address,
        challenge: &NonceChallenge,
        signature_hex: &str,
    ) -> Result<SignedChallenge> {
        let signature = RecoverableSignature::from_hex(signature_hex)?;
        signature.normalized_v()?;

        let self_check = if self.self_check {
            let recovered = signature.recover(&personal_message::hash(&challenge.nonce))?;
            if recovered == wallet {
                SelfCheck::Match
            } else {
                log::warn!(
                    "Signature for challenge {} recovers to {recovered}, expected {wallet}",
                    challenge.id
                );
                SelfCheck::Mismatch {
                    expected: wallet,
                    recovered,
                }
            }
        } else {
            SelfCheck::Skipped
        };

        Ok(SignedChallenge {
            challenge_id: challenge.id.clone(),
            signature: signature.to_hex(),
            self_check,
        })
    }

    fn current_attempt(&self) -> Option<&Attempt> {
        match self.pending {
            Some(_) => None,
            None => self.attempt.as_ref(),
        }
    }

    /// End the current attempt with `error`
    fn fail(&mut self, error: AuthError) -> AuthError {
        self.state = FlowState::Failed(error.kind());
        self.take_attempt();
        error
    }

    /// Turn a step whose future was dropped into a failed attempt
    fn settle_interrupted(&mut self) {
        if let Some(kind) = self.pending.take() {
            log::warn!("Sign-in step interrupted while {}", self.state);
            self.state = FlowState::Failed(kind);
            self.take_attempt();
        }
    }

    /// Drop an attempt the caller is walking away from
    ///
    /// Returns the id of the attempt if it was still in flight.
    fn abandon_attempt(&mut self) -> Option<Uuid> {
        let in_flight = matches!(
            self.state,
            FlowState::NonceRequested | FlowState::Signing | FlowState::Verifying
        );
        let attempt = self.take_attempt()?;
        if !in_flight {
            return None;
        }
        log::warn!("Abandoning sign-in attempt {} ({})", attempt.id, self.state);
        Some(attempt.id)
    }

    /// Drop attempt data, retiring its challenge so it is never exchanged
    fn take_attempt(&mut self) -> Option<Attempt> {
        self.credential = None;
        let attempt = self.attempt.take()?;
        self.retired.insert(attempt.challenge.id.clone());
        Some(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::BackendError, session::tests::credential_json, signer::LocalKeySigner};
    use async_trait::async_trait;
    use std::{collections::VecDeque, sync::Mutex};

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const ORIGIN: &str = "http://localhost:3000";

    struct MockBackend {
        challenges: Mutex<VecDeque<NonceChallenge>>,
        nonce_status: Option<u16>,
        exchange_status: Option<u16>,
        nonce_calls: Mutex<Vec<NonceRequest>>,
        exchange_calls: Mutex<Vec<ExchangeRequest>>,
    }

    impl MockBackend {
        fn new(challenges: &[(&str, &str)]) -> Self {
            Self {
                challenges: Mutex::new(
                    challenges
                        .iter()
                        .map(|(id, nonce)| challenge(id, nonce))
                        .collect(),
                ),
                nonce_status: None,
                exchange_status: None,
                nonce_calls: Mutex::new(Vec::new()),
                exchange_calls: Mutex::new(Vec::new()),
            }
        }

        fn exchanged_ids(&self) -> Vec<String> {
            self.exchange_calls
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.nonce_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AuthBackend for MockBackend {
        async fn request_nonce(
            &self,
            request: &NonceRequest,
        ) -> std::result::Result<NonceChallenge, BackendError> {
            self.nonce_calls.lock().unwrap().push(request.clone());
            if let Some(status) = self.nonce_status {
                return Err(BackendError::Status {
                    status,
                    body: "nonce service down".to_string(),
                });
            }
            Ok(self.challenges.lock().unwrap().pop_front().unwrap())
        }

        async fn exchange(
            &self,
            request: &ExchangeRequest,
        ) -> std::result::Result<SessionCredential, BackendError> {
            self.exchange_calls.lock().unwrap().push(request.clone());
            if let Some(status) = self.exchange_status {
                return Err(BackendError::Status {
                    status,
                    body: "signature rejected".to_string(),
                });
            }
            Ok(serde_json::from_value(credential_json("user-1", 4_102_444_800)).unwrap())
        }
    }

    /// Signs with its own key whatever account it is asked for
    struct ImpostorSigner(LocalKeySigner);

    #[async_trait]
    impl PersonalSigner for ImpostorSigner {
        async fn sign_personal_message(
            &self,
            _address: &Address,
            message: &str,
        ) -> std::result::Result<String, SignerError> {
            Ok(self.0.sign_message(message).unwrap().to_hex())
        }
    }

    struct FixedSigner(std::result::Result<String, SignerError>);

    #[async_trait]
    impl PersonalSigner for FixedSigner {
        async fn sign_personal_message(
            &self,
            _address: &Address,
            _message: &str,
        ) -> std::result::Result<String, SignerError> {
            self.0.clone()
        }
    }

    struct HangingSigner;

    #[async_trait]
    impl PersonalSigner for HangingSigner {
        async fn sign_personal_message(
            &self,
            _address: &Address,
            _message: &str,
        ) -> std::result::Result<String, SignerError> {
            std::future::pending().await
        }
    }

    fn challenge(id: &str, nonce: &str) -> NonceChallenge {
        NonceChallenge {
            id: id.to_string(),
            nonce: nonce.to_string(),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig::new("http://localhost:9999", ORIGIN)
    }

    fn flow(backend: MockBackend) -> AuthFlow<MockBackend> {
        AuthFlow::new(backend, &config())
    }

    fn signer() -> LocalKeySigner {
        LocalKeySigner::from_hex(KEY).unwrap()
    }

    #[tokio::test]
    async fn test_login_reaches_authenticated() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "login-to-app-12345")]));

        let credential = flow.login(signer.address(), 1, &signer).await.unwrap();
        assert_eq!(credential.user.id, "user-1");

        assert_eq!(flow.state(), FlowState::Authenticated);
        assert_eq!(flow.status(), AuthStatus::Authenticated);
        assert_eq!(flow.signed_challenge().unwrap().self_check, SelfCheck::Match);

        let nonce_calls = flow.backend().nonce_calls.lock().unwrap().clone();
        assert_eq!(
            nonce_calls,
            vec![NonceRequest {
                wallet_address: "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".to_string(),
                chain_id: "1".to_string(),
                url: ORIGIN.to_string(),
            }]
        );
        assert_eq!(flow.backend().exchanged_ids(), vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn test_step_by_step_transitions() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "login-to-app-12345")]));
        assert_eq!(flow.state(), FlowState::Idle);
        assert_eq!(flow.status(), AuthStatus::Unknown);

        let challenge = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        assert_eq!(flow.state(), FlowState::NonceRequested);
        assert_eq!(flow.status(), AuthStatus::Connected);
        assert_eq!(flow.challenge(), Some(&challenge));
        assert_eq!(flow.chain_id(), Some(1));

        let signed = flow.sign_challenge(&challenge, &signer).await.unwrap();
        assert_eq!(flow.state(), FlowState::Signing);
        assert_eq!(signed.challenge_id, "n1");

        flow.exchange(&signed.challenge_id, &signed.signature)
            .await
            .unwrap();
        assert_eq!(flow.state(), FlowState::Authenticated);
        assert!(flow.credential().is_some());
    }

    #[tokio::test]
    async fn test_nonce_failure_never_exchanges() {
        let signer = signer();
        let mut backend = MockBackend::new(&[]);
        backend.nonce_status = Some(500);
        let mut flow = flow(backend);

        let err = flow.login(signer.address(), 1, &signer).await.unwrap_err();
        assert!(matches!(err, AuthError::NonceRequest { .. }));
        assert_eq!(err.status(), Some(500));
        if let AuthError::NonceRequest { request, .. } = &err {
            assert_eq!(request.url, ORIGIN);
        }

        assert_eq!(flow.state(), FlowState::Failed(FailureKind::NonceRequest));
        assert_eq!(flow.status(), AuthStatus::Unknown);
        assert!(flow.backend().exchanged_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_signer_is_recorded_not_fatal() {
        let wallet = signer().address();
        let impostor = ImpostorSigner(LocalKeySigner::random());
        let impostor_address = impostor.0.address();
        let mut flow = flow(MockBackend::new(&[("n1", "login-to-app-12345")]));

        flow.login(wallet, 1, &impostor).await.unwrap();

        assert_eq!(
            flow.signed_challenge().unwrap().self_check,
            SelfCheck::Mismatch {
                expected: wallet,
                recovered: impostor_address,
            }
        );
        assert_eq!(flow.backend().exchanged_ids(), vec!["n1".to_string()]);
        assert_eq!(flow.state(), FlowState::Authenticated);
    }

    #[tokio::test]
    async fn test_self_check_can_be_skipped() {
        let signer = signer();
        let mut config = config();
        config.self_check = false;
        let mut flow = AuthFlow::new(MockBackend::new(&[("n1", "nonce")]), &config);

        flow.login(signer.address(), 1, &signer).await.unwrap();
        assert_eq!(flow.signed_challenge().unwrap().self_check, SelfCheck::Skipped);
    }

    #[tokio::test]
    async fn test_rejected_signing_is_user_aborted() {
        let wallet = signer().address();
        let mut flow = flow(MockBackend::new(&[("n1", "nonce")]));

        let err = flow
            .login(wallet, 1, &FixedSigner(Err(SignerError::Rejected)))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::UserAborted(_)));
        assert_eq!(flow.state(), FlowState::Failed(FailureKind::UserAborted));
        assert!(flow.challenge().is_none());
        assert!(flow.backend().exchanged_ids().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_signature_fails_attempt() {
        let wallet = signer().address();
        let mut flow = flow(MockBackend::new(&[("n1", "nonce")]));

        let err = flow
            .login(wallet, 1, &FixedSigner(Ok("0xdeadbeef".to_string())))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::MalformedSignature(_)));
        assert_eq!(
            flow.state(),
            FlowState::Failed(FailureKind::MalformedSignature)
        );
        assert!(flow.backend().exchanged_ids().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_failure_retires_challenge() {
        let signer = signer();
        let mut backend = MockBackend::new(&[("n1", "nonce")]);
        backend.exchange_status = Some(401);
        let mut flow = flow(backend);

        let challenge = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        let signed = flow.sign_challenge(&challenge, &signer).await.unwrap();

        let err = flow
            .exchange(&signed.challenge_id, &signed.signature)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Exchange { .. }));
        assert_eq!(err.status(), Some(401));
        assert_eq!(flow.state(), FlowState::Failed(FailureKind::Exchange));
        assert!(flow.credential().is_none());

        let err = flow
            .exchange(&signed.challenge_id, &signed.signature)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState { .. }));
        assert_eq!(flow.backend().exchanged_ids(), vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn test_new_attempt_abandons_previous_challenge() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "first"), ("n2", "second")]));

        let first = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        let second = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();

        let err = flow.sign_challenge(&first, &signer).await.unwrap_err();
        assert!(matches!(err, AuthError::StaleChallenge { .. }));
        assert_eq!(flow.state(), FlowState::NonceRequested);

        let signed = flow.sign_challenge(&second, &signer).await.unwrap();
        flow.exchange(&signed.challenge_id, &signed.signature)
            .await
            .unwrap();
        assert_eq!(flow.backend().exchanged_ids(), vec!["n2".to_string()]);
    }

    #[tokio::test]
    async fn test_exchange_rejects_foreign_challenge_id() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "nonce")]));

        let challenge = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        let signed = flow.sign_challenge(&challenge, &signer).await.unwrap();

        let err = flow.exchange("n0", &signed.signature).await.unwrap_err();
        assert!(matches!(err, AuthError::StaleChallenge { .. }));

        let other = signer.sign_message("other").unwrap().to_hex();
        let err = flow.exchange("n1", &other).await.unwrap_err();
        assert!(matches!(err, AuthError::StaleChallenge { .. }));

        // rejections leave the attempt intact
        assert_eq!(flow.state(), FlowState::Signing);
        flow.exchange("n1", &signed.signature.to_uppercase().replacen("0X", "0x", 1))
            .await
            .unwrap();
        assert_eq!(flow.state(), FlowState::Authenticated);
    }

    #[tokio::test]
    async fn test_reused_challenge_id_is_rejected() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "first"), ("n1", "replayed")]));

        flow.login(signer.address(), 1, &signer).await.unwrap();
        let err = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::ReusedChallenge(_)));
        assert_eq!(flow.state(), FlowState::Failed(FailureKind::ReusedChallenge));
        assert!(flow.credential().is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_calls_are_rejected() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "nonce")]));

        let err = flow
            .sign_challenge(&challenge("n1", "nonce"), &signer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidState {
                state: FlowState::Idle,
                ..
            }
        ));

        let err = flow.exchange("n1", "0x00").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidState { .. }));
        assert_eq!(flow.state(), FlowState::Idle);

        let challenge = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        let err = flow.exchange(&challenge.id, "0x00").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidState {
                state: FlowState::NonceRequested,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_signing_timeout_is_user_aborted() {
        let wallet = signer().address();
        let mut config = config();
        config.signing_timeout_secs = Some(1);
        let mut flow = AuthFlow::new(MockBackend::new(&[("n1", "nonce")]), &config);

        let err = flow.login(wallet, 1, &HangingSigner).await.unwrap_err();
        assert!(matches!(err, AuthError::UserAborted(_)));
        assert_eq!(flow.state(), FlowState::Failed(FailureKind::UserAborted));
    }

    #[tokio::test]
    async fn test_dropped_signing_cannot_be_exchanged() {
        let wallet = signer().address();
        let mut flow = flow(MockBackend::new(&[("n1", "nonce")]));

        let challenge = flow.request_nonce(wallet, 1, ORIGIN).await.unwrap();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            flow.sign_challenge(&challenge, &HangingSigner),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(flow.state(), FlowState::Failed(FailureKind::UserAborted));
        assert_eq!(flow.status(), AuthStatus::Unknown);
        assert!(flow.challenge().is_none());

        let err = flow.exchange("n1", "0x00").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidState {
                state: FlowState::Failed(FailureKind::UserAborted),
                ..
            }
        ));
        assert!(flow.retired.contains("n1"));

        flow.reset();
        assert_eq!(flow.state(), FlowState::Idle);
        assert!(flow.backend().exchanged_ids().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_signing_then_new_attempt() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "first"), ("n2", "second")]));

        let challenge = flow
            .request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        let _ = tokio::time::timeout(
            Duration::from_millis(20),
            flow.sign_challenge(&challenge, &HangingSigner),
        )
        .await;

        flow.login(signer.address(), 1, &signer).await.unwrap();
        assert_eq!(flow.state(), FlowState::Authenticated);
        assert_eq!(flow.backend().exchanged_ids(), vec!["n2".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_is_not_an_abandoned_attempt() {
        let signer = signer();
        let mut backend = MockBackend::new(&[("n1", "first"), ("n2", "second")]);
        backend.exchange_status = Some(401);
        let mut flow = flow(backend);

        flow.login(signer.address(), 1, &signer).await.unwrap_err();
        assert_eq!(flow.state(), FlowState::Failed(FailureKind::Exchange));
        assert_eq!(flow.abandon_attempt(), None);

        flow.request_nonce(signer.address(), 1, ORIGIN)
            .await
            .unwrap();
        let attempt_id = flow.attempt_id();
        assert!(attempt_id.is_some());
        assert_eq!(flow.abandon_attempt(), attempt_id);
        assert!(flow.retired.contains("n2"));
    }

    #[test]
    fn test_retired_challenges_evict_oldest() {
        let mut retired = RetiredChallenges::with_capacity(2);
        for id in ["n1", "n2", "n2", "n3"] {
            retired.insert(id.to_string());
        }

        assert_eq!(retired.len(), 2);
        assert!(!retired.contains("n1"));
        assert!(retired.contains("n2"));
        assert!(retired.contains("n3"));
    }

    #[tokio::test]
    async fn test_reset_clears_everything_and_is_idempotent() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "nonce")]));
        flow.login(signer.address(), 1, &signer).await.unwrap();

        flow.reset();
        assert_eq!(flow.state(), FlowState::Idle);
        assert_eq!(flow.status(), AuthStatus::Unknown);
        assert!(flow.challenge().is_none());
        assert!(flow.signed_challenge().is_none());
        assert!(flow.credential().is_none());
        assert!(flow.attempt_id().is_none());

        flow.reset();
        assert_eq!(flow.state(), FlowState::Idle);
        assert!(flow.credential().is_none());
    }

    #[tokio::test]
    async fn test_reset_after_failure_allows_retry() {
        let signer = signer();
        let mut flow = flow(MockBackend::new(&[("n1", "first"), ("n2", "second")]));

        flow.login(signer.address(), 1, &FixedSigner(Err(SignerError::Rejected)))
            .await
            .unwrap_err();
        flow.reset();

        flow.login(signer.address(), 1, &signer).await.unwrap();
        assert_eq!(flow.backend().exchanged_ids(), vec!["n2".to_string()]);
    }
}
