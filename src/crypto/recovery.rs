use std::fmt;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

use crate::{
    crypto::{address::Address, personal_message},
    error::{AuthError, Result},
};

/// Offset wallets add to the recovery id in `eth_sign`/`personal_sign` output
const LEGACY_V_OFFSET: u8 = 27;

/// How a signer encoded the trailing recovery byte `v`
///
/// Signers disagree here: some return the bare recovery id, others the
/// pre-EIP-155 form offset by 27. Both are accepted and mapped onto the same
/// recovery id before public key recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryEncoding {
    /// `v` is `0` or `1`
    Raw,
    /// `v` is `27` or `28`
    Legacy,
}

/// A recovery byte mapped onto the recovery id domain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormalizedV {
    pub encoding: RecoveryEncoding,
    /// Parity of the y-coordinate of the signature's `R` point
    pub y_odd: bool,
}

impl NormalizedV {
    /// Normalize a raw `v` byte
    ///
    /// # Errors
    /// - `MalformedSignature` - `v` is not one of 0, 1, 27 or 28
    pub fn from_byte(v: u8) -> Result<Self> {
        let (encoding, parity) = match v {
            0 | 1 => (RecoveryEncoding::Raw, v),
            27 | 28 => (RecoveryEncoding::Legacy, v - LEGACY_V_OFFSET),
            other => {
                return Err(AuthError::MalformedSignature(format!(
                    "recovery byte {other} is not one of 0, 1, 27, 28"
                )))
            }
        };
        Ok(Self {
            encoding,
            y_odd: parity == 1,
        })
    }

    pub fn recovery_id(&self) -> RecoveryId {
        RecoveryId::new(self.y_odd, false)
    }
}

/// A 65-byte `r ‖ s ‖ v` signature as produced by `personal_sign`
///
/// The 64-byte EIP-2098 compact form is accepted on input and expanded into
/// the same triple.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl RecoverableSignature {
    /// Parse a hex-encoded signature, with or without the `0x` prefix
    ///
    /// Only the shape is checked here; `v` is validated by
    /// [`RecoverableSignature::normalized_v`] and `(r, s)` by recovery.
    ///
    /// # Errors
    /// - `MalformedSignature` - not hex, or neither 65 nor 64 bytes
    pub fn from_hex(signature_hex: &str) -> Result<Self> {
        let trimmed = signature_hex.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| AuthError::MalformedSignature(format!("invalid hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Split `r ‖ s ‖ v`, or the compact `r ‖ yParityAndS`
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        match bytes.len() {
            65 => {
                r.copy_from_slice(&bytes[..32]);
                s.copy_from_slice(&bytes[32..64]);
                Ok(Self { r, s, v: bytes[64] })
            }
            64 => {
                r.copy_from_slice(&bytes[..32]);
                s.copy_from_slice(&bytes[32..]);
                // EIP-2098: the top bit of s carries the y parity
                let y_odd = s[0] & 0x80 != 0;
                s[0] &= 0x7f;
                Ok(Self {
                    r,
                    s,
                    v: LEGACY_V_OFFSET + u8::from(y_odd),
                })
            }
            len => Err(AuthError::MalformedSignature(format!(
                "expected 65 or 64 bytes, got {len}"
            ))),
        }
    }

    /// Build a signature from k256 output, using the legacy `27/28` form for `v`
    pub fn from_parts(signature: &Signature, recovery_id: RecoveryId) -> Self {
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Self {
            r,
            s,
            v: LEGACY_V_OFFSET + u8::from(recovery_id.is_y_odd()),
        }
    }

    pub fn normalized_v(&self) -> Result<NormalizedV> {
        NormalizedV::from_byte(self.v)
    }

    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }

    /// Lowercase `0x`-prefixed hex of the 65 signature bytes
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    /// Recover the address that produced this signature over `digest`
    pub fn recover(&self, digest: &[u8; 32]) -> Result<Address> {
        let normalized = self.normalized_v()?;

        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&self.r);
        rs[32..].copy_from_slice(&self.s);
        let signature = Signature::from_slice(&rs)
            .map_err(|e| AuthError::RecoveryFailure(format!("invalid r or s: {e}")))?;

        // k256 only verifies low-s signatures; the high-s twin of a signature
        // recovers the same key once s is negated and the parity flipped.
        let (signature, recovery_id) = match signature.normalize_s() {
            Some(low_s) => (low_s, RecoveryId::new(!normalized.y_odd, false)),
            None => (signature, normalized.recovery_id()),
        };

        let verifying_key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            .map_err(|e| AuthError::RecoveryFailure(format!("public key recovery failed: {e}")))?;

        Ok(Address::from_public_key(&verifying_key))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecoverableSignature")
            .field(&self.to_hex())
            .finish()
    }
}

/// Recover the signer address from a hex signature and a 32-byte digest
///
/// Recovery never checks who the signer *should* be: any well-formed
/// signature yields some address, and callers compare it to the one they
/// expect.
///
/// # Errors
/// - `MalformedSignature` - not hex, not 65 (or compact 64) bytes, or `v` outside 0/1/27/28
/// - `RecoveryFailure` - `r`/`s` out of range or no curve point for `r`
///
/// # Example
/// ```rust
/// use siwe_auth::crypto::recovery::recover_signer;
/// use siwe_auth::AuthError;
///
/// let result = recover_signer("0x1234", &[0u8; 32]);
/// assert!(matches!(result, Err(AuthError::MalformedSignature(_))));
/// ```
pub fn recover_signer(signature_hex: &str, digest: &[u8; 32]) -> Result<Address> {
    RecoverableSignature::from_hex(signature_hex)?.recover(digest)
}

/// Recover the signer of a personal message
pub fn recover_signer_for_message(signature_hex: &str, message: &str) -> Result<Address> {
    recover_signer(signature_hex, &personal_message::hash(message))
}
