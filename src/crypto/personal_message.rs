use sha3::{Digest, Keccak256};

/// Header prepended to every personal message before hashing
///
/// The leading `0x19` byte keeps a signed message from ever being a valid
/// RLP-encoded transaction.
pub const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// Compute Keccak-256
///
/// This is the original Keccak padding used by Ethereum, not NIST SHA3-256.
/// Wallets and verifiers hash personal messages and derive addresses with it,
/// so swapping the digest breaks interoperability with every signer.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Encode a message in the Ethereum personal message format
///
/// Format: `"\x19Ethereum Signed Message:\n" + len(message) + message`, where
/// the length is the UTF-8 byte count written as decimal ASCII digits.
///
/// # Example
/// ```rust
/// use siwe_auth::crypto::personal_message::encode;
///
/// let encoded = encode("héllo");
/// assert_eq!(encoded, b"\x19Ethereum Signed Message:\n6h\xc3\xa9llo".to_vec());
/// ```
pub fn encode(message: &str) -> Vec<u8> {
    let payload = message.as_bytes();
    let length = payload.len().to_string();

    let mut encoded =
        Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + length.len() + payload.len());
    encoded.extend_from_slice(PERSONAL_MESSAGE_PREFIX.as_bytes());
    encoded.extend_from_slice(length.as_bytes());
    encoded.extend_from_slice(payload);
    encoded
}

/// Hash a message the way `personal_sign` does before signing it
///
/// Returns `keccak256(encode(message))`.
pub fn hash(message: &str) -> [u8; 32] {
    keccak256(&encode(message))
}

/// Read the declared payload length back out of an encoded personal message
///
/// The length digits run up to the first byte of the payload, so a payload
/// that starts with an ASCII digit is ambiguous on its own. The payload is
/// located by trying each split and keeping the one whose declared length
/// matches the bytes that follow it.
///
/// Returns `None` when the header is missing or no split is consistent.
pub fn declared_length(encoded: &[u8]) -> Option<usize> {
    let rest = encoded.strip_prefix(PERSONAL_MESSAGE_PREFIX.as_bytes())?;
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();

    (1..=digits).find_map(|split| {
        let declared: usize = std::str::from_utf8(&rest[..split]).ok()?.parse().ok()?;
        (declared == rest.len() - split).then_some(declared)
    })
}
