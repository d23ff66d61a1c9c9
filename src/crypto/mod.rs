pub mod address;
pub mod personal_message;
pub mod recovery;

// Re-export main functions for easier access
pub use address::Address;
pub use personal_message::{encode, hash, keccak256};
pub use recovery::{recover_signer, recover_signer_for_message, RecoverableSignature};
