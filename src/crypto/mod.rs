//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 hashing
//! - secp256k1 key pairs used to authenticate protocol envelopes
//!
//! MuSig2 nonce and signature math is not implemented here; see
//! [`crate::session::MusigBackend`].

pub mod hash;
pub mod keys;

pub use hash::{random_id, sha256, sha256_hex, transcript_hash};
pub use keys::{public_key_from_hex, sign_message, verify_signature, KeyError, KeyPair};
