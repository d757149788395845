//! Cryptographic building blocks of the access point handshake.
//!
//! * [`dh`]: ephemeral Diffie-Hellman over the 768-bit MODP group.
//! * [`signature`]: RSA/SHA-1 verification of the server's public value.
//! * [`kdf`]: the HMAC-SHA1 ladder that turns the transcript into keys.
//! * [`cipher`]: the framed, authenticated channel installed afterwards.

pub mod cipher;
pub mod dh;
pub mod kdf;
pub mod signature;

use thiserror::Error;

pub use cipher::{CipherPair, RecvCipher, SendCipher};
pub use dh::{DhKeyPair, SharedSecret};
pub use kdf::{challenge_mac, derive_keys, DerivedKeys};
pub use signature::ServerKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("peer public value out of range")]
    PeerKeyOutOfRange,
    #[error("invalid server key: {0}")]
    InvalidServerKey(String),
    #[error("mac init: {0}")]
    Mac(String),
    #[error("cipher failure: {0}")]
    Cipher(&'static str),
}
