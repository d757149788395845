//! Plaintext key exchange with an access point.
//!
//! The client sends a hello carrying its Diffie-Hellman value, reads the
//! signed server value, derives keys from the exact bytes exchanged so far,
//! proves possession of those keys and finally gives the server one short
//! window to reject the login before the cipher is installed. There are no
//! retries at this layer; every failure ends the attempt.

pub mod transport;

use std::time::Duration;

use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::{challenge_mac, derive_keys, CipherPair, DhKeyPair, ServerKey};
use crate::error::{LoginFailure, SessionError};
use crate::messages::keyexchange::{
    ApLoginFailed, ApResponseMessage, BuildInfo, ClientHello, ClientResponsePlaintext,
    CryptoResponseUnion, Cryptosuite, LoginCryptoDiffieHellmanHello,
    LoginCryptoDiffieHellmanResponse, LoginCryptoHelloUnion, LoginCryptoResponseUnion, Platform,
    PowResponseUnion, Product,
};
use transport::{read_plain, read_plain_within, write_plain, EarlyRead};

pub use transport::{AccessPointResolver, ApStream, BoxedStream, Endpoint, TcpResolver};

/// Prefix of the client hello; the only message framed with one.
pub const HELLO_PREFIX: [u8; 2] = [0x00, 0x04];
const CLIENT_NONCE_LEN: usize = 0x10;
const HELLO_PADDING: u8 = 0x1e;
const BUILD_VERSION: u64 = 110_713_766;

/// Exact bytes of the unencrypted exchange, in order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    bytes: Vec<u8>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Result of the bounded read following the client response.
#[derive(Debug, Clone, PartialEq)]
pub enum EarlyFailure {
    /// The server stayed silent; the login may proceed.
    Timeout,
    /// The server rejected the login outright.
    Message(ApLoginFailed),
}

/// Drives one handshake attempt over an already connected stream.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub server_key: ServerKey,
    pub early_failure_timeout: Duration,
}

impl ClientHandshake {
    pub fn new(server_key: ServerKey, early_failure_timeout: Duration) -> Self {
        Self {
            server_key,
            early_failure_timeout,
        }
    }

    /// Runs the full exchange and returns the installed cipher.
    pub async fn run<S>(&self, stream: &mut S) -> Result<CipherPair, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let keys = DhKeyPair::generate();
        let mut transcript = Transcript::new();

        let hello = build_hello(&keys);
        let sent = write_plain(stream, &HELLO_PREFIX, &hello.encode_to_vec()).await?;
        transcript.append(&sent);

        let received = read_plain(stream).await?;
        transcript.append(&received);
        let response = ApResponseMessage::decode(&received[4..])?;
        if let Some(failed) = response.login_failed.as_ref() {
            return Err(SessionError::Handshake {
                reason: LoginFailure::from_message(failed),
            });
        }
        let challenge = response
            .challenge
            .and_then(|c| c.login_crypto_challenge.diffie_hellman)
            .ok_or_else(|| SessionError::protocol("response carries no DH challenge"))?;

        if !self
            .server_key
            .verify(&challenge.gs, &challenge.gs_signature)
        {
            return Err(SessionError::Signature);
        }

        let derived = {
            let shared = keys.shared_secret(&challenge.gs)?;
            derive_keys(&shared, transcript.as_bytes())?
        };
        let proof = challenge_mac(&derived, transcript.as_bytes())?;
        write_plain(stream, &[], &build_response(proof).encode_to_vec()).await?;

        match self.check_early_failure(stream).await? {
            EarlyFailure::Timeout => {}
            EarlyFailure::Message(failed) => {
                return Err(SessionError::Handshake {
                    reason: LoginFailure::from_message(&failed),
                })
            }
        }

        tracing::debug!("handshake complete, installing cipher");
        Ok(CipherPair::new(&derived.send_key(), &derived.recv_key()))
    }

    async fn check_early_failure<S>(&self, stream: &mut S) -> Result<EarlyFailure, SessionError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        match read_plain_within(stream, self.early_failure_timeout).await? {
            EarlyRead::Timeout => Ok(EarlyFailure::Timeout),
            EarlyRead::Message(frame) => {
                let response = ApResponseMessage::decode(&frame[4..])?;
                response
                    .login_failed
                    .map(EarlyFailure::Message)
                    .ok_or_else(|| SessionError::protocol("unexpected message after client response"))
            }
        }
    }
}

fn build_hello(keys: &DhKeyPair) -> ClientHello {
    let mut nonce = vec![0u8; CLIENT_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    ClientHello {
        build_info: BuildInfo {
            product: Product::Partner as i32,
            platform: Platform::LinuxX86 as i32,
            version: BUILD_VERSION,
        },
        cryptosuites_supported: vec![Cryptosuite::Shannon as i32],
        login_crypto_hello: LoginCryptoHelloUnion {
            diffie_hellman: Some(LoginCryptoDiffieHellmanHello {
                gc: keys.public_key().to_vec(),
                server_keys_known: 1,
            }),
        },
        client_nonce: nonce,
        padding: Some(vec![HELLO_PADDING]),
    }
}

fn build_response(hmac: Vec<u8>) -> ClientResponsePlaintext {
    ClientResponsePlaintext {
        login_crypto_response: LoginCryptoResponseUnion {
            diffie_hellman: Some(LoginCryptoDiffieHellmanResponse { hmac }),
        },
        pow_response: PowResponseUnion {},
        crypto_response: CryptoResponseUnion {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_carries_public_value_nonce_and_padding() {
        let keys = DhKeyPair::generate();
        let hello = build_hello(&keys);
        let decoded = ClientHello::decode(hello.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.client_nonce.len(), 16);
        assert_eq!(decoded.padding, Some(vec![0x1e]));
        assert_eq!(decoded.cryptosuites_supported, vec![Cryptosuite::Shannon as i32]);
        assert_eq!(
            decoded.login_crypto_hello.diffie_hellman.unwrap().gc,
            keys.public_key()
        );
    }

    #[test]
    fn transcript_is_exact_concatenation() {
        let mut transcript = Transcript::new();
        transcript.append(&[0, 4, 0, 0, 0, 7, 1]);
        transcript.append(&[0, 0, 0, 5, 2]);
        assert_eq!(transcript.as_bytes(), &[0, 4, 0, 0, 0, 7, 1, 0, 0, 0, 5, 2]);
    }
}
