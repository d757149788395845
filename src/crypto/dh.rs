use rand::rngs::OsRng;
use rand::RngCore;
use rsa::BigUint;
use zeroize::Zeroizing;

use super::CryptoError;

const PRIVATE_KEY_LEN: usize = 95;

/// RFC 2409 "First Oakley Group" prime.
const DH_PRIME: [u8; 96] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

const DH_GENERATOR: u32 = 2;

/// Shared secret computed from the peer's public value; wiped on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Ephemeral Diffie-Hellman keypair, generated once per connection attempt.
///
/// The private scalar never leaves this struct and is zeroed on drop.
pub struct DhKeyPair {
    private: Zeroizing<Vec<u8>>,
    public: Vec<u8>,
}

impl DhKeyPair {
    /// Generates a keypair from the OS random source.
    pub fn generate() -> Self {
        let mut private = Zeroizing::new(vec![0u8; PRIVATE_KEY_LEN]);
        OsRng.fill_bytes(&mut private);
        Self::from_private(private)
    }

    fn from_private(private: Zeroizing<Vec<u8>>) -> Self {
        let exponent = BigUint::from_bytes_be(&private);
        let public = BigUint::from(DH_GENERATOR)
            .modpow(&exponent, &prime())
            .to_bytes_be();
        Self { private, public }
    }

    /// Public value `g^x mod p` as big-endian bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Computes `y^x mod p` for the peer's public value `y`.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let p = prime();
        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        if peer <= one || peer >= (&p - &one) {
            return Err(CryptoError::PeerKeyOutOfRange);
        }
        let exponent = BigUint::from_bytes_be(&self.private);
        Ok(Zeroizing::new(peer.modpow(&exponent, &p).to_bytes_be()))
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&DH_PRIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_on_shared_secret() {
        let client = DhKeyPair::generate();
        let server = DhKeyPair::generate();
        let a = client.shared_secret(server.public_key()).unwrap();
        let b = server.shared_secret(client.public_key()).unwrap();
        assert_eq!(*a, *b);
        assert!(a.len() <= DH_PRIME.len());
    }

    #[test]
    fn fresh_keypairs_differ() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn degenerate_peer_values_are_rejected() {
        let keys = DhKeyPair::generate();
        assert_eq!(
            keys.shared_secret(&[1]).unwrap_err(),
            CryptoError::PeerKeyOutOfRange
        );
        assert_eq!(
            keys.shared_secret(&[]).unwrap_err(),
            CryptoError::PeerKeyOutOfRange
        );
        assert_eq!(
            keys.shared_secret(&DH_PRIME).unwrap_err(),
            CryptoError::PeerKeyOutOfRange
        );
    }
}
