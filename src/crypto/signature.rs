use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};

use super::CryptoError;

const SERVER_KEY_EXPONENT: u32 = 65537;

/// Modulus of the key access points sign their Diffie-Hellman value with.
const SERVER_KEY_MODULUS: [u8; 256] = [
    0xac, 0xe0, 0x46, 0x0b, 0xff, 0xc2, 0x30, 0xaf, 0xf4, 0x6b, 0xfe, 0xc3, 0xbf, 0xbf, 0x86, 0x3d,
    0xa1, 0x91, 0xc6, 0xcc, 0x33, 0x6c, 0x93, 0xa1, 0x4f, 0xb3, 0xb0, 0x16, 0x12, 0xac, 0xac, 0x6a,
    0xf1, 0x80, 0xe7, 0xf6, 0x14, 0xd9, 0x42, 0x9d, 0xbe, 0x2e, 0x34, 0x66, 0x43, 0xe3, 0x62, 0xd2,
    0x32, 0x7a, 0x1a, 0x0d, 0x92, 0x3b, 0xae, 0xdd, 0x14, 0x02, 0xb1, 0x81, 0x55, 0x05, 0x61, 0x04,
    0xd5, 0x2c, 0x96, 0xa4, 0x4c, 0x1e, 0xcc, 0x02, 0x4a, 0xd4, 0xb2, 0x0c, 0x00, 0x1f, 0x17, 0xed,
    0xc2, 0x2f, 0xc4, 0x35, 0x21, 0xc8, 0xf0, 0xcb, 0xae, 0xd2, 0xad, 0xd7, 0x2b, 0x0f, 0x9d, 0xb3,
    0xc5, 0x32, 0x1a, 0x2a, 0xfe, 0x59, 0xf3, 0x5a, 0x0d, 0xac, 0x68, 0xf1, 0xfa, 0x62, 0x1e, 0xfb,
    0x2c, 0x8d, 0x0c, 0xb7, 0x39, 0x2d, 0x92, 0x47, 0xe3, 0xd7, 0x35, 0x1a, 0x6d, 0xbd, 0x24, 0xc2,
    0xae, 0x25, 0x5b, 0x88, 0xff, 0xab, 0x73, 0x29, 0x8a, 0x0b, 0xcc, 0xcd, 0x0c, 0x58, 0x67, 0x31,
    0x89, 0xe8, 0xbd, 0x34, 0x80, 0x78, 0x4a, 0x5f, 0xc9, 0x6b, 0x89, 0x9d, 0x95, 0x6b, 0xfc, 0x86,
    0xd7, 0x4f, 0x33, 0xa6, 0x78, 0x17, 0x96, 0xc9, 0xc3, 0x2d, 0x0d, 0x32, 0xa5, 0xab, 0xcd, 0x05,
    0x27, 0xe2, 0xf7, 0x10, 0xa3, 0x96, 0x13, 0xc4, 0x2f, 0x99, 0xc0, 0x27, 0xbf, 0xed, 0x04, 0x9c,
    0x3c, 0x27, 0x58, 0x04, 0xb6, 0xb2, 0x19, 0xf9, 0xc1, 0x2f, 0x02, 0xe9, 0x48, 0x63, 0xec, 0xa1,
    0xb6, 0x42, 0xa0, 0x9d, 0x48, 0x25, 0xf8, 0xb3, 0x9d, 0xd0, 0xe8, 0x6a, 0xf9, 0x48, 0x4d, 0xa1,
    0xc2, 0xba, 0x86, 0x30, 0x42, 0xea, 0x9d, 0xb3, 0x08, 0x6c, 0x19, 0x0e, 0x48, 0xb3, 0x9d, 0x66,
    0xeb, 0x00, 0x06, 0xa2, 0x5a, 0xee, 0xa1, 0x1b, 0x13, 0x87, 0x3c, 0xd7, 0x19, 0xe6, 0x55, 0xbd,
];

/// Public key used to authenticate the access point during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKey {
    key: RsaPublicKey,
}

impl ServerKey {
    /// Wraps an arbitrary RSA public key, e.g. one generated for a test server.
    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Builds a key from a big-endian modulus and the fixed exponent 65537.
    pub fn from_modulus(modulus: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from(SERVER_KEY_EXPONENT),
        )
        .map_err(|e| CryptoError::InvalidServerKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Checks a PKCS#1 v1.5 SHA-1 signature over `gs`.
    pub fn verify(&self, gs: &[u8], signature: &[u8]) -> bool {
        let hashed = Sha1::digest(gs);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &hashed, signature)
            .is_ok()
    }
}

impl Default for ServerKey {
    fn default() -> Self {
        Self {
            key: RsaPublicKey::new_unchecked(
                BigUint::from_bytes_be(&SERVER_KEY_MODULUS),
                BigUint::from(SERVER_KEY_EXPONENT),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    fn signed(gs: &[u8]) -> (ServerKey, Vec<u8>) {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let signature = private
            .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(gs))
            .unwrap();
        (ServerKey::from_public_key(private.to_public_key()), signature)
    }

    #[test]
    fn accepts_valid_signature() {
        let gs = vec![7u8; 96];
        let (key, signature) = signed(&gs);
        assert!(key.verify(&gs, &signature));
    }

    #[test]
    fn rejects_single_bit_flips() {
        let gs = vec![0x5au8; 96];
        let (key, signature) = signed(&gs);
        for bit in [0usize, 9, 300, 767] {
            let mut tampered = gs.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(!key.verify(&tampered, &signature));
        }
        for bit in [0usize, 100, 1023] {
            let mut tampered = signature.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(!key.verify(&gs, &tampered));
        }
    }

    #[test]
    fn default_key_rejects_foreign_signature() {
        let gs = vec![1u8; 96];
        let (_, signature) = signed(&gs);
        assert!(!ServerKey::default().verify(&gs, &signature));
    }

    #[test]
    fn default_key_matches_embedded_modulus() {
        assert_eq!(
            ServerKey::default(),
            ServerKey::from_modulus(&SERVER_KEY_MODULUS).unwrap()
        );
    }
}
