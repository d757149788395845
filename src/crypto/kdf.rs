use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::CryptoError;

type HmacSha1 = Hmac<Sha1>;

const DIGEST_LEN: usize = 0x14;
const ROUNDS: u8 = 5;
pub const DERIVED_LEN: usize = DIGEST_LEN * ROUNDS as usize;

/// 0x54 bytes of key material produced by the HMAC ladder.
///
/// Layout: `[0x00, 0x14)` challenge key, `[0x14, 0x34)` send key,
/// `[0x34, 0x54)` receive key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    material: [u8; DERIVED_LEN],
}

impl DerivedKeys {
    pub fn challenge_key(&self) -> &[u8] {
        &self.material[..0x14]
    }

    pub fn send_key(&self) -> Zeroizing<[u8; 32]> {
        self.key_at(0x14)
    }

    pub fn recv_key(&self) -> Zeroizing<[u8; 32]> {
        self.key_at(0x34)
    }

    fn key_at(&self, start: usize) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&self.material[start..start + 32]);
        key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.material
    }
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKeys(..)")
    }
}

/// Runs five HMAC-SHA1 rounds keyed by the shared secret, each over
/// `transcript ++ [round]` for rounds 1 through 5.
pub fn derive_keys(shared_secret: &[u8], transcript: &[u8]) -> Result<DerivedKeys, CryptoError> {
    let mut material = [0u8; DERIVED_LEN];
    for round in 1..=ROUNDS {
        let mut mac = HmacSha1::new_from_slice(shared_secret)
            .map_err(|e| CryptoError::Mac(e.to_string()))?;
        mac.update(transcript);
        mac.update(&[round]);
        let start = (round - 1) as usize * DIGEST_LEN;
        material[start..start + DIGEST_LEN].copy_from_slice(&mac.finalize().into_bytes());
    }
    Ok(DerivedKeys { material })
}

/// Proof of key possession sent back in the plaintext client response.
pub fn challenge_mac(keys: &DerivedKeys, transcript: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = HmacSha1::new_from_slice(keys.challenge_key())
        .map_err(|e| CryptoError::Mac(e.to_string()))?;
    mac.update(transcript);
    Ok(mac.finalize().into_bytes().to_vec())
}
