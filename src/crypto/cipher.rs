//! Framed, authenticated packet cipher installed once the handshake is done.
//!
//! Each direction owns a key and a 64-bit sequence number. A frame on the
//! wire is `[u16 BE ciphertext length][AEAD(cmd ++ payload)]`; the length
//! prefix is bound as associated data and the nonce is derived from the
//! sequence number, so a dropped, replayed or reordered frame fails the tag
//! check. The receive side fails closed: after one bad frame it refuses to
//! decode anything else.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use tokio_util::codec::{Decoder, Encoder};

use super::CryptoError;
use crate::error::SessionError;
use crate::messages::Packet;

const HEADER_LEN: usize = 2;
const TAG_LEN: usize = 16;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - TAG_LEN - 1;

/// Both directions of a freshly installed channel.
pub struct CipherPair {
    pub send: SendCipher,
    pub recv: RecvCipher,
}

impl CipherPair {
    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            send: SendCipher::new(send_key),
            recv: RecvCipher::new(recv_key),
        }
    }

    pub fn split(self) -> (SendCipher, RecvCipher) {
        (self.send, self.recv)
    }
}

fn nonce_for(seq: u64) -> Nonce {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&seq.to_be_bytes());
    n.into()
}

/// Encrypting half; implements [`Encoder`] for [`Packet`].
pub struct SendCipher {
    cipher: ChaCha20Poly1305,
    seq: u64,
}

impl SendCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            seq: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl Encoder<Packet> for SendCipher {
    type Error = SessionError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_LEN {
            return Err(SessionError::protocol(format!(
                "payload of {} bytes exceeds frame limit",
                item.payload.len()
            )));
        }
        let next = self
            .seq
            .checked_add(1)
            .ok_or(CryptoError::Cipher("send sequence exhausted"))?;

        let mut plain = Vec::with_capacity(1 + item.payload.len());
        plain.push(item.cmd);
        plain.extend_from_slice(&item.payload);
        let header = ((plain.len() + TAG_LEN) as u16).to_be_bytes();

        let sealed = self
            .cipher
            .encrypt(
                &nonce_for(self.seq),
                Payload {
                    msg: &plain,
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::Cipher("encrypt"))?;

        dst.reserve(HEADER_LEN + sealed.len());
        dst.put_slice(&header);
        dst.put_slice(&sealed);
        self.seq = next;
        Ok(())
    }
}

/// Decrypting half; implements [`Decoder`] yielding [`Packet`]s.
pub struct RecvCipher {
    cipher: ChaCha20Poly1305,
    seq: u64,
    failed: bool,
}

impl RecvCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            seq: 0,
            failed: false,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    fn poison(&mut self, detail: &str) -> SessionError {
        self.failed = true;
        SessionError::protocol(detail.to_string())
    }
}

impl Decoder for RecvCipher {
    type Item = Packet;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Self::Error> {
        if self.failed {
            return Err(SessionError::protocol("cipher channel is desynchronised"));
        }
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len < TAG_LEN + 1 {
            return Err(self.poison("frame shorter than its tag"));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_LEN);
        let body = src.split_to(len);
        let plain = match self.cipher.decrypt(
            &nonce_for(self.seq),
            Payload {
                msg: &body,
                aad: &header,
            },
        ) {
            Ok(plain) => plain,
            Err(_) => return Err(self.poison("frame authentication failed")),
        };
        self.seq = match self.seq.checked_add(1) {
            Some(next) => next,
            None => return Err(self.poison("receive sequence exhausted")),
        };

        let mut plain = Bytes::from(plain);
        let cmd = plain.get_u8();
        Ok(Some(Packet {
            cmd,
            payload: plain,
        }))
    }
}

impl std::fmt::Debug for SendCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendCipher").field("seq", &self.seq).finish()
    }
}

impl std::fmt::Debug for RecvCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvCipher")
            .field("seq", &self.seq)
            .field("failed", &self.failed)
            .finish()
    }
}
