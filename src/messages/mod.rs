//! Wire messages: protobuf bodies for the handshake and login, plus the
//! command-tag namespace of post-handshake packets.

pub mod authentication;
pub mod keyexchange;

use std::fmt;

use bytes::Bytes;

pub use authentication::{ApWelcome, AuthenticationType, LoginCredentials};
pub use keyexchange::{ApLoginFailed, ErrorCode};

/// Command tags understood by the session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    SecretBlock = 0x02,
    Ping = 0x04,
    StreamChunk = 0x08,
    StreamChunkRes = 0x09,
    ChannelError = 0x0a,
    ChannelAbort = 0x0b,
    RequestKey = 0x0c,
    AesKey = 0x0d,
    AesKeyError = 0x0e,
    Unknown0x0f = 0x0f,
    Unknown0x10 = 0x10,
    Image = 0x19,
    CountryCode = 0x1b,
    UnknownDataAllZeros = 0x1f,
    Pong = 0x49,
    PongAck = 0x4a,
    Pause = 0x4b,
    Unknown0x4f = 0x4f,
    ProductInfo = 0x50,
    LegacyWelcome = 0x69,
    PreferredLocale = 0x74,
    LicenseVersion = 0x76,
    TrackEndedTime = 0x82,
    Login = 0xab,
    ApWelcome = 0xac,
    AuthFailure = 0xad,
    MercuryReq = 0xb2,
    MercurySub = 0xb3,
    MercuryUnsub = 0xb4,
    MercuryEvent = 0xb5,
    Unknown0xb6 = 0xb6,
}

impl PacketType {
    pub fn is_mercury(&self) -> bool {
        matches!(
            self,
            PacketType::MercuryReq
                | PacketType::MercurySub
                | PacketType::MercuryUnsub
                | PacketType::MercuryEvent
        )
    }

    pub fn is_audio_key(&self) -> bool {
        matches!(self, PacketType::AesKey | PacketType::AesKeyError)
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, PacketType::ChannelError | PacketType::StreamChunkRes)
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use PacketType::*;
        let ty = match value {
            0x02 => SecretBlock,
            0x04 => Ping,
            0x08 => StreamChunk,
            0x09 => StreamChunkRes,
            0x0a => ChannelError,
            0x0b => ChannelAbort,
            0x0c => RequestKey,
            0x0d => AesKey,
            0x0e => AesKeyError,
            0x0f => Unknown0x0f,
            0x10 => Unknown0x10,
            0x19 => Image,
            0x1b => CountryCode,
            0x1f => UnknownDataAllZeros,
            0x49 => Pong,
            0x4a => PongAck,
            0x4b => Pause,
            0x4f => Unknown0x4f,
            0x50 => ProductInfo,
            0x69 => LegacyWelcome,
            0x74 => PreferredLocale,
            0x76 => LicenseVersion,
            0x82 => TrackEndedTime,
            0xab => Login,
            0xac => ApWelcome,
            0xad => AuthFailure,
            0xb2 => MercuryReq,
            0xb3 => MercurySub,
            0xb4 => MercuryUnsub,
            0xb5 => MercuryEvent,
            0xb6 => Unknown0xb6,
            other => return Err(other),
        };
        Ok(ty)
    }
}

/// Unit exchanged once the cipher is installed.
///
/// The raw command byte is kept so unknown tags survive decoding and can be
/// logged by the dispatcher.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub cmd: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(cmd: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd: cmd.into(),
            payload: payload.into(),
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.cmd).ok()
    }

    pub fn is(&self, ty: PacketType) -> bool {
        self.cmd == ty as u8
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("cmd", &format_args!("{:#04x}", self.cmd))
            .field("len", &self.payload.len())
            .finish()
    }
}
