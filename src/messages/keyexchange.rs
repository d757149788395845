//! Plaintext handshake messages exchanged before the cipher is installed.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    #[prost(message, required, tag = "10")]
    pub build_info: BuildInfo,
    #[prost(enumeration = "Cryptosuite", repeated, packed = "false", tag = "30")]
    pub cryptosuites_supported: Vec<i32>,
    #[prost(message, required, tag = "50")]
    pub login_crypto_hello: LoginCryptoHelloUnion,
    #[prost(bytes = "vec", required, tag = "60")]
    pub client_nonce: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "70")]
    pub padding: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildInfo {
    #[prost(enumeration = "Product", required, tag = "10")]
    pub product: i32,
    #[prost(enumeration = "Platform", required, tag = "30")]
    pub platform: i32,
    #[prost(uint64, required, tag = "40")]
    pub version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoHelloUnion {
    #[prost(message, optional, tag = "10")]
    pub diffie_hellman: Option<LoginCryptoDiffieHellmanHello>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoDiffieHellmanHello {
    #[prost(bytes = "vec", required, tag = "10")]
    pub gc: Vec<u8>,
    #[prost(uint32, required, tag = "20")]
    pub server_keys_known: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApResponseMessage {
    #[prost(message, optional, tag = "10")]
    pub challenge: Option<ApChallenge>,
    #[prost(message, optional, tag = "30")]
    pub login_failed: Option<ApLoginFailed>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApChallenge {
    #[prost(message, required, tag = "10")]
    pub login_crypto_challenge: LoginCryptoChallengeUnion,
    #[prost(bytes = "vec", optional, tag = "50")]
    pub server_nonce: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoChallengeUnion {
    #[prost(message, optional, tag = "10")]
    pub diffie_hellman: Option<LoginCryptoDiffieHellmanChallenge>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoDiffieHellmanChallenge {
    #[prost(bytes = "vec", required, tag = "10")]
    pub gs: Vec<u8>,
    #[prost(int32, required, tag = "20")]
    pub server_signature_key: i32,
    #[prost(bytes = "vec", required, tag = "30")]
    pub gs_signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApLoginFailed {
    #[prost(enumeration = "ErrorCode", required, tag = "10")]
    pub error_code: i32,
    #[prost(int32, optional, tag = "20")]
    pub retry_delay: Option<i32>,
    #[prost(int32, optional, tag = "30")]
    pub expiry: Option<i32>,
    #[prost(string, optional, tag = "40")]
    pub error_description: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientResponsePlaintext {
    #[prost(message, required, tag = "10")]
    pub login_crypto_response: LoginCryptoResponseUnion,
    #[prost(message, required, tag = "20")]
    pub pow_response: PowResponseUnion,
    #[prost(message, required, tag = "30")]
    pub crypto_response: CryptoResponseUnion,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoResponseUnion {
    #[prost(message, optional, tag = "10")]
    pub diffie_hellman: Option<LoginCryptoDiffieHellmanResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginCryptoDiffieHellmanResponse {
    #[prost(bytes = "vec", required, tag = "10")]
    pub hmac: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PowResponseUnion {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CryptoResponseUnion {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Product {
    Client = 0,
    Libspotify = 1,
    Mobile = 2,
    Partner = 3,
    LibspotifyEmbedded = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Platform {
    Win32X86 = 0,
    OsxX86 = 1,
    LinuxX86 = 2,
    IphoneArm = 3,
    AndroidArm = 6,
    LinuxX8664 = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Cryptosuite {
    Shannon = 0,
    Rc4Sha1Hmac = 1,
}

/// Reason codes carried by `ApLoginFailed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    ProtocolError = 0,
    TryAnotherAp = 2,
    BadConnectionId = 5,
    TravelRestriction = 9,
    PremiumAccountRequired = 11,
    BadCredentials = 12,
    CouldNotValidateCredentials = 13,
    AccountExists = 14,
    ExtraVerificationRequired = 15,
    InvalidAppKey = 16,
    ApplicationBanned = 17,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::TryAnotherAp => "TryAnotherAP",
            ErrorCode::BadConnectionId => "BadConnectionId",
            ErrorCode::TravelRestriction => "TravelRestriction",
            ErrorCode::PremiumAccountRequired => "PremiumAccountRequired",
            ErrorCode::BadCredentials => "BadCredentials",
            ErrorCode::CouldNotValidateCredentials => "CouldNotValidateCredentials",
            ErrorCode::AccountExists => "AccountExists",
            ErrorCode::ExtraVerificationRequired => "ExtraVerificationRequired",
            ErrorCode::InvalidAppKey => "InvalidAppKey",
            ErrorCode::ApplicationBanned => "ApplicationBanned",
        }
    }
}
