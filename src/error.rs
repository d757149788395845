use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::messages::keyexchange::ErrorCode;
use crate::session::state::SessionStateError;

/// Errors surfaced by the session transport.
///
/// The variants follow the recovery policy of the session: `Signature`,
/// `Handshake` and `Authentication` are never retried inside a single
/// attempt, `Protocol` and `Io` raised mid-session trigger reconnection, and
/// `Closed` / `Unavailable` are what gated accessors report instead of
/// blocking forever.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("server signature verification failed")]
    Signature,
    #[error("login failed during handshake: {reason}")]
    Handshake { reason: LoginFailure },
    #[error("authentication rejected: {code}")]
    Authentication { code: LoginFailure },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("session is closed")]
    Closed,
    #[error("session unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("{0} handler is not registered")]
    NotRegistered(&'static str),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid session state: {0}")]
    InvalidState(#[from] SessionStateError),
}

impl SessionError {
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        SessionError::Protocol(detail.into())
    }
}

impl From<prost::DecodeError> for SessionError {
    fn from(err: prost::DecodeError) -> Self {
        SessionError::Protocol(format!("decode: {}", err))
    }
}

/// Login failure details reported by the access point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFailure {
    pub code: Option<ErrorCode>,
    pub raw_code: i32,
    pub description: Option<String>,
}

impl LoginFailure {
    pub(crate) fn from_message(msg: &crate::messages::keyexchange::ApLoginFailed) -> Self {
        Self {
            code: ErrorCode::try_from(msg.error_code).ok(),
            raw_code: msg.error_code,
            description: msg.error_description.clone(),
        }
    }
}

impl std::fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}", code.as_str())?,
            None => write!(f, "unknown error code {}", self.raw_code)?,
        }
        if let Some(description) = &self.description {
            write!(f, " ({})", description)?;
        }
        Ok(())
    }
}
