use std::fmt;

use crate::error::SessionError;
use crate::messages::{ApWelcome, AuthenticationType, LoginCredentials};

/// Login identity sent in the encrypted client response.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub auth_type: AuthenticationType,
    pub auth_data: Vec<u8>,
}

impl Credentials {
    pub fn user_pass(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth_type: AuthenticationType::UserPass,
            auth_data: password.into().into_bytes(),
        }
    }

    /// Reusable credentials previously handed out by the access point.
    pub fn stored(username: impl Into<String>, blob: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            auth_type: AuthenticationType::StoredSpotifyCredentials,
            auth_data: blob.into(),
        }
    }

    /// Identity used to re-authenticate after a reconnection.
    pub fn from_welcome(welcome: &ApWelcome) -> Result<Self, SessionError> {
        let auth_type = AuthenticationType::try_from(welcome.reusable_auth_credentials_type)
            .map_err(|_| {
                SessionError::protocol(format!(
                    "unknown reusable credentials type {}",
                    welcome.reusable_auth_credentials_type
                ))
            })?;
        Ok(Self {
            username: welcome.canonical_username.clone(),
            auth_type,
            auth_data: welcome.reusable_auth_credentials.clone(),
        })
    }

    pub(crate) fn to_message(&self) -> LoginCredentials {
        LoginCredentials {
            username: Some(self.username.clone()),
            typ: self.auth_type as i32,
            auth_data: Some(self.auth_data.clone()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_yields_reusable_identity() {
        let welcome = ApWelcome {
            canonical_username: "listener".into(),
            reusable_auth_credentials_type: AuthenticationType::StoredSpotifyCredentials as i32,
            reusable_auth_credentials: vec![9, 8, 7],
            ..ApWelcome::default()
        };
        let creds = Credentials::from_welcome(&welcome).unwrap();
        assert_eq!(creds, Credentials::stored("listener", vec![9, 8, 7]));
        let msg = creds.to_message();
        assert_eq!(msg.username.as_deref(), Some("listener"));
        assert_eq!(msg.typ, 1);
    }

    #[test]
    fn debug_hides_secret() {
        let creds = Credentials::user_pass("someone", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn unknown_credentials_type_is_rejected() {
        let welcome = ApWelcome {
            reusable_auth_credentials_type: 42,
            ..ApWelcome::default()
        };
        assert!(Credentials::from_welcome(&welcome).is_err());
    }
}
