use std::error::Error;

use connect_session::config::ConfigError;
use connect_session::messages::AuthenticationType;
use connect_session::{
    AccessPointResolver, Credentials, PacketType, ServerKey, Session, SessionConfig,
    SessionError, SessionState, TcpResolver,
};
use tokio::net::TcpListener;

#[test]
fn builder_rejects_invalid_config() {
    let config = SessionConfig {
        preferred_locale: "xyz".into(),
        ..SessionConfig::default()
    };
    let err = Session::builder(config).build().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Config(ConfigError::InvalidLocale(_))
    ));
}

#[test]
fn fresh_session_is_idle() {
    let config = SessionConfig {
        device_id: "idle-device".into(),
        ..SessionConfig::default()
    };
    let session = Session::builder(config).build().unwrap();
    assert_eq!(session.state(), SessionState::Init);
    assert_eq!(session.device_id(), "idle-device");
    assert_eq!(session.country_code(), None);
}

#[test]
fn credential_constructors() {
    let creds = Credentials::user_pass("someone", "pw");
    assert_eq!(creds.auth_type, AuthenticationType::UserPass);
    assert_eq!(creds.auth_data, b"pw");

    let stored = Credentials::stored("someone", vec![1, 2]);
    assert_eq!(stored.auth_type, AuthenticationType::StoredSpotifyCredentials);
}

#[test]
fn packet_type_namespace() {
    assert_eq!(PacketType::try_from(0x04), Ok(PacketType::Ping));
    assert_eq!(PacketType::try_from(0xb5), Ok(PacketType::MercuryEvent));
    assert_eq!(PacketType::try_from(0xee), Err(0xee));
    assert_eq!(u8::from(PacketType::Pong), 0x49);
}

#[test]
fn default_server_key_rejects_garbage() {
    let key = ServerKey::default();
    assert!(!key.verify(&[1, 2, 3], &[0u8; 256]));
}

#[tokio::test]
async fn tcp_resolver_connects_to_listener() -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let address = listener.local_addr()?.to_string();
    let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

    let resolver = TcpResolver::new(vec![address.clone()]);
    let endpoint = resolver.resolve().await?;
    assert_eq!(endpoint.address, address);
    accept.await??;
    Ok(())
}

#[tokio::test]
async fn tcp_resolver_reports_unreachable() -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let address = listener.local_addr()?.to_string();
    drop(listener);

    let resolver = TcpResolver::new(vec![address]);
    assert!(matches!(resolver.resolve().await, Err(SessionError::Io(_))));
    Ok(())
}
