use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connect_session::e2e_common::{reusable_blob, test_config, ApBehaviour, FakeAccessPoint};
use connect_session::messages::AuthenticationType;
use connect_session::{
    Credentials, PacketType, PresenceAnnouncer, ReconnectPolicy, Session, SessionConfig,
    SessionError, SessionState,
};
use tokio::time::{sleep, timeout, Instant};

#[derive(Default)]
struct CountingPresence {
    announced: AtomicUsize,
}

#[async_trait]
impl PresenceAnnouncer for CountingPresence {
    async fn announce_presence(&self) -> Result<(), SessionError> {
        self.announced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            return Err("condition not reached in time".into());
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn authenticated(
    ap: &FakeAccessPoint,
    config: SessionConfig,
    presence: Arc<CountingPresence>,
) -> Result<Session, Box<dyn Error>> {
    let session = Session::builder(config)
        .resolver(ap.resolver())
        .server_key(ap.server_key())
        .presence(presence)
        .create(Credentials::user_pass("listener", "secret"))
        .await?;
    let (connection, _) = ap.next_login().await.ok_or("no initial login")?;
    assert_eq!(connection, 0);
    Ok(session)
}

#[tokio::test]
async fn dropped_connection_is_replaced_with_welcome_credentials() -> Result<(), Box<dyn Error>> {
    let ap = FakeAccessPoint::new()?;
    let presence = Arc::new(CountingPresence::default());
    let session = authenticated(&ap, test_config(), presence.clone()).await?;
    assert_eq!(presence.announced.load(Ordering::SeqCst), 1);

    ap.drop_connection(0);

    let (connection, credentials) = ap.next_login().await.ok_or("no re-login")?;
    assert_eq!(connection, 1);
    assert_eq!(credentials.username.as_deref(), Some("listener"));
    assert_eq!(
        credentials.typ,
        AuthenticationType::StoredSpotifyCredentials as i32
    );
    assert_eq!(credentials.auth_data, Some(reusable_blob("listener")));

    session.send(PacketType::MercuryReq, b"after".to_vec()).await?;
    let (connection, packet) = ap
        .next_packet(PacketType::MercuryReq)
        .await
        .ok_or("packet not delivered")?;
    assert_eq!(connection, 1);
    assert_eq!(&packet.payload[..], b"after");

    eventually(|| presence.announced.load(Ordering::SeqCst) == 2).await?;
    assert!(session.state().is_authenticated());
    assert!(session.is_valid().await);
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn corrupted_frame_triggers_reconnect() -> Result<(), Box<dyn Error>> {
    let ap = FakeAccessPoint::new()?;
    let session = authenticated(&ap, test_config(), Arc::default()).await?;

    ap.corrupt(0);

    let (connection, _) = ap.next_login().await.ok_or("no re-login")?;
    assert_eq!(connection, 1);
    session.send(PacketType::MercurySub, b"again".to_vec()).await?;
    let (connection, _) = ap
        .next_packet(PacketType::MercurySub)
        .await
        .ok_or("packet not delivered")?;
    assert_eq!(connection, 1);
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_reconnect_fails_waiters() -> Result<(), Box<dyn Error>> {
    let ap = FakeAccessPoint::new()?;
    let session = authenticated(&ap, test_config(), Arc::default()).await?;

    ap.push_behaviour(ApBehaviour::Refuse);
    ap.drop_connection(0);

    eventually(|| matches!(session.state(), SessionState::Failed(_))).await?;
    assert!(matches!(
        timeout(Duration::from_secs(1), session.mercury()).await?,
        Err(SessionError::Unavailable { .. })
    ));
    assert!(!session.is_valid().await);
    assert_eq!(ap.connections(), 1);
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn bounded_policy_retries_with_backoff() -> Result<(), Box<dyn Error>> {
    let ap = FakeAccessPoint::new()?;
    let config = SessionConfig {
        reconnect: ReconnectPolicy::bounded(
            3,
            Duration::from_millis(10),
            Duration::from_millis(20),
        ),
        ..test_config()
    };
    let session = authenticated(&ap, config, Arc::default()).await?;

    ap.push_behaviour(ApBehaviour::Refuse);
    ap.push_behaviour(ApBehaviour::Refuse);
    ap.drop_connection(0);

    let (connection, _) = ap.next_login().await.ok_or("no re-login")?;
    assert_eq!(connection, 1);
    eventually(|| session.state().is_authenticated()).await?;
    session.send(PacketType::MercuryReq, vec![1]).await?;
    ap.next_packet(PacketType::MercuryReq)
        .await
        .ok_or("packet not delivered")?;
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn close_stops_reconnection() -> Result<(), Box<dyn Error>> {
    let ap = FakeAccessPoint::new()?;
    let session = authenticated(&ap, test_config(), Arc::default()).await?;

    session.close().await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ap.connections(), 1);
    assert_eq!(session.state(), SessionState::Closed);
    Ok(())
}
