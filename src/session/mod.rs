//! Authenticated session with an access point.
//!
//! A [`Session`] owns at most one live connection. Sends and the dependent
//! accessors wait on the [`AuthGate`] until login completes, and again while
//! a reconnection is in flight, so callers never observe a half-installed
//! cipher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::crypto::{RecvCipher, SendCipher, ServerKey};
use crate::error::{LoginFailure, SessionError};
use crate::handshake::{AccessPointResolver, BoxedStream, ClientHandshake, Endpoint, TcpResolver};
use crate::messages::authentication::{ClientResponseEncrypted, CpuFamily, Os, SystemInfo};
use crate::messages::{ApLoginFailed, ApWelcome, Packet, PacketType};
use crate::time::TimeProvider;

mod credentials;
mod handlers;
mod receiver;
mod reconnect;
pub mod state;

pub use credentials::Credentials;
pub use handlers::{PacketHandler, PresenceAnnouncer, Subsystem};
pub use state::{AuthGate, SessionState, SessionStateError};

use handlers::{HandlerKind, Handlers};
use receiver::ReceiverHandle;

pub(crate) type PacketReader = FramedRead<ReadHalf<BoxedStream>, RecvCipher>;
type PacketWriter = FramedWrite<WriteHalf<BoxedStream>, SendCipher>;

const PREFERRED_LOCALE_HEADER: [u8; 5] = [0x00, 0x00, 0x10, 0x00, 0x02];
const PREFERRED_LOCALE_KEY: &[u8] = b"preferred-locale";
const LOGIN_NONCE_LEN: usize = 20;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Write side of one established connection.
pub(crate) struct Connection {
    generation: u64,
    address: String,
    writer: tokio::sync::Mutex<PacketWriter>,
}

impl Connection {
    async fn send(&self, packet: Packet) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        writer.send(packet).await
    }

    async fn shutdown(&self) {
        let close = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, close).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(address = %self.address, error = %err, "error closing connection"),
            Err(_) => debug!(address = %self.address, "timed out closing connection"),
        }
    }
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    resolver: Arc<dyn AccessPointResolver>,
    handshake: ClientHandshake,
    time: Arc<TimeProvider>,
    gate: AuthGate,
    state: Mutex<SessionState>,
    connection: RwLock<Option<Arc<Connection>>>,
    pending_reader: Mutex<Option<PacketReader>>,
    generation: AtomicU64,
    receiver: Mutex<Option<ReceiverHandle>>,
    welcome: RwLock<Option<ApWelcome>>,
    device_id: RwLock<String>,
    country_code: RwLock<Option<String>>,
    handlers: Mutex<Handlers>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl SessionInner {
    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        *state = state.clone().transition(next)?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    pub(crate) fn time(&self) -> &TimeProvider {
        &self.time
    }

    pub(crate) fn packet_handler(&self, kind: HandlerKind) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.lock().packet_handler(kind)
    }

    pub(crate) fn enqueue(&self, kind: HandlerKind, cmd: PacketType, payload: Bytes) -> bool {
        self.handlers.lock().enqueue(kind, cmd, payload)
    }

    pub(crate) fn set_country_code(&self, code: String) {
        *self.country_code.write() = Some(code);
    }

    /// Sends through the current connection without waiting on the gate.
    pub(crate) async fn send_unchecked(&self, packet: Packet) -> Result<(), SessionError> {
        let connection = self
            .current_connection()
            .ok_or_else(|| SessionError::protocol("no connection installed"))?;
        connection.send(packet).await
    }

    async fn wait_authenticated(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.gate.wait().await?;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Opens a connection and completes the handshake, leaving the cipher
    /// installed and the read half parked for the login exchange.
    async fn establish(&self) -> Result<(), SessionError> {
        let Endpoint {
            address,
            mut stream,
        } = self.resolver.resolve().await?;
        info!(%address, "connecting to access point");
        let cipher = self.handshake.run(&mut stream).await?;

        let (send, recv) = cipher.split();
        let (read_half, write_half) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = Arc::new(Connection {
            generation,
            address: address.clone(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, send)),
        });

        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        *self.pending_reader.lock() = Some(FramedRead::new(read_half, recv));
        let previous = self.connection.write().replace(connection);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        info!(%address, generation, "connected to access point");
        Ok(())
    }

    /// Login exchange over the freshly established connection. On success
    /// the receive loop is started and the gate opened.
    async fn authenticate_partial(
        self: &Arc<Self>,
        credentials: &Credentials,
        device_id: &str,
    ) -> Result<ApWelcome, SessionError> {
        let connection = self
            .current_connection()
            .ok_or_else(|| SessionError::protocol("authenticate called before connect"))?;
        let mut reader = self
            .pending_reader
            .lock()
            .take()
            .ok_or_else(|| SessionError::protocol("no pending connection to authenticate"))?;

        let login = ClientResponseEncrypted {
            login_credentials: credentials.to_message(),
            system_info: SystemInfo {
                cpu_family: CpuFamily::Unknown as i32,
                os: Os::Unknown as i32,
                system_information_string: Some(self.config.system_info.clone()),
                device_id: Some(device_id.to_string()),
            },
            version_string: Some(self.config.version_string.clone()),
        };
        connection
            .send(Packet::new(PacketType::Login, login.encode_to_vec()))
            .await?;

        let packet = match reader.next().await {
            Some(packet) => packet?,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "access point closed the connection during login",
                )
                .into())
            }
        };

        match packet.packet_type() {
            Some(PacketType::ApWelcome) => {
                let welcome = ApWelcome::decode(packet.payload)?;
                self.transition(SessionState::Authenticated {
                    since: Instant::now(),
                })?;
                *self.welcome.write() = Some(welcome.clone());
                *self.device_id.write() = device_id.to_string();

                let handle =
                    receiver::spawn(Arc::downgrade(self), reader, connection.generation);
                let previous = self.receiver.lock().replace(handle);
                if let Some(previous) = previous {
                    previous.request_stop();
                }
                if self.is_closed() {
                    let orphan = self.receiver.lock().take();
                    if let Some(orphan) = orphan {
                        orphan.abort();
                    }
                    return Err(SessionError::Closed);
                }

                self.send_post_login(&connection).await;
                self.gate.open();
                info!(
                    username = %welcome.canonical_username,
                    generation = connection.generation,
                    "authenticated"
                );
                Ok(welcome)
            }
            Some(PacketType::AuthFailure) => {
                let failed = ApLoginFailed::decode(packet.payload)?;
                Err(SessionError::Authentication {
                    code: LoginFailure::from_message(&failed),
                })
            }
            _ => Err(SessionError::protocol(format!(
                "unexpected command {:#04x} during login",
                packet.cmd
            ))),
        }
    }

    /// Fire-and-forget packets the access point expects after a login.
    async fn send_post_login(&self, connection: &Connection) {
        let mut nonce = vec![0u8; LOGIN_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        if let Err(err) = connection
            .send(Packet::new(PacketType::Unknown0x0f, nonce))
            .await
        {
            warn!(error = %err, "failed sending post-login nonce");
        }

        let locale = &self.config.preferred_locale;
        let mut payload = Vec::with_capacity(
            PREFERRED_LOCALE_HEADER.len() + PREFERRED_LOCALE_KEY.len() + locale.len(),
        );
        payload.extend_from_slice(&PREFERRED_LOCALE_HEADER);
        payload.extend_from_slice(PREFERRED_LOCALE_KEY);
        payload.extend_from_slice(locale.as_bytes());
        if let Err(err) = connection
            .send(Packet::new(PacketType::PreferredLocale, payload))
            .await
        {
            warn!(error = %err, "failed sending preferred locale");
        }
    }

    async fn announce_presence(&self) -> Result<(), SessionError> {
        let presence = self.handlers.lock().presence.clone();
        match presence {
            Some(presence) => presence.announce_presence().await,
            None => Ok(()),
        }
    }

    /// Drops the live connection and stops its receive loop. Must not be
    /// called from inside the receive loop.
    async fn teardown_connection(&self) {
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            receiver.abort();
        }
        self.pending_reader.lock().take();
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
    }

    fn fail(&self, reason: String) {
        warn!(%reason, "session failed");
        self.gate.fail(reason.clone());
        let mut state = self.state.lock();
        if let Ok(next) = state.clone().transition(SessionState::Failed(reason)) {
            *state = next;
        }
    }
}

/// Cheaply cloneable handle to one session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Opens a connection and completes the handshake. Waiters on the gate
    /// are released with an error if this fails.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.transition(SessionState::Connecting)?;
        inner.gate.set_pending();
        match inner.establish().await {
            Ok(()) => {
                inner.transition(SessionState::Connected {
                    since: Instant::now(),
                })?;
                Ok(())
            }
            Err(err) => {
                inner.fail(format!("connect failed: {}", err));
                Err(err)
            }
        }
    }

    /// Logs in over the connection opened by [`Session::connect`], then
    /// announces presence.
    ///
    /// # Guarantees
    /// - On success the receive loop is running and the gate is open.
    /// - On failure the gate resolves with [`SessionError::Unavailable`].
    /// - Called in any state but connected, it is rejected with
    ///   [`SessionError::InvalidState`] and the session is left untouched.
    pub async fn authenticate(
        &self,
        credentials: Credentials,
        device_id: &str,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        let current = inner.state.lock().clone();
        if !matches!(current, SessionState::Connected { .. }) {
            return Err(SessionStateError::InvalidTransition {
                from: current,
                to: SessionState::Authenticated {
                    since: Instant::now(),
                },
            }
            .into());
        }
        let result = async {
            inner.authenticate_partial(&credentials, device_id).await?;
            inner.announce_presence().await
        }
        .await;
        if let Err(err) = &result {
            inner.fail(format!("authentication failed: {}", err));
            inner.teardown_connection().await;
        }
        result
    }

    /// Sends one packet once the session is authenticated.
    pub async fn send(&self, cmd: PacketType, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        self.inner.wait_authenticated().await?;
        let packet = Packet::new(cmd, payload);
        debug!(?packet, "sending");
        self.inner.send_unchecked(packet).await
    }

    /// `true` once authenticated with a live connection and not closed.
    pub async fn is_valid(&self) -> bool {
        self.inner.wait_authenticated().await.is_ok()
            && self.inner.welcome.read().is_some()
            && self.inner.current_connection().is_some()
            && !self.inner.is_closed()
    }

    pub async fn mercury(&self) -> Result<Arc<dyn PacketHandler>, SessionError> {
        self.gated_handler(HandlerKind::Mercury).await
    }

    pub async fn audio_key(&self) -> Result<Arc<dyn PacketHandler>, SessionError> {
        self.gated_handler(HandlerKind::AudioKey).await
    }

    pub async fn channel(&self) -> Result<Arc<dyn PacketHandler>, SessionError> {
        self.gated_handler(HandlerKind::Channel).await
    }

    pub async fn cache(&self) -> Result<Arc<dyn Subsystem>, SessionError> {
        self.inner.wait_authenticated().await?;
        let cache = self.inner.handlers.lock().cache.clone();
        cache.ok_or(SessionError::NotRegistered("cache"))
    }

    async fn gated_handler(&self, kind: HandlerKind) -> Result<Arc<dyn PacketHandler>, SessionError> {
        self.inner.wait_authenticated().await?;
        self.inner
            .packet_handler(kind)
            .ok_or(SessionError::NotRegistered(kind.name()))
    }

    pub async fn ap_welcome(&self) -> Result<ApWelcome, SessionError> {
        self.inner.wait_authenticated().await?;
        self.inner
            .welcome
            .read()
            .clone()
            .ok_or(SessionError::Closed)
    }

    pub async fn username(&self) -> Result<String, SessionError> {
        Ok(self.ap_welcome().await?.canonical_username)
    }

    pub fn country_code(&self) -> Option<String> {
        self.inner.country_code.read().clone()
    }

    pub fn device_id(&self) -> String {
        self.inner.device_id.read().clone()
    }

    pub fn time_provider(&self) -> Arc<TimeProvider> {
        self.inner.time.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    /// Tears the session down. Only the first call does any work.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing session");
        *inner.state.lock() = SessionState::Closed;

        inner.handlers.lock().close_all();
        inner.teardown_connection().await;
        inner.welcome.write().take();
        inner.gate.close();
        info!("session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

/// Collects configuration and collaborators for a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    resolver: Option<Arc<dyn AccessPointResolver>>,
    server_key: ServerKey,
    time: Option<Arc<TimeProvider>>,
    handlers: Handlers,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            resolver: None,
            server_key: ServerKey::default(),
            time: None,
            handlers: Handlers::default(),
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn AccessPointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn server_key(mut self, key: ServerKey) -> Self {
        self.server_key = key;
        self
    }

    pub fn time_provider(mut self, time: Arc<TimeProvider>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn mercury(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handlers.mercury = Some(handler);
        self
    }

    pub fn audio_key(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handlers.audio_key = Some(handler);
        self
    }

    pub fn channel(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handlers.channel = Some(handler);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Subsystem>) -> Self {
        self.handlers.cache = Some(cache);
        self
    }

    pub fn presence(mut self, presence: Arc<dyn PresenceAnnouncer>) -> Self {
        self.handlers.presence = Some(presence);
        self
    }

    /// Yields an unconnected session.
    pub fn build(self) -> Result<Session, SessionError> {
        self.config.validate()?;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(TcpResolver::new(self.config.access_points.clone())));
        let time = self.time.unwrap_or_else(|| {
            Arc::new(TimeProvider::new(
                self.config.time_sync,
                self.config.manual_time_offset_ms,
            ))
        });
        let handshake = ClientHandshake::new(self.server_key, self.config.early_failure_timeout());
        let device_id = self.config.device_id.clone();

        Ok(Session {
            inner: Arc::new(SessionInner {
                config: self.config,
                resolver,
                handshake,
                time,
                gate: AuthGate::new(),
                state: Mutex::new(SessionState::Init),
                connection: RwLock::new(None),
                pending_reader: Mutex::new(None),
                generation: AtomicU64::new(0),
                receiver: Mutex::new(None),
                welcome: RwLock::new(None),
                device_id: RwLock::new(device_id),
                country_code: RwLock::new(None),
                handlers: Mutex::new(self.handlers),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Builds, connects and authenticates with the configured device id.
    pub async fn create(self, credentials: Credentials) -> Result<Session, SessionError> {
        let session = self.build()?;
        let device_id = session.device_id();
        session.connect().await?;
        session.authenticate(credentials, &device_id).await?;
        Ok(session)
    }
}
