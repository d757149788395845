//! Simulated access point used by the end-to-end tests.
//!
//! Every resolve hands the session one end of an in-memory duplex pipe and
//! spawns a task speaking the server side of the protocol on the other end:
//! the signed key exchange, the login and then whatever packets the test
//! injects. Everything the session sends after the handshake is reported as
//! an [`ApEvent`].

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use prost::Message;
use rand::rngs::OsRng;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::SessionConfig;
use crate::crypto::{challenge_mac, derive_keys, CipherPair, CryptoError, DhKeyPair, ServerKey};
use crate::error::SessionError;
use crate::handshake::transport::{read_plain, write_plain};
use crate::handshake::{AccessPointResolver, Endpoint};
use crate::messages::authentication::{ApWelcome, AuthenticationType, ClientResponseEncrypted};
use crate::messages::keyexchange::{
    ApChallenge, ApLoginFailed, ApResponseMessage, ClientHello, ClientResponsePlaintext,
    LoginCryptoChallengeUnion, LoginCryptoDiffieHellmanChallenge,
};
use crate::messages::{ErrorCode, LoginCredentials, Packet, PacketType};

const PIPE_CAPACITY: usize = 64 * 1024;
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the access point treats the next connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ApBehaviour {
    Accept,
    /// Rejects right after the client response, before the cipher exists.
    EarlyFailure(ErrorCode),
    /// Completes the handshake, then answers the login with `AuthFailure`.
    RejectLogin(ErrorCode),
    /// Signs the DH value, then flips a bit of the signature.
    BadSignature,
    /// The resolver fails without opening a connection.
    Refuse,
}

/// What the access point observed from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ApEvent {
    Login {
        connection: usize,
        credentials: LoginCredentials,
        device_id: Option<String>,
    },
    Packet {
        connection: usize,
        packet: Packet,
    },
    Closed {
        connection: usize,
    },
}

#[derive(Debug)]
enum ApCommand {
    Send(Packet),
    Corrupt,
    Drop,
}

struct Shared {
    key: RsaPrivateKey,
    behaviours: Mutex<VecDeque<ApBehaviour>>,
    controls: Mutex<Vec<mpsc::UnboundedSender<ApCommand>>>,
    events: mpsc::UnboundedSender<ApEvent>,
}

pub struct FakeAccessPoint {
    shared: Arc<Shared>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ApEvent>>,
}

/// Signing key of the simulated access point; generated once per process.
pub fn server_signing_key() -> Result<RsaPrivateKey, SessionError> {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    if let Some(key) = KEY.get() {
        return Ok(key.clone());
    }
    let key = RsaPrivateKey::new(&mut OsRng, 1024)
        .map_err(|e| CryptoError::InvalidServerKey(e.to_string()))?;
    Ok(KEY.get_or_init(|| key).clone())
}

/// Configuration suited to the simulated access point: short early-failure
/// window and a fixed device id.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        device_id: "e2e-device".into(),
        early_failure_timeout_ms: 100,
        access_points: vec!["simulated:0".into()],
        ..SessionConfig::default()
    }
}

impl FakeAccessPoint {
    pub fn new() -> Result<Self, SessionError> {
        let (events, rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                key: server_signing_key()?,
                behaviours: Mutex::new(VecDeque::new()),
                controls: Mutex::new(Vec::new()),
                events,
            }),
            events: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn server_key(&self) -> ServerKey {
        ServerKey::from_public_key(RsaPublicKey::from(&self.shared.key))
    }

    pub fn resolver(&self) -> Arc<dyn AccessPointResolver> {
        Arc::new(FakeResolver {
            shared: self.shared.clone(),
        })
    }

    /// Queues the behaviour for the next resolve; [`ApBehaviour::Accept`]
    /// once the queue is empty.
    pub fn push_behaviour(&self, behaviour: ApBehaviour) {
        self.shared.behaviours.lock().push_back(behaviour);
    }

    /// Number of connections opened so far.
    pub fn connections(&self) -> usize {
        self.shared.controls.lock().len()
    }

    pub fn send(&self, connection: usize, packet: Packet) -> bool {
        self.command(connection, ApCommand::Send(packet))
    }

    /// Writes a well-formed frame that fails authentication.
    pub fn corrupt(&self, connection: usize) -> bool {
        self.command(connection, ApCommand::Corrupt)
    }

    pub fn drop_connection(&self, connection: usize) -> bool {
        self.command(connection, ApCommand::Drop)
    }

    fn command(&self, connection: usize, command: ApCommand) -> bool {
        self.shared
            .controls
            .lock()
            .get(connection)
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }

    /// Next observed event, or `None` after a few idle seconds.
    pub async fn next_event(&self) -> Option<ApEvent> {
        let mut events = self.events.lock().await;
        tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skips events until a packet with `cmd` arrives.
    pub async fn next_packet(&self, cmd: PacketType) -> Option<(usize, Packet)> {
        loop {
            match self.next_event().await? {
                ApEvent::Packet { connection, packet } if packet.is(cmd) => {
                    return Some((connection, packet))
                }
                _ => continue,
            }
        }
    }

    /// Skips events until a login arrives.
    pub async fn next_login(&self) -> Option<(usize, LoginCredentials)> {
        loop {
            if let ApEvent::Login {
                connection,
                credentials,
                ..
            } = self.next_event().await?
            {
                return Some((connection, credentials));
            }
        }
    }
}

struct FakeResolver {
    shared: Arc<Shared>,
}

#[async_trait]
impl AccessPointResolver for FakeResolver {
    async fn resolve(&self) -> Result<Endpoint, SessionError> {
        let behaviour = self
            .shared
            .behaviours
            .lock()
            .pop_front()
            .unwrap_or(ApBehaviour::Accept);
        if behaviour == ApBehaviour::Refuse {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "simulated access point refused",
            )
            .into());
        }

        let (client, server) = duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut controls = self.shared.controls.lock();
            controls.push(tx);
            controls.len() - 1
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(&shared, connection, server, behaviour, rx).await {
                tracing::debug!(connection, error = %err, "simulated access point stopped");
            }
            let _ = shared.events.send(ApEvent::Closed { connection });
        });

        Ok(Endpoint {
            address: format!("simulated:{}", connection),
            stream: Box::new(client),
        })
    }
}

async fn serve(
    shared: &Shared,
    connection: usize,
    mut stream: DuplexStream,
    behaviour: ApBehaviour,
    mut commands: mpsc::UnboundedReceiver<ApCommand>,
) -> Result<(), SessionError> {
    let Some(cipher) = accept_handshake(&shared.key, &mut stream, &behaviour).await? else {
        return Ok(());
    };
    let (send, recv) = cipher.split();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, recv);
    let mut writer = FramedWrite::new(write_half, send);

    loop {
        tokio::select! {
            inbound = reader.next() => {
                let Some(packet) = inbound else { break };
                let packet = packet?;
                if packet.is(PacketType::Login) {
                    let login = ClientResponseEncrypted::decode(packet.payload.clone())?;
                    let reply = login_reply(&login.login_credentials, &behaviour);
                    let _ = shared.events.send(ApEvent::Login {
                        connection,
                        credentials: login.login_credentials,
                        device_id: login.system_info.device_id,
                    });
                    writer.send(reply).await?;
                } else {
                    let _ = shared.events.send(ApEvent::Packet { connection, packet });
                }
            }
            command = commands.recv() => match command {
                Some(ApCommand::Send(packet)) => writer.send(packet).await?,
                Some(ApCommand::Corrupt) => {
                    let raw = writer.get_mut();
                    raw.write_all(&[0x00, 0x20]).await?;
                    raw.write_all(&[0xaa; 0x20]).await?;
                    raw.flush().await?;
                }
                Some(ApCommand::Drop) | None => break,
            }
        }
    }
    Ok(())
}

fn login_reply(credentials: &LoginCredentials, behaviour: &ApBehaviour) -> Packet {
    if let ApBehaviour::RejectLogin(code) = behaviour {
        let failed = ApLoginFailed {
            error_code: *code as i32,
            error_description: Some("rejected by simulated access point".into()),
            ..ApLoginFailed::default()
        };
        return Packet::new(PacketType::AuthFailure, failed.encode_to_vec());
    }
    let username = credentials.username.clone().unwrap_or_default();
    let welcome = ApWelcome {
        reusable_auth_credentials_type: AuthenticationType::StoredSpotifyCredentials as i32,
        reusable_auth_credentials: reusable_blob(&username),
        canonical_username: username,
        ..ApWelcome::default()
    };
    Packet::new(PacketType::ApWelcome, welcome.encode_to_vec())
}

/// Reusable credentials the simulated access point issues for `username`.
pub fn reusable_blob(username: &str) -> Vec<u8> {
    format!("reusable:{}", username).into_bytes()
}

/// Server side of the key exchange. `None` means the connection was
/// rejected before a cipher was installed.
async fn accept_handshake(
    key: &RsaPrivateKey,
    stream: &mut DuplexStream,
    behaviour: &ApBehaviour,
) -> Result<Option<CipherPair>, SessionError> {
    let mut transcript = Vec::new();

    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;
    let len = stream.read_u32().await? as usize;
    if len < 6 {
        return Err(SessionError::protocol("client hello too short"));
    }
    let mut body = vec![0u8; len - 6];
    stream.read_exact(&mut body).await?;
    transcript.extend_from_slice(&prefix);
    transcript.extend_from_slice(&(len as u32).to_be_bytes());
    transcript.extend_from_slice(&body);

    let hello = ClientHello::decode(body.as_slice())?;
    let gc = hello
        .login_crypto_hello
        .diffie_hellman
        .ok_or_else(|| SessionError::protocol("hello without DH value"))?
        .gc;

    let keys = DhKeyPair::generate();
    let gs = keys.public_key().to_vec();
    let mut signature = key
        .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(&gs))
        .map_err(|e| CryptoError::InvalidServerKey(e.to_string()))?;
    if *behaviour == ApBehaviour::BadSignature {
        signature[0] ^= 0x01;
    }
    let challenge = ApResponseMessage {
        challenge: Some(ApChallenge {
            login_crypto_challenge: LoginCryptoChallengeUnion {
                diffie_hellman: Some(LoginCryptoDiffieHellmanChallenge {
                    gs,
                    server_signature_key: 1,
                    gs_signature: signature,
                }),
            },
            server_nonce: Some(vec![0x5a; 16]),
        }),
        login_failed: None,
    };
    let sent = write_plain(stream, &[], &challenge.encode_to_vec()).await?;
    transcript.extend_from_slice(&sent);

    let frame = read_plain(stream).await?;
    let response = ClientResponsePlaintext::decode(&frame[4..])?;
    let derived = {
        let shared = keys.shared_secret(&gc)?;
        derive_keys(&shared, &transcript)?
    };
    let expected = challenge_mac(&derived, &transcript)?;
    let proof = response
        .login_crypto_response
        .diffie_hellman
        .map(|dh| dh.hmac)
        .unwrap_or_default();
    if proof != expected {
        return Err(SessionError::protocol("client challenge response mismatch"));
    }

    if let ApBehaviour::EarlyFailure(code) = behaviour {
        let failed = ApResponseMessage {
            challenge: None,
            login_failed: Some(ApLoginFailed {
                error_code: *code as i32,
                ..ApLoginFailed::default()
            }),
        };
        write_plain(stream, &[], &failed.encode_to_vec()).await?;
        return Ok(None);
    }

    Ok(Some(CipherPair::new(&derived.recv_key(), &derived.send_key())))
}
