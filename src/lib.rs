//! Client session transport for the Connect access point protocol.
//!
//! Opens an encrypted, authenticated channel to an access point: a signed
//! Diffie-Hellman handshake, an HMAC-SHA1 key ladder over the exchanged
//! bytes, a framed packet cipher and a login. The [`Session`] then runs a
//! receive loop that answers keep-alives, routes packets to registered
//! handlers and reconnects transparently when the transport fails.

pub mod config;
pub mod crypto;
pub mod e2e_common;
pub mod error;
pub mod handshake;
pub mod messages;
pub mod session;
pub mod time;

pub use config::{ConfigError, ReconnectPolicy, SessionConfig};
pub use crypto::ServerKey;
pub use error::{LoginFailure, SessionError};
pub use handshake::{AccessPointResolver, Endpoint, TcpResolver};
pub use messages::{ApWelcome, Packet, PacketType};
pub use session::{
    Credentials, PacketHandler, PresenceAnnouncer, Session, SessionBuilder, SessionState,
    Subsystem,
};
pub use time::{TimeProvider, TimeSyncMethod};
