use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::handlers::HandlerKind;
use super::{PacketReader, SessionInner};
use crate::error::SessionError;
use crate::messages::{Packet, PacketType};

/// Handle to the task draining one connection's read half.
pub(crate) struct ReceiverHandle {
    generation: u64,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Marks the loop stopped; it exits on its next wake-up without
    /// dispatching or reconnecting.
    pub(crate) fn request_stop(&self) {
        debug!(generation = self.generation, "stopping receive loop");
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn abort(self) {
        self.request_stop();
        self.task.abort();
    }
}

pub(crate) fn spawn(
    session: Weak<SessionInner>,
    reader: PacketReader,
    generation: u64,
) -> ReceiverHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(run(session, reader, stop.clone(), generation));
    ReceiverHandle {
        generation,
        stop,
        task,
    }
}

async fn run(
    session: Weak<SessionInner>,
    mut reader: PacketReader,
    stop: Arc<AtomicBool>,
    generation: u64,
) {
    debug!(generation, "receive loop started");
    let (inner, cause) = loop {
        let next = reader.next().await;
        if stop.load(Ordering::Acquire) {
            debug!(generation, "receive loop stopped");
            return;
        }
        let Some(inner) = session.upgrade() else {
            return;
        };
        match next {
            Some(Ok(packet)) => dispatch(&inner, packet).await,
            Some(Err(err)) => break (inner, err),
            None => {
                let eof = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "access point closed the connection",
                );
                break (inner, eof.into());
            }
        }
    };
    drop(reader);

    error!(generation, error = %cause, "failed receiving packet");
    inner.reconnect(generation, cause).await;
}

/// Routes one inbound packet. Handler work is queued per handler and run on
/// the blocking pool, so a slow consumer never holds up the next read.
async fn dispatch(inner: &Arc<SessionInner>, packet: Packet) {
    let Some(cmd) = packet.packet_type() else {
        warn!(
            cmd = %format_args!("{:#04x}", packet.cmd),
            len = packet.payload.len(),
            "skipping unknown command"
        );
        return;
    };
    trace!(?cmd, len = packet.payload.len(), "received packet");

    match cmd {
        PacketType::Ping => {
            if let Err(err) = inner.time().on_server_ping(&packet.payload) {
                warn!(error = %err, "failed loading time from ping");
            }
            let pong = Packet::new(PacketType::Pong, packet.payload);
            if let Err(err) = inner.send_unchecked(pong).await {
                warn!(error = %err, "failed sending pong");
            }
        }
        PacketType::PongAck => trace!("received pong ack"),
        PacketType::CountryCode => {
            let code = String::from_utf8_lossy(&packet.payload).into_owned();
            info!(%code, "received country code");
            inner.set_country_code(code);
        }
        PacketType::LicenseVersion => match parse_license_version(&packet.payload) {
            Ok((id, version)) if version.is_empty() => info!(id, "received license version"),
            Ok((id, version)) => info!(id, %version, "received license version"),
            Err(err) => warn!(error = %err, "malformed license version"),
        },
        PacketType::Unknown0x10 => debug!(len = packet.payload.len(), "received 0x10"),
        _ => match HandlerKind::for_packet(cmd) {
            Some(kind) => {
                if !inner.enqueue(kind, cmd, packet.payload) {
                    debug!(?cmd, handler = kind.name(), "no handler registered, dropping");
                }
            }
            None => info!(?cmd, "skipping packet"),
        },
    }
}

/// `[u16 BE id][u8 len][len bytes of UTF-8]`
fn parse_license_version(payload: &[u8]) -> Result<(u16, String), SessionError> {
    if payload.len() < 3 {
        return Err(SessionError::protocol("license version shorter than 3 bytes"));
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let len = payload[2] as usize;
    let version = payload
        .get(3..3 + len)
        .ok_or_else(|| SessionError::protocol("license version string truncated"))?;
    Ok((id, String::from_utf8_lossy(version).into_owned()))
}
