use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::messages::PacketType;

/// Downstream consumer of one class of inbound packets (mercury, audio keys,
/// channels). `dispatch` runs on the blocking worker pool, never on the
/// receive loop, and sees one packet at a time in arrival order.
pub trait PacketHandler: Send + Sync {
    fn dispatch(&self, cmd: PacketType, payload: Bytes);

    fn close(&self) {}
}

/// Opaque subsystem owned by the session, closed with it.
pub trait Subsystem: Send + Sync {
    fn close(&self) {}
}

/// Announces this device to its peers after every (re)authentication.
#[async_trait]
pub trait PresenceAnnouncer: Send + Sync {
    async fn announce_presence(&self) -> Result<(), SessionError>;

    fn close(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum HandlerKind {
    Mercury,
    AudioKey,
    Channel,
}

impl HandlerKind {
    pub(crate) fn for_packet(cmd: PacketType) -> Option<Self> {
        if cmd.is_mercury() {
            Some(HandlerKind::Mercury)
        } else if cmd.is_audio_key() {
            Some(HandlerKind::AudioKey)
        } else if cmd.is_channel() {
            Some(HandlerKind::Channel)
        } else {
            None
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            HandlerKind::Mercury => "mercury",
            HandlerKind::AudioKey => "audio key",
            HandlerKind::Channel => "channel",
        }
    }
}

/// Ordered worker in front of one [`PacketHandler`]. Packets queue without
/// bound and are handed to the blocking pool one after another.
#[derive(Clone)]
pub(crate) struct DispatchQueue {
    tx: mpsc::UnboundedSender<(PacketType, Bytes)>,
}

impl DispatchQueue {
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(kind: HandlerKind, handler: Arc<dyn PacketHandler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(PacketType, Bytes)>();
        tokio::spawn(async move {
            while let Some((cmd, payload)) = rx.recv().await {
                let handler = handler.clone();
                let work = tokio::task::spawn_blocking(move || handler.dispatch(cmd, payload));
                if let Err(err) = work.await {
                    warn!(handler = kind.name(), ?cmd, error = %err, "handler dispatch panicked");
                }
            }
            debug!(handler = kind.name(), "dispatch worker stopped");
        });
        Self { tx }
    }

    fn push(&self, cmd: PacketType, payload: Bytes) -> bool {
        self.tx.send((cmd, payload)).is_ok()
    }
}

/// Collaborators registered on the builder. Closing takes every entry out,
/// so each one is closed at most once.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub mercury: Option<Arc<dyn PacketHandler>>,
    pub audio_key: Option<Arc<dyn PacketHandler>>,
    pub channel: Option<Arc<dyn PacketHandler>>,
    pub cache: Option<Arc<dyn Subsystem>>,
    pub presence: Option<Arc<dyn PresenceAnnouncer>>,
    queues: HashMap<HandlerKind, DispatchQueue>,
}

impl Handlers {
    pub(crate) fn packet_handler(&self, kind: HandlerKind) -> Option<Arc<dyn PacketHandler>> {
        match kind {
            HandlerKind::Mercury => self.mercury.clone(),
            HandlerKind::AudioKey => self.audio_key.clone(),
            HandlerKind::Channel => self.channel.clone(),
        }
    }

    /// Queues a packet behind earlier ones for the same handler, starting
    /// its worker on first use. `false` when no handler is registered.
    pub(crate) fn enqueue(&mut self, kind: HandlerKind, cmd: PacketType, payload: Bytes) -> bool {
        let Some(handler) = self.packet_handler(kind) else {
            return false;
        };
        self.queues
            .entry(kind)
            .or_insert_with(|| DispatchQueue::spawn(kind, handler))
            .push(cmd, payload)
    }

    pub(crate) fn close_all(&mut self) {
        self.queues.clear();
        if let Some(presence) = self.presence.take() {
            presence.close();
        }
        for handler in [
            self.mercury.take(),
            self.audio_key.take(),
            self.channel.take(),
        ]
        .into_iter()
        .flatten()
        {
            handler.close();
        }
        if let Some(cache) = self.cache.take() {
            cache.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        closed: AtomicUsize,
    }

    impl PacketHandler for Counting {
        fn dispatch(&self, _cmd: PacketType, _payload: Bytes) {}

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn routes_by_tag_class() {
        assert_eq!(
            HandlerKind::for_packet(PacketType::MercuryEvent),
            Some(HandlerKind::Mercury)
        );
        assert_eq!(
            HandlerKind::for_packet(PacketType::AesKeyError),
            Some(HandlerKind::AudioKey)
        );
        assert_eq!(
            HandlerKind::for_packet(PacketType::StreamChunkRes),
            Some(HandlerKind::Channel)
        );
        assert_eq!(HandlerKind::for_packet(PacketType::Pause), None);
    }

    #[test]
    fn close_all_closes_each_handler_once() {
        let mercury = Arc::new(Counting::default());
        let mut handlers = Handlers {
            mercury: Some(mercury.clone()),
            ..Handlers::default()
        };
        handlers.close_all();
        handlers.close_all();
        assert_eq!(mercury.closed.load(Ordering::SeqCst), 1);
        assert!(handlers.packet_handler(HandlerKind::Mercury).is_none());
    }

    struct Slow {
        seen: parking_lot::Mutex<Vec<u8>>,
        done: mpsc::UnboundedSender<()>,
    }

    impl PacketHandler for Slow {
        fn dispatch(&self, _cmd: PacketType, payload: Bytes) {
            if payload[0] == 1 {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            self.seen.lock().push(payload[0]);
            let _ = self.done.send(());
        }
    }

    #[tokio::test]
    async fn queued_packets_keep_arrival_order() {
        let (done, mut done_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Slow {
            seen: parking_lot::Mutex::new(Vec::new()),
            done,
        });
        let mut handlers = Handlers {
            channel: Some(channel.clone()),
            ..Handlers::default()
        };
        for byte in 1..=4u8 {
            assert!(handlers.enqueue(
                HandlerKind::Channel,
                PacketType::StreamChunkRes,
                Bytes::from(vec![byte])
            ));
        }
        assert!(!handlers.enqueue(HandlerKind::Mercury, PacketType::MercuryEvent, Bytes::new()));
        for _ in 0..4 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(*channel.seen.lock(), vec![1, 2, 3, 4]);
    }
}
