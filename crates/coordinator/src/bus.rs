//! Filtered publish/subscribe between the windows of a session.
//!
//! All windows of a session share one broadcast channel carrying JSON frames.
//! A bus mirrors what it publishes to its own subscriptions synchronously and
//! skips its own frames when they come back from the channel.

use paneweave_ipc::{
    channel_name, matches, ClientIdentity, DecodeError, Envelope, Message, MessageFilter,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Frames a slow subscriber may fall behind before it starts losing them.
const CHANNEL_CAPACITY: usize = 1024;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Errors that can occur on the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Refusing to open a channel for an empty session id")]
    EmptySession,

    #[error("Received message with unknown kind: {0}")]
    UnknownKind(String),

    #[error("Failed to encode or decode a frame: {0}")]
    Codec(String),

    #[error("Channel hub lock poisoned")]
    Poisoned,
}

impl From<DecodeError> for BusError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnknownKind(kind) => BusError::UnknownKind(kind),
            DecodeError::Malformed(e) => BusError::Codec(e.to_string()),
        }
    }
}

/// A frame on the session channel.
#[derive(Debug)]
struct Frame {
    origin: u64,
    json: String,
}

/// Registry of session channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Arc<Frame>>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the channel of a session, creating it on first use.
    pub fn open(&self, session_id: &str) -> Result<SessionChannel, BusError> {
        if session_id.is_empty() {
            return Err(BusError::EmptySession);
        }
        let name = channel_name(session_id);
        let mut channels = self.channels.lock().map_err(|_| BusError::Poisoned)?;
        let sender = channels
            .entry(name.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        Ok(SessionChannel { name, sender })
    }
}

/// Handle to one session channel.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    name: String,
    sender: broadcast::Sender<Arc<Frame>>,
}

impl SessionChannel {
    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn log_traffic(direction: &str, envelope: &Envelope) {
    if envelope.kind().is_heartbeat() {
        trace!(
            "{} {} from {} to {:?}",
            direction,
            envelope.kind(),
            envelope.sender.id,
            envelope.filters
        );
    } else {
        debug!(
            "{} {} from {} to {:?}",
            direction,
            envelope.kind(),
            envelope.sender.id,
            envelope.filters
        );
    }
}

/// One window's endpoint on a session channel.
#[derive(Debug)]
pub struct Bus {
    id: u64,
    client: ClientIdentity,
    channel: SessionChannel,
    local: Arc<Mutex<Vec<mpsc::UnboundedSender<Envelope>>>>,
}

impl Bus {
    /// Attach a client to a channel.
    pub fn new(channel: SessionChannel, client: ClientIdentity) -> Self {
        Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            client,
            channel,
            local: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Identity messages are sent with.
    pub fn client(&self) -> &ClientIdentity {
        &self.client
    }

    /// Publish a message to every client matching `filters`.
    pub fn publish(&self, message: Message, filters: Vec<MessageFilter>) -> Result<(), BusError> {
        let envelope = Envelope::new(self.client.clone(), filters, message);
        log_traffic("Sending", &envelope);

        if matches(&self.client, &envelope.filters) {
            let mut local = self.local.lock().map_err(|_| BusError::Poisoned)?;
            local.retain(|tx| tx.send(envelope.clone()).is_ok());
        }

        let json = envelope.to_json()?;
        // No receivers only means no other window is listening yet
        let _ = self.channel.sender.send(Arc::new(Frame {
            origin: self.id,
            json,
        }));
        Ok(())
    }

    /// Start receiving messages addressed to this client.
    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local.lock().map_err(|_| BusError::Poisoned)?.push(tx);
        Ok(Subscription {
            bus_id: self.id,
            client: self.client.clone(),
            local: rx,
            remote: self.channel.sender.subscribe(),
            closed: false,
        })
    }
}

enum Incoming {
    Local(Envelope),
    Remote(Result<Arc<Frame>, broadcast::error::RecvError>),
}

/// Stream of envelopes addressed to one client.
#[derive(Debug)]
pub struct Subscription {
    bus_id: u64,
    client: ClientIdentity,
    local: mpsc::UnboundedReceiver<Envelope>,
    remote: broadcast::Receiver<Arc<Frame>>,
    closed: bool,
}

impl Subscription {
    /// Next pending envelope, without waiting.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>, BusError> {
        if self.closed {
            return Ok(None);
        }
        if let Ok(envelope) = self.local.try_recv() {
            return Ok(Some(envelope));
        }
        loop {
            match self.remote.try_recv() {
                Ok(frame) => {
                    if let Some(envelope) = self.accept(&frame)? {
                        return Ok(Some(envelope));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Subscription lagged, skipped {} frames", skipped);
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Wait for the next envelope; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, BusError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            let incoming = tokio::select! {
                biased;
                Some(envelope) = self.local.recv() => Incoming::Local(envelope),
                received = self.remote.recv() => Incoming::Remote(received),
            };
            match incoming {
                Incoming::Local(envelope) => return Ok(Some(envelope)),
                Incoming::Remote(Ok(frame)) => {
                    if let Some(envelope) = self.accept(&frame)? {
                        return Ok(Some(envelope));
                    }
                }
                Incoming::Remote(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("Subscription lagged, skipped {} frames", skipped);
                }
                Incoming::Remote(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
            }
        }
    }

    /// Stop receiving.
    pub fn unsubscribe(&mut self) {
        self.closed = true;
        self.local.close();
    }

    fn accept(&self, frame: &Frame) -> Result<Option<Envelope>, BusError> {
        if frame.origin == self.bus_id {
            return Ok(None);
        }
        let envelope = Envelope::from_json(&frame.json)?;
        if !matches(&self.client, &envelope.filters) {
            return Ok(None);
        }
        log_traffic("Received", &envelope);
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paneweave_ipc::{Role, Widget};

    fn popout(id: &str) -> ClientIdentity {
        ClientIdentity::new(id, Role::Popout, 0)
    }

    #[test]
    fn test_empty_session_rejected() {
        let hub = ChannelHub::new();
        assert!(matches!(hub.open(""), Err(BusError::EmptySession)));
        assert_eq!(
            hub.open("u1").unwrap().name(),
            "paneweave-windows-channel-u1"
        );
    }

    #[test]
    fn test_publish_reaches_other_bus_and_self() {
        let hub = ChannelHub::new();
        let main = Bus::new(hub.open("u1").unwrap(), ClientIdentity::base_main(0));
        let pop = Bus::new(hub.open("u1").unwrap(), popout("p1"));
        let mut main_sub = main.subscribe().unwrap();
        let mut pop_sub = pop.subscribe().unwrap();

        main.publish(Message::PullState, vec![]).unwrap();

        let own = main_sub.try_recv().unwrap().unwrap();
        assert_eq!(own.message, Message::PullState);
        // Own frame is not delivered twice
        assert!(main_sub.try_recv().unwrap().is_none());

        let other = pop_sub.try_recv().unwrap().unwrap();
        assert_eq!(other.sender.id, "main");
        assert!(pop_sub.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_filters_limit_delivery() {
        let hub = ChannelHub::new();
        let main = Bus::new(hub.open("u1").unwrap(), ClientIdentity::base_main(0));
        let p1 = Bus::new(hub.open("u1").unwrap(), popout("p1"));
        let p2 = Bus::new(hub.open("u1").unwrap(), popout("p2"));
        let mut main_sub = main.subscribe().unwrap();
        let mut p1_sub = p1.subscribe().unwrap();
        let mut p2_sub = p2.subscribe().unwrap();

        main.publish(Message::PullState, vec![MessageFilter::with_id("p2")])
            .unwrap();

        assert!(main_sub.try_recv().unwrap().is_none());
        assert!(p1_sub.try_recv().unwrap().is_none());
        assert!(p2_sub.try_recv().unwrap().is_some());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let hub = ChannelHub::new();
        let a = Bus::new(hub.open("u1").unwrap(), popout("a"));
        let b = Bus::new(hub.open("u2").unwrap(), popout("b"));
        let mut b_sub = b.subscribe().unwrap();
        a.publish(Message::IsMainAlive, vec![]).unwrap();
        assert!(b_sub.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = ChannelHub::new();
        let main = Bus::new(hub.open("u1").unwrap(), ClientIdentity::base_main(0));
        let mut sub = main.subscribe().unwrap();
        sub.unsubscribe();
        main.publish(Message::PullState, vec![]).unwrap();
        assert!(sub.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_unknown_kind_is_protocol_error() {
        let hub = ChannelHub::new();
        let channel = hub.open("u1").unwrap();
        let pop = Bus::new(channel.clone(), popout("p1"));
        let mut sub = pop.subscribe().unwrap();

        let frame = r#"{"sender":{"id":"x","role":"popout","createdAt":0,"updatedAt":0},
            "filters":[],"message":{"type":"reboot"}}"#;
        channel
            .sender
            .send(Arc::new(Frame {
                origin: 0,
                json: frame.to_string(),
            }))
            .unwrap();

        assert!(matches!(sub.try_recv(), Err(BusError::UnknownKind(k)) if k == "reboot"));
    }

    #[tokio::test]
    async fn test_async_recv() {
        let hub = ChannelHub::new();
        let main = Bus::new(hub.open("u1").unwrap(), ClientIdentity::base_main(0));
        let pop = Bus::new(hub.open("u1").unwrap(), popout("p1"));
        let mut main_sub = main.subscribe().unwrap();

        pop.publish(
            Message::PopoutIsAlive {
                widgets: vec![Widget::new("Chat", "r1")],
            },
            vec![MessageFilter::main_only()],
        )
        .unwrap();

        let envelope = main_sub.recv().await.unwrap().unwrap();
        assert_eq!(envelope.sender.id, "p1");
    }
}
