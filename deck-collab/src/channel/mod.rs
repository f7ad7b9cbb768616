//! Sync channel: one persistent connection to the presentation authority.
//!
//! Provides:
//! - Named-event send (`send`, `send_keyed`) that never blocks
//! - Handler subscription by event name (`on` / `off`) with RAII guards
//! - Offline queue for events produced while disconnected
//! - Join replay: after every (re)connect the recorded identity is sent
//!   first, then queued events, so the authority answers with a fresh
//!   `presentation-data` snapshot
//!
//! The wire connection itself sits behind [`Transport`]; [`ws::WsTransport`]
//! talks WebSocket, [`memory::MemoryTransport`] is an in-process fake.
//!
//! ```text
//!  send() ──► connected? ──yes──► Transport::send ──► authority
//!                │ no
//!                ▼
//!          OfflineQueue ──(Connected: join, then replay)──┘
//!
//!  Transport events ──► next_event() ──► decode ──► handlers (in order)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};

pub mod memory;
pub mod ws;

/// Connection lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; the connection will not come back on
    /// its own.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Channel errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("offline queue full ({0} events)")]
    QueueFull(usize),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What a transport reports to its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection is up. `stale` holds frames accepted while the previous
    /// connection was going down; they were never written.
    Connected { stale: Vec<String> },
    /// One inbound text frame.
    Frame(String),
    /// The connection dropped; `unsent` frames were not written.
    Disconnected { unsent: Vec<String> },
    /// Reconnecting gave up after `attempts` consecutive failures.
    Failed { attempts: u32 },
}

/// The wire below a [`SyncChannel`].
pub trait Transport: Send {
    /// Hand one encoded frame to the connection. Never blocks.
    fn send(&self, frame: String) -> Result<(), ChannelError>;

    fn state(&self) -> ConnectionState;

    /// Close the connection for good.
    fn close(&self);
}

/// What [`SyncChannel::next_event`] yields.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connection (re)established. `rejoined` is true when a join was
    /// replayed; `replayed` counts queued events flushed after it.
    Connected { rejoined: bool, replayed: usize },
    Disconnected,
    Failed { attempts: u32 },
    /// An inbound event, already dispatched to its handlers.
    Message(ServerEvent),
    /// An inbound frame that could not be used. Nothing was dispatched.
    Rejected(ProtocolError),
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct QueuedFrame {
    key: Option<String>,
    frame: String,
}

/// Frames produced while disconnected, replayed in order on reconnect.
///
/// A keyed frame replaces any queued frame with the same key, so only the
/// most recent value per key survives an outage.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<QueuedFrame>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame. Returns `false` when full.
    pub fn enqueue(&mut self, key: Option<String>, frame: String) -> bool {
        if let Some(ref k) = key {
            self.queue.retain(|q| q.key.as_ref() != Some(k));
        }
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedFrame { key, frame });
        true
    }

    /// Put frames back at the front, keeping their order.
    fn requeue_front(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(QueuedFrame { key: None, frame });
        }
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).map(|q| q.frame).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.frame.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Handler registry
// ───────────────────────────────────────────────────────────────────

/// Callback for one inbound event name.
pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

impl HandlerRegistry {
    fn insert(&mut self, event: &str, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers
            .entry(event.to_owned())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&mut self, event: &str, id: Option<SubscriptionId>) -> usize {
        let Some(list) = self.handlers.get_mut(event) else {
            return 0;
        };
        let before = list.len();
        match id {
            Some(id) => list.retain(|(h, _)| *h != id),
            None => list.clear(),
        }
        let removed = before - list.len();
        if list.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }

    fn handlers_for(&self, event: &str) -> Vec<Handler> {
        self.handlers
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

fn lock(registry: &Mutex<HandlerRegistry>) -> MutexGuard<'_, HandlerRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registration of one handler. Dropping it deregisters the handler.
#[must_use = "dropping a Subscription deregisters its handler"]
pub struct Subscription {
    event: String,
    id: SubscriptionId,
    registry: Weak<Mutex<HandlerRegistry>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.event, Some(self.id));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// SyncChannel
// ───────────────────────────────────────────────────────────────────

/// Who this client is and which presentation it follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub nickname: String,
    pub presentation_id: String,
}

impl JoinRequest {
    pub fn new(nickname: impl Into<String>, presentation_id: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            presentation_id: presentation_id.into(),
        }
    }

    fn into_event(self) -> ClientEvent {
        ClientEvent::JoinPresentation {
            nickname: self.nickname,
            presentation_id: self.presentation_id,
        }
    }
}

/// The channel used by a session.
pub struct SyncChannel {
    transport: Box<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    registry: Arc<Mutex<HandlerRegistry>>,
    offline: OfflineQueue,
    /// Join replayed after every (re)connect.
    identity: Option<ClientEvent>,
    closed: bool,
}

impl SyncChannel {
    pub fn new(
        transport: Box<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        offline_capacity: usize,
    ) -> Self {
        Self {
            transport,
            events,
            registry: Arc::new(Mutex::new(HandlerRegistry::default())),
            offline: OfflineQueue::new(offline_capacity),
            identity: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Record the session identity and join the presentation.
    ///
    /// The same join is replayed after every reconnect.
    pub fn join(&mut self, request: JoinRequest) -> Result<(), ChannelError> {
        let join = request.into_event();
        self.identity = Some(join.clone());
        if self.transport.state().is_connected() {
            self.transport.send(join.encode()?)?;
        }
        Ok(())
    }

    /// Send an event, or queue it while disconnected.
    pub fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError> {
        self.send_frame(None, &event)
    }

    /// Like [`send`](Self::send), but a queued event replaces any queued
    /// event with the same key.
    pub fn send_keyed(
        &mut self,
        key: impl Into<String>,
        event: ClientEvent,
    ) -> Result<(), ChannelError> {
        self.send_frame(Some(key.into()), &event)
    }

    fn send_frame(&mut self, key: Option<String>, event: &ClientEvent) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::ConnectionClosed);
        }
        let frame = event.encode()?;

        if self.transport.state().is_connected() && self.offline.is_empty() {
            match self.transport.send(frame.clone()) {
                Ok(()) => return Ok(()),
                Err(ChannelError::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.offline.enqueue(key, frame) {
            log::warn!("Offline queue full, dropping {}", event.name());
            return Err(ChannelError::QueueFull(self.offline.len()));
        }
        log::debug!("Queued {} while offline ({} queued)", event.name(), self.offline.len());
        Ok(())
    }

    /// Register `handler` for inbound events named `event`.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = lock(&self.registry).insert(event, Arc::new(handler));
        Subscription {
            event: event.to_owned(),
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove one handler, or every handler for `event` when `id` is `None`.
    /// Returns how many were removed.
    pub fn off(&self, event: &str, id: Option<SubscriptionId>) -> usize {
        lock(&self.registry).remove(event, id)
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.registry)
            .handlers
            .get(event)
            .map_or(0, |list| list.len())
    }

    /// Wait for the next transport event and process it.
    ///
    /// Returns `None` once the transport is gone or the channel is closed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await?;
        Some(self.process(event))
    }

    /// Process an already-received transport event.
    pub fn process(&mut self, event: TransportEvent) -> ChannelEvent {
        match event {
            TransportEvent::Connected { stale } => self.on_connected(stale),
            TransportEvent::Disconnected { unsent } => {
                if !unsent.is_empty() {
                    log::info!("Requeueing {} unsent frames", unsent.len());
                    self.offline.requeue_front(unsent);
                }
                ChannelEvent::Disconnected
            }
            TransportEvent::Failed { attempts } => {
                log::warn!("Giving up after {attempts} reconnect attempts");
                ChannelEvent::Failed { attempts }
            }
            TransportEvent::Frame(text) => self.on_frame(&text),
        }
    }

    fn on_connected(&mut self, stale: Vec<String>) -> ChannelEvent {
        if !stale.is_empty() {
            self.offline.requeue_front(stale);
        }

        let mut rejoined = false;
        if let Some(join) = self.identity.clone() {
            match join.encode().map_err(ChannelError::from).and_then(|f| self.transport.send(f)) {
                Ok(()) => rejoined = true,
                Err(e) => {
                    log::warn!("Failed to send join after connect: {e}");
                    return ChannelEvent::Connected {
                        rejoined: false,
                        replayed: 0,
                    };
                }
            }
        }

        let queued = self.offline.drain();
        let total = queued.len();
        let mut replayed = 0;
        let mut rest = queued.into_iter();
        while let Some(frame) = rest.next() {
            if let Err(e) = self.transport.send(frame.clone()) {
                log::warn!("Replay interrupted: {e}");
                let mut unsent = vec![frame];
                unsent.extend(rest);
                self.offline.requeue_front(unsent);
                break;
            }
            replayed += 1;
        }
        if total > 0 {
            log::info!("Replayed {replayed}/{total} queued events");
        }

        ChannelEvent::Connected { rejoined, replayed }
    }

    fn on_frame(&self, text: &str) -> ChannelEvent {
        match ServerEvent::decode(text) {
            Ok(event) => {
                let handlers = lock(&self.registry).handlers_for(event.name());
                for handler in handlers {
                    handler(&event);
                }
                ChannelEvent::Message(event)
            }
            Err(ProtocolError::UnknownEvent(name)) => {
                log::debug!("Ignoring unknown event {name}");
                ChannelEvent::Rejected(ProtocolError::UnknownEvent(name))
            }
            Err(e) => {
                log::warn!("Dropping inbound frame: {e}");
                ChannelEvent::Rejected(e)
            }
        }
    }

    /// Close the transport. Queued events are discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.offline.is_empty() {
            log::info!("Discarding {} queued events on close", self.offline.len());
            self.offline.clear();
        }
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTransport;
    use super::*;
    use crate::protocol::SlideRef;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nav(slide_id: &str) -> ClientEvent {
        ClientEvent::NavigateSlide {
            presentation_id: "p1".into(),
            slide_id: slide_id.into(),
        }
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(None, "a".into());
        queue.enqueue(None, "bcd".into());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 4);
        assert_eq!(queue.drain(), vec!["a".to_string(), "bcd".to_string()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_keeps_latest_per_key() {
        let mut queue = OfflineQueue::new(100);
        queue.enqueue(Some("b1".into()), "move-1".into());
        queue.enqueue(None, "add".into());
        queue.enqueue(Some("b1".into()), "move-2".into());

        assert_eq!(queue.drain(), vec!["add".to_string(), "move-2".to_string()]);
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(None, "1".into()));
        assert!(queue.enqueue(None, "2".into()));
        assert!(!queue.enqueue(None, "3".into()));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues() {
        let (transport, remote, events) = MemoryTransport::pair();
        let mut channel = SyncChannel::new(Box::new(transport), events, 16);

        channel.send(nav("s1")).unwrap();
        assert_eq!(channel.offline_len(), 1);
        assert!(remote.sent().is_empty());
    }

    #[tokio::test]
    async fn test_connect_sends_join_then_queue() {
        let (transport, remote, events) = MemoryTransport::pair();
        let mut channel = SyncChannel::new(Box::new(transport), events, 16);

        channel.join(JoinRequest::new("alice", "p1")).unwrap();
        channel.send(nav("s1")).unwrap();
        remote.connect();

        let event = channel.next_event().await.unwrap();
        assert_eq!(
            event,
            ChannelEvent::Connected {
                rejoined: true,
                replayed: 1
            }
        );

        let sent = remote.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], ClientEvent::JoinPresentation { .. }));
        assert_eq!(sent[1], nav("s1"));
    }

    #[tokio::test]
    async fn test_unsent_frames_are_replayed_after_reconnect() {
        let (transport, remote, events) = MemoryTransport::pair();
        let mut channel = SyncChannel::new(Box::new(transport), events, 16);
        channel.join(JoinRequest::new("alice", "p1")).unwrap();
        remote.connect();
        channel.next_event().await.unwrap();
        remote.take_sent();

        let lost = nav("s9").encode().unwrap();
        remote.disconnect_with_unsent(vec![lost]);
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Disconnected));
        assert_eq!(channel.offline_len(), 1);

        remote.connect();
        channel.next_event().await.unwrap();
        let sent = remote.take_sent();
        assert!(matches!(sent[0], ClientEvent::JoinPresentation { .. }));
        assert_eq!(sent[1], nav("s9"));
    }

    #[tokio::test]
    async fn test_handlers_receive_matching_events_only() {
        let (transport, remote, events) = MemoryTransport::pair();
        let mut channel = SyncChannel::new(Box::new(transport), events, 16);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = channel.on("slide-navigated", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        remote.deliver(&ServerEvent::SlideNavigated(SlideRef::new("s1")));
        remote.deliver(&ServerEvent::SlideRemoved(SlideRef::new("s1")));
        channel.next_event().await.unwrap();
        channel.next_event().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_subscription_deregisters() {
        let (transport, _remote, events) = MemoryTransport::pair();
        let channel = SyncChannel::new(Box::new(transport), events, 16);

        let sub = channel.on("slide-added", |_| {});
        let _other = channel.on("slide-added", |_| {});
        assert_eq!(channel.handler_count("slide-added"), 2);

        drop(sub);
        assert_eq!(channel.handler_count("slide-added"), 1);

        assert_eq!(channel.off("slide-added", None), 1);
        assert_eq!(channel.handler_count("slide-added"), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_rejected_without_dispatch() {
        let (transport, remote, events) = MemoryTransport::pair();
        let mut channel = SyncChannel::new(Box::new(transport), events, 16);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = channel.on("block-removed", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        remote.deliver_raw(r#"{"event":"block-removed","data":{"slideId":"s1"}}"#);
        let event = channel.next_event().await.unwrap();

        assert!(matches!(event, ChannelEvent::Rejected(ProtocolError::MalformedPayload { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_sends() {
        let (transport, remote, events) = MemoryTransport::pair();
        let mut channel = SyncChannel::new(Box::new(transport), events, 16);
        channel.close();

        assert_eq!(channel.send(nav("s1")), Err(ChannelError::ConnectionClosed));
        assert!(remote.is_closed());
        assert!(channel.next_event().await.is_none());
    }
}
