//! In-process transport for tests and offline tooling.
//!
//! [`MemoryTransport`] is handed to a [`SyncChannel`](super::SyncChannel);
//! the matching [`MemoryRemote`] plays the authority: it flips the
//! connection up and down, delivers inbound events and records what the
//! client sent.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::{ChannelError, ConnectionState, Transport, TransportEvent};
use crate::protocol::{ClientEvent, ServerEvent};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug)]
struct Wire {
    state: ConnectionState,
    sent: Vec<String>,
    closed: bool,
}

fn lock(wire: &Mutex<Wire>) -> MutexGuard<'_, Wire> {
    wire.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client half.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    wire: Arc<Mutex<Wire>>,
}

/// Authority half.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    wire: Arc<Mutex<Wire>>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    /// Create a disconnected pair plus the event stream for the channel.
    pub fn pair() -> (MemoryTransport, MemoryRemote, mpsc::Receiver<TransportEvent>) {
        let wire = Arc::new(Mutex::new(Wire {
            state: ConnectionState::Disconnected,
            sent: Vec::new(),
            closed: false,
        }));
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (
            MemoryTransport { wire: wire.clone() },
            MemoryRemote { wire, events: tx },
            rx,
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: String) -> Result<(), ChannelError> {
        let mut wire = lock(&self.wire);
        if wire.closed {
            return Err(ChannelError::ConnectionClosed);
        }
        if !wire.state.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        wire.sent.push(frame);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        lock(&self.wire).state
    }

    fn close(&self) {
        let mut wire = lock(&self.wire);
        wire.closed = true;
        wire.state = ConnectionState::Disconnected;
    }
}

impl MemoryRemote {
    fn push(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Memory transport dropped an event: {e}");
        }
    }

    /// Bring the connection up.
    pub fn connect(&self) {
        {
            let mut wire = lock(&self.wire);
            if wire.closed {
                return;
            }
            wire.state = ConnectionState::Connected;
        }
        self.push(TransportEvent::Connected { stale: Vec::new() });
    }

    /// Drop the connection; the client will wait for [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.disconnect_with_unsent(Vec::new());
    }

    /// Drop the connection, reporting `unsent` frames as never written.
    pub fn disconnect_with_unsent(&self, unsent: Vec<String>) {
        lock(&self.wire).state = ConnectionState::Reconnecting;
        self.push(TransportEvent::Disconnected { unsent });
    }

    /// Report that reconnecting gave up.
    pub fn fail(&self, attempts: u32) {
        lock(&self.wire).state = ConnectionState::Failed;
        self.push(TransportEvent::Failed { attempts });
    }

    pub fn deliver(&self, event: &ServerEvent) {
        match event.encode() {
            Ok(frame) => self.push(TransportEvent::Frame(frame)),
            Err(e) => log::warn!("Cannot deliver {}: {e}", event.name()),
        }
    }

    /// Deliver a frame exactly as given.
    pub fn deliver_raw(&self, frame: &str) {
        self.push(TransportEvent::Frame(frame.to_owned()));
    }

    /// Frames the client has written so far.
    pub fn sent_frames(&self) -> Vec<String> {
        lock(&self.wire).sent.clone()
    }

    /// Decoded events the client has written so far.
    pub fn sent(&self) -> Vec<ClientEvent> {
        decode_all(&lock(&self.wire).sent)
    }

    /// Like [`sent`](Self::sent), but clears the record.
    pub fn take_sent(&self) -> Vec<ClientEvent> {
        let frames = std::mem::take(&mut lock(&self.wire).sent);
        decode_all(&frames)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.wire).closed
    }
}

fn decode_all(frames: &[String]) -> Vec<ClientEvent> {
    frames
        .iter()
        .filter_map(|f| match ClientEvent::decode(f) {
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("Client wrote an undecodable frame: {e}");
                None
            }
        })
        .collect()
}
