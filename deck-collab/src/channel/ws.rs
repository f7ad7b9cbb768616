//! WebSocket transport with automatic reconnection.
//!
//! One supervisor task owns the socket. It writes frames handed over by
//! [`WsTransport::send`], forwards inbound text frames as
//! [`TransportEvent::Frame`], and on loss reconnects with exponential
//! backoff until [`ReconnectPolicy::max_attempts`] is exhausted.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelError, ConnectionState, Transport, TransportEvent};
use crate::config::ReconnectPolicy;

enum Command {
    Send(String),
    Close,
}

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.attempts > max {
                return None;
            }
        }
        let factor = 2u32.saturating_pow(self.attempts - 1);
        let delay = self.policy.initial_delay.saturating_mul(factor);
        Some(delay.min(self.policy.max_delay))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Client half of a WebSocket connection.
pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    url: String,
}

impl WsTransport {
    /// Spawn the supervisor task and start connecting to `url`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        event_capacity: usize,
    ) -> (WsTransport, mpsc::Receiver<TransportEvent>) {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let supervisor = Supervisor {
            url: url.clone(),
            backoff: Backoff::new(policy),
            commands: cmd_rx,
            events: event_tx,
            state: state_tx,
            stale: Vec::new(),
        };
        tokio::spawn(supervisor.run());

        let transport = WsTransport {
            commands: cmd_tx,
            state: state_rx,
            url,
        };
        (transport, event_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: String) -> Result<(), ChannelError> {
        match *self.state.borrow() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => return Err(ChannelError::ConnectionClosed),
            _ => return Err(ChannelError::NotConnected),
        }
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

enum Exit {
    /// Connection lost; try again.
    Lost(Vec<String>),
    /// Closed by the client or nobody is listening anymore.
    Shutdown,
}

struct Supervisor {
    url: String,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    /// Frames that arrived while no connection was up.
    stale: Vec<String>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("Connected to {}", self.url);
                    self.backoff.reset();
                    if !self.collect_stale() {
                        break;
                    }
                    self.state.send_replace(ConnectionState::Connected);
                    let stale = std::mem::take(&mut self.stale);
                    if self.events.send(TransportEvent::Connected { stale }).await.is_err() {
                        break;
                    }

                    let Exit::Lost(mut unsent) = self.pump(ws).await else {
                        break;
                    };
                    self.state.send_replace(ConnectionState::Reconnecting);
                    // Pick up anything sent before the state flip was seen.
                    let open = self.collect_stale();
                    unsent.append(&mut self.stale);
                    log::warn!("Connection to {} lost", self.url);
                    if self.events.send(TransportEvent::Disconnected { unsent }).await.is_err() || !open {
                        break;
                    }
                }
                Err(e) => log::warn!("Connect to {} failed: {e}", self.url),
            }

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                self.state.send_replace(ConnectionState::Failed);
                let _ = self.events.send(TransportEvent::Failed { attempts }).await;
                return;
            };
            log::debug!("Reconnecting in {delay:?} (attempt {})", self.backoff.attempts());
            if !self.wait(delay).await {
                break;
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        log::debug!("Transport for {} stopped", self.url);
    }

    /// Sleep for `delay`, stashing sends. Returns `false` on close.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => self.stale.push(frame),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    /// Move queued sends into `stale`. Returns `false` on close.
    fn collect_stale(&mut self) -> bool {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Send(frame) => self.stale.push(frame),
                Command::Close => return false,
            }
        }
        true
    }

    async fn pump<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> Exit
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut writer, mut reader) = ws.split();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = writer.send(Message::text(frame.clone())).await {
                            log::warn!("Write failed: {e}");
                            return Exit::Lost(vec![frame]);
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = writer.send(Message::Close(None)).await;
                        return Exit::Shutdown;
                    }
                },
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = TransportEvent::Frame(text.as_str().to_owned());
                        if self.events.send(frame).await.is_err() {
                            return Exit::Shutdown;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if self.events.send(TransportEvent::Frame(text)).await.is_err() {
                                return Exit::Shutdown;
                            }
                        }
                        Err(_) => log::warn!("Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = writer.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost(Vec::new()),
                    Some(Err(e)) => {
                        log::warn!("Read failed: {e}");
                        return Exit::Lost(Vec::new());
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
