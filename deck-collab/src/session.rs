//! Session: one client following one presentation.
//!
//! Owns the [`SyncChannel`], the [`Mutator`] and a handle to the
//! [`PresentationStore`]. All store changes, handler dispatch and coalescer
//! flushing happen on the task that drives [`Session::next`] (or
//! [`Session::run`]); the transport task only moves frames.
//!
//! ```text
//!            ┌────────── Session::next() ──────────┐
//!            │                                     │
//!   channel.next_event()                 coalescer deadline
//!            │                                     │
//!   handlers → reconcile::apply        mutator.flush_due()
//!            │                                     │
//!            └──────────► PresentationStore ◄──────┘
//! ```
//!
//! Dropping or closing a session flushes pending coalesced updates,
//! deregisters the reconciler handlers and closes the transport.

use deck_core::{BlockStyles, Role, Slide, TextBlock};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::ws::WsTransport;
use crate::channel::{
    ChannelError, ChannelEvent, ConnectionState, JoinRequest, Subscription, SyncChannel,
};
use crate::config::SessionConfig;
use crate::mutator::{MutationError, Mutator};
use crate::reconcile;
use crate::store::PresentationStore;

/// What [`Session::next`] reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A channel event, already reconciled into the store.
    Channel(ChannelEvent),
    /// Coalesced updates sent because their window closed.
    Flushed(usize),
}

/// A local edit requested through [`Session::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    AddBlock { slide_id: String },
    InsertBlock { slide_id: String, block: TextBlock },
    UpdateBlockContent { slide_id: String, block_id: String, content: String },
    MoveBlock { slide_id: String, block_id: String, x: f64, y: f64 },
    ResizeBlock { slide_id: String, block_id: String, width: f64, height: f64 },
    UpdateBlockStyle { slide_id: String, block_id: String, styles: BlockStyles },
    RemoveBlock { slide_id: String, block_id: String },
    AddSlide,
    RemoveSlide { slide_id: String },
    ChangeUserRole { user_id: String, role: Role },
    NavigateSlide { slide_id: String },
    /// End the session.
    Close,
}

enum Wake {
    Channel(Option<ChannelEvent>),
    Deadline,
}

enum RunWake {
    Session(Option<SessionEvent>),
    Intent(Option<Intent>),
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A joined presentation.
pub struct Session {
    config: SessionConfig,
    store: PresentationStore,
    channel: SyncChannel,
    mutator: Mutator,
    subscriptions: Vec<Subscription>,
    closed: bool,
}

impl Session {
    /// Build a session over `channel` and register the reconciler.
    ///
    /// Call [`join`](Self::join) to announce the client.
    pub fn new(config: SessionConfig, channel: SyncChannel) -> Self {
        let store = PresentationStore::new(config.nickname.clone());
        store.set_connection_state(channel.state());

        let subscriptions = reconcile::handled_events()
            .iter()
            .map(|name| {
                let store = store.clone();
                channel.on(name, move |event| {
                    reconcile::apply(&store, event);
                })
            })
            .collect();

        let mutator = Mutator::new(store.clone(), config.coalesce_window);
        Self {
            config,
            store,
            channel,
            mutator,
            subscriptions,
            closed: false,
        }
    }

    /// Open a WebSocket session and join the configured presentation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: SessionConfig) -> Result<Self, ChannelError> {
        let (transport, events) = WsTransport::connect(
            config.server_url.clone(),
            config.reconnect.clone(),
            config.event_channel_capacity,
        );
        let channel = SyncChannel::new(
            Box::new(transport),
            events,
            config.offline_queue_capacity,
        );
        let mut session = Self::new(config, channel);
        session.join()?;
        Ok(session)
    }

    /// Announce this client. Replayed automatically after reconnects.
    pub fn join(&mut self) -> Result<(), ChannelError> {
        log::info!(
            "Joining {} as {}",
            self.config.presentation_id,
            self.config.nickname
        );
        self.channel.join(JoinRequest::new(
            self.config.nickname.clone(),
            self.config.presentation_id.clone(),
        ))
    }

    pub fn store(&self) -> &PresentationStore {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.store.connection_state()
    }

    /// Coalesced updates not yet sent.
    pub fn pending_updates(&self) -> usize {
        self.mutator.pending_len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ─── Driving ─────────────────────────────────────────────────────

    /// Wait for the next channel event or coalescing deadline.
    ///
    /// Returns `None` once the session is closed or the transport is gone.
    /// Cancel-safe.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            if self.closed {
                return None;
            }
            let deadline = self.mutator.next_deadline();
            let wake = tokio::select! {
                event = self.channel.next_event() => Wake::Channel(event),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Channel(Some(event)) => {
                    self.observe(&event);
                    return Some(SessionEvent::Channel(event));
                }
                Wake::Channel(None) => {
                    log::info!("Transport closed");
                    self.store.set_connection_state(ConnectionState::Disconnected);
                    return None;
                }
                Wake::Deadline => {
                    let sent = self.mutator.flush_due(&mut self.channel, Instant::now());
                    if sent > 0 {
                        return Some(SessionEvent::Flushed(sent));
                    }
                }
            }
        }
    }

    fn observe(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Connected { rejoined, replayed } => {
                log::info!("Connected (rejoined: {rejoined}, replayed: {replayed})");
                self.store.set_connection_state(ConnectionState::Connected);
            }
            ChannelEvent::Disconnected => {
                self.store.set_connection_state(ConnectionState::Reconnecting);
            }
            ChannelEvent::Failed { .. } => {
                self.store.set_connection_state(ConnectionState::Failed);
            }
            ChannelEvent::Message(_) | ChannelEvent::Rejected(_) => {}
        }
    }

    /// Drive the session, applying intents as they arrive.
    ///
    /// Returns when the intent sender is dropped, [`Intent::Close`] is
    /// received, or the transport is gone. The session is closed on return.
    pub async fn run(&mut self, mut intents: mpsc::Receiver<Intent>) {
        loop {
            let wake = tokio::select! {
                event = self.next() => RunWake::Session(event),
                intent = intents.recv() => RunWake::Intent(intent),
            };
            match wake {
                RunWake::Session(Some(_)) => {}
                RunWake::Session(None) | RunWake::Intent(None) | RunWake::Intent(Some(Intent::Close)) => break,
                RunWake::Intent(Some(intent)) => {
                    if let Err(e) = self.apply(intent) {
                        log::warn!("Intent refused: {e}");
                    }
                }
            }
        }
        self.close();
    }

    /// Apply one intent.
    pub fn apply(&mut self, intent: Intent) -> Result<(), MutationError> {
        match intent {
            Intent::AddBlock { slide_id } => self.add_block(&slide_id).map(drop),
            Intent::InsertBlock { slide_id, block } => self.insert_block(&slide_id, block),
            Intent::UpdateBlockContent {
                slide_id,
                block_id,
                content,
            } => self.update_block_content(&slide_id, &block_id, &content),
            Intent::MoveBlock {
                slide_id,
                block_id,
                x,
                y,
            } => self.move_block(&slide_id, &block_id, x, y),
            Intent::ResizeBlock {
                slide_id,
                block_id,
                width,
                height,
            } => self.resize_block(&slide_id, &block_id, width, height),
            Intent::UpdateBlockStyle {
                slide_id,
                block_id,
                styles,
            } => self.update_block_style(&slide_id, &block_id, styles),
            Intent::RemoveBlock { slide_id, block_id } => self.remove_block(&slide_id, &block_id),
            Intent::AddSlide => self.add_slide().map(drop),
            Intent::RemoveSlide { slide_id } => self.remove_slide(&slide_id),
            Intent::ChangeUserRole { user_id, role } => self.change_user_role(&user_id, role),
            Intent::NavigateSlide { slide_id } => self.navigate_slide(&slide_id).map(drop),
            Intent::Close => {
                self.close();
                Ok(())
            }
        }
    }

    // ─── Mutations ───────────────────────────────────────────────────

    pub fn add_block(&mut self, slide_id: &str) -> Result<TextBlock, MutationError> {
        self.mutator.add_block(&mut self.channel, slide_id)
    }

    pub fn insert_block(&mut self, slide_id: &str, block: TextBlock) -> Result<(), MutationError> {
        self.mutator.insert_block(&mut self.channel, slide_id, block)
    }

    pub fn update_block_content(
        &mut self,
        slide_id: &str,
        block_id: &str,
        content: &str,
    ) -> Result<(), MutationError> {
        self.mutator
            .update_block_content(&mut self.channel, slide_id, block_id, content)
    }

    pub fn move_block(
        &mut self,
        slide_id: &str,
        block_id: &str,
        x: f64,
        y: f64,
    ) -> Result<(), MutationError> {
        self.mutator
            .move_block(&mut self.channel, slide_id, block_id, x, y)
    }

    pub fn resize_block(
        &mut self,
        slide_id: &str,
        block_id: &str,
        width: f64,
        height: f64,
    ) -> Result<(), MutationError> {
        self.mutator
            .resize_block(&mut self.channel, slide_id, block_id, width, height)
    }

    pub fn update_block_style(
        &mut self,
        slide_id: &str,
        block_id: &str,
        styles: BlockStyles,
    ) -> Result<(), MutationError> {
        self.mutator
            .update_block_style(&mut self.channel, slide_id, block_id, styles)
    }

    pub fn remove_block(&mut self, slide_id: &str, block_id: &str) -> Result<(), MutationError> {
        self.mutator
            .remove_block(&mut self.channel, slide_id, block_id)
    }

    pub fn add_slide(&mut self) -> Result<Slide, MutationError> {
        self.mutator.add_slide(&mut self.channel)
    }

    pub fn remove_slide(&mut self, slide_id: &str) -> Result<(), MutationError> {
        self.mutator.remove_slide(&mut self.channel, slide_id)
    }

    pub fn change_user_role(&mut self, user_id: &str, role: Role) -> Result<(), MutationError> {
        self.mutator
            .change_user_role(&mut self.channel, user_id, role)
    }

    /// Returns whether the navigation was broadcast to other clients.
    pub fn navigate_slide(&mut self, slide_id: &str) -> Result<bool, MutationError> {
        self.mutator.navigate_slide(&mut self.channel, slide_id)
    }

    /// Send every pending coalesced update now.
    pub fn flush(&mut self) -> usize {
        self.mutator.flush_all(&mut self.channel)
    }

    /// Flush, deregister handlers and close the transport.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let flushed = self.flush();
        if flushed > 0 {
            log::debug!("Flushed {flushed} pending updates on close");
        }
        self.subscriptions.clear();
        self.channel.close();
        self.store.set_connection_state(ConnectionState::Disconnected);
        self.closed = true;
        log::info!("Session for {} closed", self.config.presentation_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("presentation_id", &self.config.presentation_id)
            .field("nickname", &self.config.nickname)
            .field("connection", &self.store.connection_state())
            .field("pending_updates", &self.mutator.pending_len())
            .field("closed", &self.closed)
            .finish()
    }
}
