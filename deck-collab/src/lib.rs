//! # deck-collab: Client-side synchronization for shared slide decks
//!
//! Keeps this client's copy of a presentation in step with the presentation
//! authority: local edits are applied optimistically and sent, inbound
//! events (including those caused by other clients) are reconciled into
//! the local copy.
//!
//! ## Architecture
//!
//! ```text
//!  UI action ──► Role gate ──► Mutator ──┬──► PresentationStore ──► watchers
//!                                │       │            ▲
//!                           Coalescer    │            │ reconcile::apply
//!                                │       ▼            │
//!                                └──► SyncChannel ◄───┘
//!                                        │  ▲
//!                                 frames │  │ frames
//!                                        ▼  │
//!                                  ┌─────────────┐
//!                                  │ authority   │
//!                                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Named-event JSON envelope (`{"event", "data"}`)
//! - [`channel`]: Sync channel with offline queue and join replay;
//!   WebSocket and in-memory transports
//! - [`store`]: Aggregate store (snapshot + selection, versioned)
//! - [`reconcile`]: Inbound events as pure store transitions
//! - [`coalesce`]: Per-key update coalescing
//! - [`mutator`]: Optimistic local mutations
//! - [`session`]: Wires everything together on one task
//! - [`catalog`]: HTTP list/create of presentations
//! - [`config`]: Session and catalog configuration

pub mod catalog;
pub mod channel;
pub mod coalesce;
pub mod config;
pub mod mutator;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use catalog::{CatalogClient, CatalogError, PresentationSummary};
pub use channel::memory::{MemoryRemote, MemoryTransport};
pub use channel::ws::{Backoff, WsTransport};
pub use channel::{
    ChannelError, ChannelEvent, ConnectionState, JoinRequest, OfflineQueue, Subscription,
    SubscriptionId, SyncChannel, Transport, TransportEvent,
};
pub use coalesce::{CoalesceKey, Coalescer, UpdateKind};
pub use config::{CatalogConfig, ReconnectPolicy, SessionConfig};
pub use mutator::{MutationError, Mutator, Outbox, PendingField, PendingUpdate};
pub use protocol::{ClientEvent, Envelope, ProtocolError, ServerEvent, SlideRef};
pub use session::{Intent, Session, SessionEvent};
pub use store::{PresentationStore, Selection, StoreView};
