//! Optimistic mutator: local edits applied first, then sent.
//!
//! Every operation follows the same steps:
//!
//! ```text
//!  role gate ──denied──► Err(Denied), nothing applied, nothing sent
//!      │
//!  validate refs ──stale──► Err(..), nothing applied, nothing sent
//!      │
//!  store.try_update (synchronous, watchers see it at once)
//!      │
//!  content / position / size ──► Coalescer ──(window closes)──► update-block
//!  everything else ──────────────────────────────────────────► sent now
//! ```
//!
//! Send failures after the local apply are logged and not returned; the
//! resync on reconnect repairs the local copy.

use deck_core::{
    can, Action, BlockStyles, Presentation, Role, Slide, TextBlock, DEFAULT_SLIDE_TITLE,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::channel::{ChannelError, SyncChannel};
use crate::coalesce::{CoalesceKey, Coalescer, UpdateKind};
use crate::protocol::ClientEvent;
use crate::store::{PresentationStore, StoreView};

/// Errors of local mutations. Never network errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("{role} may not {action}")]
    Denied { role: Role, action: Action },
    #[error("no presentation loaded")]
    NotLoaded,
    #[error("slide not found: {0}")]
    SlideNotFound(String),
    #[error("block {block_id} not found on slide {slide_id}")]
    BlockNotFound { slide_id: String, block_id: String },
    #[error("block already exists: {0}")]
    BlockExists(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("cannot remove the last slide")]
    LastSlide,
    #[error("cannot assign {role} to user {user_id}")]
    InvalidRoleAssignment { user_id: String, role: Role },
}

/// Where outbound events go.
pub trait Outbox {
    fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError>;

    /// Send an event that supersedes any queued event with the same key.
    fn send_keyed(&mut self, key: String, event: ClientEvent) -> Result<(), ChannelError>;
}

impl Outbox for SyncChannel {
    fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError> {
        SyncChannel::send(self, event)
    }

    fn send_keyed(&mut self, key: String, event: ClientEvent) -> Result<(), ChannelError> {
        SyncChannel::send_keyed(self, key, event)
    }
}

/// The one field a coalesced update changes.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingField {
    Content(String),
    Position { x: f64, y: f64 },
    Size { width: f64, height: f64 },
}

impl PendingField {
    pub fn kind(&self) -> UpdateKind {
        match self {
            PendingField::Content(_) => UpdateKind::Content,
            PendingField::Position { .. } => UpdateKind::Position,
            PendingField::Size { .. } => UpdateKind::Size,
        }
    }

    /// `block` with this field written over it; every other field kept.
    pub fn apply_to(&self, block: &TextBlock) -> TextBlock {
        match self {
            PendingField::Content(content) => block.with_content(content.as_str()),
            PendingField::Position { x, y } => block.moved_to(*x, *y),
            PendingField::Size { width, height } => block.resized_to(*width, *height),
        }
    }
}

/// Latest local value of one field, waiting for its window to close.
///
/// Only the field is kept: at flush time it is laid over the block as it is
/// then, so inbound changes to other fields survive.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub presentation_id: String,
    pub slide_id: String,
    pub field: PendingField,
}

/// Applies local edits to a store and emits them.
#[derive(Debug)]
pub struct Mutator {
    store: PresentationStore,
    coalescer: Coalescer<CoalesceKey, PendingUpdate>,
}

fn loaded(view: &StoreView) -> Result<&Presentation, MutationError> {
    view.presentation.as_deref().ok_or(MutationError::NotLoaded)
}

fn find_slide<'a>(p: &'a Presentation, slide_id: &str) -> Result<&'a Slide, MutationError> {
    p.slide(slide_id)
        .ok_or_else(|| MutationError::SlideNotFound(slide_id.to_owned()))
}

fn emit<O: Outbox + ?Sized>(out: &mut O, event: ClientEvent) {
    let name = event.name();
    if let Err(e) = out.send(event) {
        log::warn!("Applied {name} locally but could not send it: {e}");
    }
}

impl Mutator {
    pub fn new(store: PresentationStore, coalesce_window: Duration) -> Self {
        Self {
            store,
            coalescer: Coalescer::new(coalesce_window),
        }
    }

    pub fn store(&self) -> &PresentationStore {
        &self.store
    }

    fn gate(&self, action: Action) -> Result<(), MutationError> {
        let role = self.store.current_role();
        if can(role, action) {
            return Ok(());
        }
        let role = role.unwrap_or(Role::Unknown);
        log::debug!("Denied {action} for {role}");
        Err(MutationError::Denied { role, action })
    }

    // ─── Blocks ──────────────────────────────────────────────────────

    /// Add a block with default content, position and size.
    pub fn add_block<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
    ) -> Result<TextBlock, MutationError> {
        let block = TextBlock::default();
        self.insert_block(out, slide_id, block.clone())?;
        Ok(block)
    }

    /// Add `block` to a slide.
    pub fn insert_block<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block: TextBlock,
    ) -> Result<(), MutationError> {
        self.gate(Action::AddBlock)?;
        let mut presentation_id = String::new();
        self.store.try_update(|view| {
            let p = loaded(view)?;
            let slide = find_slide(p, slide_id)?;
            if slide.has_block(&block.id) {
                return Err(MutationError::BlockExists(block.id.clone()));
            }
            presentation_id = p.id.clone();
            let mut next = p.clone();
            if let Some(s) = next.slides.iter_mut().find(|s| s.id == slide_id) {
                s.blocks.push(block.clone());
            }
            Ok(view.with_presentation(next))
        })?;

        emit(
            out,
            ClientEvent::AddBlock {
                presentation_id,
                slide_id: slide_id.to_owned(),
                block,
            },
        );
        Ok(())
    }

    /// Replace the Markdown content of a block. Coalesced.
    pub fn update_block_content<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block_id: &str,
        content: &str,
    ) -> Result<(), MutationError> {
        let field = PendingField::Content(content.to_owned());
        self.edit_block(out, slide_id, block_id, |b| field.apply_to(b), Some(field.clone()))
    }

    /// Move a block. Coalesced.
    pub fn move_block<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block_id: &str,
        x: f64,
        y: f64,
    ) -> Result<(), MutationError> {
        let field = PendingField::Position { x, y };
        self.edit_block(out, slide_id, block_id, |b| field.apply_to(b), Some(field.clone()))
    }

    /// Resize a block. Coalesced.
    pub fn resize_block<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block_id: &str,
        width: f64,
        height: f64,
    ) -> Result<(), MutationError> {
        let field = PendingField::Size { width, height };
        self.edit_block(out, slide_id, block_id, |b| field.apply_to(b), Some(field.clone()))
    }

    /// Restyle a block. Sent immediately.
    pub fn update_block_style<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block_id: &str,
        styles: BlockStyles,
    ) -> Result<(), MutationError> {
        self.edit_block(out, slide_id, block_id, |b| b.with_styles(styles), None)
    }

    /// Apply `edit` to one block. With `coalesce` the field waits for its
    /// window; without, the whole block is sent at once and the block's
    /// pending fields are dropped. An edit that changes nothing sends nothing.
    fn edit_block<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block_id: &str,
        edit: impl FnOnce(&TextBlock) -> TextBlock,
        coalesce: Option<PendingField>,
    ) -> Result<(), MutationError> {
        self.gate(Action::UpdateBlock)?;
        let mut presentation_id = String::new();
        let mut updated = None;
        let changed = self.store.try_update(|view| {
            let p = loaded(view)?;
            let block = find_slide(p, slide_id)?.block(block_id).ok_or_else(|| {
                MutationError::BlockNotFound {
                    slide_id: slide_id.to_owned(),
                    block_id: block_id.to_owned(),
                }
            })?;
            let next_block = edit(block);
            let mut next = p.clone();
            if let Some(slot) = next
                .slides
                .iter_mut()
                .find(|s| s.id == slide_id)
                .and_then(|s| s.blocks.iter_mut().find(|b| b.id == block_id))
            {
                *slot = next_block.clone();
            }
            presentation_id = p.id.clone();
            updated = Some(next_block);
            Ok(view.with_presentation(next))
        })?;
        let Some(block) = updated.filter(|_| changed) else {
            log::debug!("Edit of block {block_id} changed nothing");
            return Ok(());
        };

        match coalesce {
            Some(field) => {
                let key = CoalesceKey::new(block_id, field.kind());
                let pending = PendingUpdate {
                    presentation_id,
                    slide_id: slide_id.to_owned(),
                    field,
                };
                self.coalescer.offer(key, pending, Instant::now());
            }
            None => {
                self.coalescer.cancel_where(|k| k.block_id == block_id);
                emit(
                    out,
                    ClientEvent::UpdateBlock {
                        presentation_id,
                        slide_id: slide_id.to_owned(),
                        block,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn remove_block<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
        block_id: &str,
    ) -> Result<(), MutationError> {
        self.gate(Action::RemoveBlock)?;
        let mut presentation_id = String::new();
        self.store.try_update(|view| {
            let p = loaded(view)?;
            if !find_slide(p, slide_id)?.has_block(block_id) {
                return Err(MutationError::BlockNotFound {
                    slide_id: slide_id.to_owned(),
                    block_id: block_id.to_owned(),
                });
            }
            presentation_id = p.id.clone();
            let mut next = p.clone();
            if let Some(s) = next.slides.iter_mut().find(|s| s.id == slide_id) {
                s.blocks.retain(|b| b.id != block_id);
            }
            Ok(view.with_presentation(next))
        })?;

        self.coalescer.cancel_where(|k| k.block_id == block_id);
        emit(
            out,
            ClientEvent::RemoveBlock {
                presentation_id,
                slide_id: slide_id.to_owned(),
                block_id: block_id.to_owned(),
            },
        );
        Ok(())
    }

    // ─── Slides ──────────────────────────────────────────────────────

    /// Append a new slide and make it current.
    pub fn add_slide<O: Outbox + ?Sized>(&mut self, out: &mut O) -> Result<Slide, MutationError> {
        self.gate(Action::AddSlide)?;
        let slide = Slide::new(DEFAULT_SLIDE_TITLE);
        let mut presentation_id = String::new();
        self.store.try_update(|view| {
            let p = loaded(view)?;
            presentation_id = p.id.clone();
            let mut presentation = p.clone();
            presentation.slides.push(slide.clone());
            let mut next = view.with_presentation(presentation);
            next.selection.current_slide_id = Some(slide.id.clone());
            next.selection.active_block_id = None;
            Ok(next)
        })?;

        emit(
            out,
            ClientEvent::AddSlide {
                presentation_id,
                slide: slide.clone(),
            },
        );
        Ok(slide)
    }

    /// Remove a slide. The last remaining slide cannot be removed.
    pub fn remove_slide<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
    ) -> Result<(), MutationError> {
        self.gate(Action::RemoveSlide)?;
        let mut presentation_id = String::new();
        let mut removed_blocks = Vec::new();
        self.store.try_update(|view| {
            let p = loaded(view)?;
            let slide = find_slide(p, slide_id)?;
            if p.slides.len() <= 1 {
                return Err(MutationError::LastSlide);
            }
            presentation_id = p.id.clone();
            removed_blocks = slide.blocks.iter().map(|b| b.id.clone()).collect();
            let mut next = p.clone();
            next.slides.retain(|s| s.id != slide_id);
            Ok(view.with_presentation(next))
        })?;

        self.coalescer
            .cancel_where(|k| removed_blocks.contains(&k.block_id));
        emit(
            out,
            ClientEvent::RemoveSlide {
                presentation_id,
                slide_id: slide_id.to_owned(),
            },
        );
        Ok(())
    }

    /// Show `slide_id` here and, for roles allowed to present, on every
    /// client. Returns whether the change was broadcast.
    pub fn navigate_slide<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        slide_id: &str,
    ) -> Result<bool, MutationError> {
        self.gate(Action::NavigateLocal)?;
        let presentation_id = {
            let view = self.store.view();
            let p = loaded(&view)?;
            find_slide(p, slide_id)?;
            p.id.clone()
        };
        self.store.select_slide(slide_id);

        if !can(self.store.current_role(), Action::NavigateBroadcast) {
            return Ok(false);
        }
        emit(
            out,
            ClientEvent::NavigateSlide {
                presentation_id,
                slide_id: slide_id.to_owned(),
            },
        );
        Ok(true)
    }

    // ─── Users ───────────────────────────────────────────────────────

    /// Assign EDITOR or VIEWER to another user.
    pub fn change_user_role<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        user_id: &str,
        role: Role,
    ) -> Result<(), MutationError> {
        self.gate(Action::ChangeUserRole)?;
        let mut presentation_id = String::new();
        self.store.try_update(|view| {
            let p = loaded(view)?;
            let user = p
                .user(user_id)
                .ok_or_else(|| MutationError::UserNotFound(user_id.to_owned()))?;
            let assignable = matches!(role, Role::Editor | Role::Viewer);
            let is_self = view.selection.current_user_id.as_deref() == Some(user_id);
            if !assignable || is_self || user.id == p.creator_id {
                return Err(MutationError::InvalidRoleAssignment {
                    user_id: user_id.to_owned(),
                    role,
                });
            }
            presentation_id = p.id.clone();
            let mut next = p.clone();
            if let Some(u) = next.users.iter_mut().find(|u| u.id == user_id) {
                u.role = role;
            }
            Ok(view.with_presentation(next))
        })?;

        emit(
            out,
            ClientEvent::ChangeUserRole {
                presentation_id,
                user_id: user_id.to_owned(),
                new_role: role,
            },
        );
        Ok(())
    }

    // ─── Coalescing ──────────────────────────────────────────────────

    /// When the next coalescing window closes.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.coalescer.next_deadline()
    }

    pub fn pending_len(&self) -> usize {
        self.coalescer.len()
    }

    /// Send every update whose window has closed by `now`.
    pub fn flush_due<O: Outbox + ?Sized>(&mut self, out: &mut O, now: Instant) -> usize {
        let due = self.coalescer.take_due(now);
        self.send_pending(out, due)
    }

    /// Send everything pending, regardless of windows.
    pub fn flush_all<O: Outbox + ?Sized>(&mut self, out: &mut O) -> usize {
        let pending = self.coalescer.drain();
        self.send_pending(out, pending)
    }

    /// Lay each pending field over the block as it is now and send one
    /// `update-block` per block. Blocks that vanished meanwhile are skipped.
    fn send_pending<O: Outbox + ?Sized>(
        &mut self,
        out: &mut O,
        pending: Vec<(CoalesceKey, PendingUpdate)>,
    ) -> usize {
        let Some(snapshot) = self.store.snapshot() else {
            return 0;
        };

        let mut frames: Vec<(CoalesceKey, PendingUpdate, TextBlock)> = Vec::new();
        for (key, update) in pending {
            if let Some((_, _, block)) = frames
                .iter_mut()
                .find(|(k, u, _)| k.block_id == key.block_id && u.slide_id == update.slide_id)
            {
                *block = update.field.apply_to(block);
                continue;
            }
            let Some(current) = snapshot.block(&update.slide_id, &key.block_id) else {
                log::debug!("Dropping coalesced update for vanished block {}", key.block_id);
                continue;
            };
            let block = update.field.apply_to(current);
            frames.push((key, update, block));
        }

        let mut sent = 0;
        for (key, update, block) in frames {
            log::debug!("Flushing update for block {}", key.block_id);
            let event = ClientEvent::UpdateBlock {
                presentation_id: update.presentation_id,
                slide_id: update.slide_id,
                block,
            };
            if let Err(e) = out.send_keyed(key.queue_key(), event) {
                log::warn!("Could not send coalesced update: {e}");
                continue;
            }
            sent += 1;
        }
        sent
    }
}
