//! Aggregate store: this client's copy of the presentation.
//!
//! Holds the current [`Presentation`] snapshot behind an `Arc` together with
//! the client-local [`Selection`]. Every change goes through a pure updater
//! that builds a new [`StoreView`]; the previous snapshot is never touched,
//! so a renderer holding an older `Arc` keeps a consistent graph.
//!
//! ```text
//!  Mutator ──┐                       ┌── view() / snapshot()  (render)
//!            ├─► update(pure fn) ─► commit ─► watch::Sender<u64>
//!  Reconciler┘        │                       (version bump → re-render)
//!                     └─ repair selection (no dangling ids)
//! ```
//!
//! A commit whose result equals the current view is a no-op: the version is
//! not bumped and watchers are not woken. Re-applying an event that is
//! already reflected locally therefore changes nothing.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use deck_core::{Presentation, Role, Slide, User};
use tokio::sync::watch;

use crate::channel::ConnectionState;

/// Client-local selection. Never synchronized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub current_slide_id: Option<String>,
    pub current_user_id: Option<String>,
    pub active_block_id: Option<String>,
}

/// Snapshot plus selection, as seen at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreView {
    pub presentation: Option<Arc<Presentation>>,
    pub selection: Selection,
    /// Nickname this client joined with; used to find the local user.
    pub nickname: String,
}

impl StoreView {
    pub fn current_slide(&self) -> Option<&Slide> {
        let presentation = self.presentation.as_deref()?;
        presentation.slide(self.selection.current_slide_id.as_deref()?)
    }

    pub fn current_user(&self) -> Option<&User> {
        let presentation = self.presentation.as_deref()?;
        presentation.user(self.selection.current_user_id.as_deref()?)
    }

    pub fn current_role(&self) -> Option<Role> {
        self.current_user().map(|u| u.role)
    }

    /// Copy of this view with `presentation` swapped in.
    pub fn with_presentation(&self, presentation: Presentation) -> StoreView {
        StoreView {
            presentation: Some(Arc::new(presentation)),
            ..self.clone()
        }
    }

    /// Drop ids that no longer resolve.
    ///
    /// A missing current slide falls back to the first slide; a missing
    /// current user is re-derived from the nickname; a missing active block
    /// is cleared.
    fn repair_selection(&mut self) {
        let Some(presentation) = self.presentation.as_deref() else {
            self.selection.current_slide_id = None;
            self.selection.active_block_id = None;
            return;
        };

        if let Some(id) = self.selection.current_slide_id.as_deref() {
            if !presentation.has_slide(id) {
                self.selection.current_slide_id =
                    presentation.first_slide_id().map(str::to_owned);
            }
        }

        let user_known = self
            .selection
            .current_user_id
            .as_deref()
            .is_some_and(|id| presentation.user(id).is_some());
        if !user_known {
            self.selection.current_user_id = presentation
                .user_by_nickname(&self.nickname)
                .map(|u| u.id.clone());
        }

        let block_known = match (
            self.selection.current_slide_id.as_deref(),
            self.selection.active_block_id.as_deref(),
        ) {
            (Some(slide_id), Some(block_id)) => presentation.block(slide_id, block_id).is_some(),
            (_, None) => true,
            (None, Some(_)) => false,
        };
        if !block_known {
            self.selection.active_block_id = None;
        }
    }
}

struct StoreState {
    view: StoreView,
    connection: ConnectionState,
    version: u64,
}

/// Cloneable handle to the shared presentation state.
#[derive(Clone)]
pub struct PresentationStore {
    inner: Arc<RwLock<StoreState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl PresentationStore {
    /// Empty store for a client joining as `nickname`.
    pub fn new(nickname: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(StoreState {
                view: StoreView {
                    nickname: nickname.into(),
                    ..StoreView::default()
                },
                connection: ConnectionState::Disconnected,
                version: 0,
            })),
            changes: Arc::new(changes),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, state: &mut StoreState) {
        state.version += 1;
        self.changes.send_replace(state.version);
    }

    /// Current snapshot, if a presentation has been loaded.
    pub fn snapshot(&self) -> Option<Arc<Presentation>> {
        self.read().view.presentation.clone()
    }

    /// Snapshot and selection, read together.
    pub fn view(&self) -> StoreView {
        self.read().view.clone()
    }

    /// Number of effective changes committed so far.
    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn nickname(&self) -> String {
        self.read().view.nickname.clone()
    }

    pub fn selection(&self) -> Selection {
        self.read().view.selection.clone()
    }

    pub fn current_slide(&self) -> Option<Slide> {
        self.read().view.current_slide().cloned()
    }

    pub fn current_user(&self) -> Option<User> {
        self.read().view.current_user().cloned()
    }

    /// Role of the local user; `None` until the user is resolved.
    pub fn current_role(&self) -> Option<Role> {
        self.read().view.current_role()
    }

    /// Subscribe to change notifications (the value is the version).
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Apply a pure transition of snapshot and selection.
    ///
    /// `f` returning `None`, or a view equal to the current one, leaves the
    /// store untouched. Returns whether anything changed.
    pub fn update(&self, f: impl FnOnce(&StoreView) -> Option<StoreView>) -> bool {
        let mut state = self.write();
        match f(&state.view) {
            Some(next) => self.commit(&mut state, next),
            None => false,
        }
    }

    /// Like [`update`](Self::update), for transitions that may be refused.
    pub fn try_update<E>(
        &self,
        f: impl FnOnce(&StoreView) -> Result<StoreView, E>,
    ) -> Result<bool, E> {
        let mut state = self.write();
        let next = f(&state.view)?;
        Ok(self.commit(&mut state, next))
    }

    fn commit(&self, state: &mut StoreState, mut next: StoreView) -> bool {
        next.repair_selection();
        if next == state.view {
            return false;
        }
        state.view = next;
        self.bump(state);
        true
    }

    /// Apply a pure transition of the snapshot only.
    ///
    /// No-op while nothing is loaded.
    pub fn patch(&self, f: impl FnOnce(&Presentation) -> Option<Presentation>) -> bool {
        self.update(|view| {
            let current = view.presentation.as_deref()?;
            let next = f(current)?;
            Some(view.with_presentation(next))
        })
    }

    /// Replace the snapshot wholesale.
    pub fn replace(&self, presentation: Presentation) -> bool {
        self.update(|view| Some(view.with_presentation(presentation)))
    }

    /// Discard the presentation and selection (session ended).
    pub fn clear(&self) -> bool {
        self.update(|view| {
            Some(StoreView {
                nickname: view.nickname.clone(),
                ..StoreView::default()
            })
        })
    }

    /// Make `slide_id` the current slide. Unknown ids are ignored.
    pub fn select_slide(&self, slide_id: &str) -> bool {
        self.update(|view| {
            let presentation = view.presentation.as_deref()?;
            if !presentation.has_slide(slide_id) {
                return None;
            }
            let mut next = view.clone();
            if next.selection.current_slide_id.as_deref() != Some(slide_id) {
                next.selection.active_block_id = None;
            }
            next.selection.current_slide_id = Some(slide_id.to_owned());
            Some(next)
        })
    }

    /// Mark the block being edited on the current slide.
    pub fn set_active_block(&self, block_id: Option<&str>) -> bool {
        self.update(|view| {
            let mut next = view.clone();
            next.selection.active_block_id = block_id.map(str::to_owned);
            Some(next)
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.read().connection
    }

    pub fn set_connection_state(&self, connection: ConnectionState) -> bool {
        let mut state = self.write();
        if state.connection == connection {
            return false;
        }
        state.connection = connection;
        self.bump(&mut state);
        true
    }
}

impl std::fmt::Debug for PresentationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("PresentationStore")
            .field("view", &state.view)
            .field("connection", &state.connection)
            .field("version", &state.version)
            .finish()
    }
}
