//! Reconciler: inbound events as pure store transitions.
//!
//! [`transition`] maps the current [`StoreView`] and one [`ServerEvent`] to
//! the next view, or `None` when the event changes nothing (unknown ids,
//! duplicates, values already applied, or a full snapshot that breaks the
//! presentation's invariants). [`apply`] commits it to a store.
//!
//! The authority's order of arrival is final: an inbound update overwrites
//! whatever this client applied optimistically for the same block.

use std::sync::Arc;

use deck_core::{Presentation, User};

use crate::protocol::{names, ServerEvent};
use crate::store::{PresentationStore, StoreView};

/// Next view after `event`, or `None` if the event is a no-op.
pub fn transition(view: &StoreView, event: &ServerEvent) -> Option<StoreView> {
    match event {
        ServerEvent::PresentationData(presentation) => {
            presentation.validate().ok()?;
            Some(load(view, presentation))
        }
        ServerEvent::PresentationUpdate(presentation) => {
            presentation.validate().ok()?;
            Some(view.with_presentation(presentation.clone()))
        }
        ServerEvent::SlideAdded(slide) => patch(view, |p| {
            if p.has_slide(&slide.id) {
                return None;
            }
            let mut next = p.clone();
            next.slides.push(slide.clone());
            Some(next)
        }),
        ServerEvent::SlideRemoved(slide) => patch(view, |p| {
            let index = p.slide_index(&slide.slide_id)?;
            let mut next = p.clone();
            next.slides.remove(index);
            Some(next)
        }),
        ServerEvent::BlockAdded { slide_id, block } => patch(view, |p| {
            p.map_slide(slide_id, |s| {
                if s.has_block(&block.id) {
                    return None;
                }
                let mut next = s.clone();
                next.blocks.push(block.clone());
                Some(next)
            })
        }),
        ServerEvent::BlockUpdated { slide_id, block } => patch(view, |p| {
            p.map_slide(slide_id, |s| {
                let index = s.blocks.iter().position(|b| b.id == block.id)?;
                if s.blocks[index] == *block {
                    return None;
                }
                let mut next = s.clone();
                next.blocks[index] = block.clone();
                Some(next)
            })
        }),
        ServerEvent::BlockRemoved { slide_id, block_id } => patch(view, |p| {
            p.map_slide(slide_id, |s| {
                if !s.has_block(block_id) {
                    return None;
                }
                let mut next = s.clone();
                next.blocks.retain(|b| b.id != *block_id);
                Some(next)
            })
        }),
        ServerEvent::UserRoleChanged(user) => patch(view, |p| upsert_user(p, user)),
        ServerEvent::SlideNavigated(slide) => {
            let presentation = view.presentation.as_deref()?;
            if !presentation.has_slide(&slide.slide_id)
                || view.selection.current_slide_id.as_deref() == Some(slide.slide_id.as_str())
            {
                return None;
            }
            let mut next = view.clone();
            next.selection.current_slide_id = Some(slide.slide_id.clone());
            next.selection.active_block_id = None;
            Some(next)
        }
    }
}

/// Commit `event` to `store`. Returns whether the store changed.
pub fn apply(store: &PresentationStore, event: &ServerEvent) -> bool {
    if let ServerEvent::PresentationData(p) | ServerEvent::PresentationUpdate(p) = event {
        if let Err(e) = p.validate() {
            log::warn!("Rejecting {} for {}: {e}", event.name(), p.id);
            return false;
        }
    }
    let changed = store.update(|view| transition(view, event));
    if !changed {
        log::debug!("{} left the store unchanged", event.name());
    }
    changed
}

/// Inbound event names the reconciler handles.
pub fn handled_events() -> &'static [&'static str] {
    &names::INBOUND
}

fn patch(view: &StoreView, f: impl FnOnce(&Presentation) -> Option<Presentation>) -> Option<StoreView> {
    let current = view.presentation.as_deref()?;
    let next = f(current)?;
    Some(StoreView {
        presentation: Some(Arc::new(next)),
        ..view.clone()
    })
}

/// Snapshot from `presentation-data`: fresh user lookup, first slide if
/// the current one is gone.
fn load(view: &StoreView, presentation: &Presentation) -> StoreView {
    let mut next = view.with_presentation(presentation.clone());
    next.selection.current_user_id = presentation
        .user_by_nickname(&view.nickname)
        .map(|u| u.id.clone());

    let current_valid = next
        .selection
        .current_slide_id
        .as_deref()
        .is_some_and(|id| presentation.has_slide(id));
    if !current_valid {
        next.selection.current_slide_id = presentation.first_slide_id().map(str::to_owned);
        next.selection.active_block_id = None;
    }
    next
}

fn upsert_user(presentation: &Presentation, user: &User) -> Option<Presentation> {
    let mut next = presentation.clone();
    match next.users.iter_mut().find(|u| u.id == user.id) {
        Some(existing) if existing == user => return None,
        Some(existing) => *existing = user.clone(),
        None => next.users.push(user.clone()),
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SlideRef;
    use deck_core::{Role, Slide, TextBlock};

    fn deck() -> Presentation {
        let mut p = Presentation::new("Deck", User::new("alice", Role::Creator));
        p.slides[0].id = "s1".into();
        let mut s2 = Slide::new("Two");
        s2.id = "s2".into();
        let mut block = TextBlock::new("hello", 10.0, 10.0);
        block.id = "b1".into();
        s2.blocks.push(block);
        p.slides.push(s2);
        let mut bob = User::new("bob", Role::Editor);
        bob.id = "u-bob".into();
        p.users.push(bob);
        p
    }

    fn loaded(nickname: &str) -> StoreView {
        let view = StoreView {
            nickname: nickname.into(),
            ..StoreView::default()
        };
        transition(&view, &ServerEvent::PresentationData(deck())).unwrap()
    }

    #[test]
    fn test_presentation_data_resolves_user_and_slide() {
        let view = loaded("bob");
        assert_eq!(view.selection.current_user_id.as_deref(), Some("u-bob"));
        assert_eq!(view.selection.current_slide_id.as_deref(), Some("s1"));
        assert_eq!(view.current_role(), Some(Role::Editor));
    }

    #[test]
    fn test_presentation_data_keeps_valid_current_slide() {
        let mut view = loaded("bob");
        view.selection.current_slide_id = Some("s2".into());
        let next = transition(&view, &ServerEvent::PresentationData(deck())).unwrap();
        assert_eq!(next.selection.current_slide_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_block_updated_is_idempotent() {
        let store = PresentationStore::new("bob");
        apply(&store, &ServerEvent::PresentationData(deck()));

        let block = TextBlock {
            id: "b1".into(),
            ..TextBlock::new("changed", 1.0, 2.0)
        };
        let event = ServerEvent::BlockUpdated {
            slide_id: "s2".into(),
            block,
        };

        assert!(apply(&store, &event));
        let version = store.version();
        let snapshot = store.snapshot();

        assert!(!apply(&store, &event));
        assert_eq!(store.version(), version);
        assert_eq!(store.snapshot(), snapshot);
    }

    #[test]
    fn test_stale_references_are_noops() {
        let view = loaded("bob");
        let block = TextBlock::default();

        let events = [
            ServerEvent::BlockUpdated {
                slide_id: "gone".into(),
                block: block.clone(),
            },
            ServerEvent::BlockUpdated {
                slide_id: "s2".into(),
                block: block.clone(),
            },
            ServerEvent::BlockRemoved {
                slide_id: "s2".into(),
                block_id: "nope".into(),
            },
            ServerEvent::BlockAdded {
                slide_id: "gone".into(),
                block,
            },
            ServerEvent::SlideRemoved(SlideRef::new("gone")),
            ServerEvent::SlideNavigated(SlideRef::new("gone")),
        ];
        for event in events {
            assert!(transition(&view, &event).is_none(), "{}", event.name());
        }
    }

    #[test]
    fn test_duplicate_adds_are_noops() {
        let view = loaded("bob");
        let s2 = view.presentation.as_ref().unwrap().slides[1].clone();
        assert!(transition(&view, &ServerEvent::SlideAdded(s2.clone())).is_none());

        let b1 = s2.blocks[0].clone();
        let event = ServerEvent::BlockAdded {
            slide_id: "s2".into(),
            block: b1,
        };
        assert!(transition(&view, &event).is_none());
    }

    #[test]
    fn test_events_before_load_are_ignored() {
        let view = StoreView::default();
        assert!(transition(&view, &ServerEvent::SlideAdded(Slide::new("x"))).is_none());
        assert!(transition(&view, &ServerEvent::SlideNavigated(SlideRef::new("s1"))).is_none());
    }

    #[test]
    fn test_slide_removed_never_leaves_dangling_selection() {
        let store = PresentationStore::new("bob");
        apply(&store, &ServerEvent::PresentationData(deck()));
        store.select_slide("s2");
        store.set_active_block(Some("b1"));

        apply(&store, &ServerEvent::SlideRemoved(SlideRef::new("s2")));
        let selection = store.selection();
        assert_eq!(selection.current_slide_id.as_deref(), Some("s1"));
        assert_eq!(selection.active_block_id, None);

        apply(&store, &ServerEvent::SlideRemoved(SlideRef::new("s1")));
        assert_eq!(store.selection().current_slide_id, None);
        assert!(store.current_slide().is_none());
    }

    #[test]
    fn test_block_removed_clears_active_block() {
        let store = PresentationStore::new("bob");
        apply(&store, &ServerEvent::PresentationData(deck()));
        store.select_slide("s2");
        store.set_active_block(Some("b1"));

        apply(
            &store,
            &ServerEvent::BlockRemoved {
                slide_id: "s2".into(),
                block_id: "b1".into(),
            },
        );
        assert_eq!(store.selection().active_block_id, None);
        assert_eq!(store.selection().current_slide_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_role_change_updates_current_role() {
        let store = PresentationStore::new("bob");
        apply(&store, &ServerEvent::PresentationData(deck()));
        assert_eq!(store.current_role(), Some(Role::Editor));

        let mut bob = store.current_user().unwrap();
        bob.role = Role::Viewer;
        assert!(apply(&store, &ServerEvent::UserRoleChanged(bob.clone())));
        assert_eq!(store.current_role(), Some(Role::Viewer));
        assert!(!apply(&store, &ServerEvent::UserRoleChanged(bob)));
    }

    #[test]
    fn test_unseen_user_is_appended() {
        let view = loaded("alice");
        let carol = User::new("carol", Role::Viewer);
        let next = transition(&view, &ServerEvent::UserRoleChanged(carol.clone())).unwrap();
        assert_eq!(next.presentation.unwrap().user(&carol.id), Some(&carol));
    }

    #[test]
    fn test_slide_navigated_moves_selection() {
        let view = loaded("bob");
        let next = transition(&view, &ServerEvent::SlideNavigated(SlideRef::new("s2"))).unwrap();
        assert_eq!(next.selection.current_slide_id.as_deref(), Some("s2"));
        assert!(transition(&next, &ServerEvent::SlideNavigated(SlideRef::new("s2"))).is_none());
    }

    #[test]
    fn test_presentation_update_keeps_selection() {
        let mut view = loaded("bob");
        view.selection.current_slide_id = Some("s2".into());
        let mut updated = deck();
        updated.title = "Renamed".into();

        let next = transition(&view, &ServerEvent::PresentationUpdate(updated)).unwrap();
        assert_eq!(next.presentation.unwrap().title, "Renamed");
        assert_eq!(next.selection.current_slide_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_snapshot_breaking_invariants_is_rejected() {
        let no_slides = {
            let mut p = deck();
            p.slides.clear();
            p
        };
        let ghost_creator = {
            let mut p = deck();
            p.creator_id = "ghost".into();
            p
        };
        let second_creator = {
            let mut p = deck();
            p.users[1].role = Role::Creator;
            p
        };
        let demoted_creator = {
            let mut p = deck();
            p.users[0].role = Role::Editor;
            p
        };
        let duplicate_user = {
            let mut p = deck();
            let copy = p.users[1].clone();
            p.users.push(copy);
            p
        };
        let duplicate_slide = {
            let mut p = deck();
            let copy = p.slides[0].clone();
            p.slides.push(copy);
            p
        };

        let store = PresentationStore::new("bob");
        apply(&store, &ServerEvent::PresentationData(deck()));
        let view = store.view();
        let version = store.version();

        for bad in [
            no_slides,
            ghost_creator,
            second_creator,
            demoted_creator,
            duplicate_user,
            duplicate_slide,
        ] {
            assert!(bad.validate().is_err());
            for event in [
                ServerEvent::PresentationData(bad.clone()),
                ServerEvent::PresentationUpdate(bad.clone()),
            ] {
                assert!(transition(&view, &event).is_none());
                assert!(!apply(&store, &event));
            }
        }
        assert_eq!(store.view(), view);
        assert_eq!(store.version(), version);
    }

    #[test]
    fn test_invalid_first_snapshot_leaves_store_empty() {
        let store = PresentationStore::new("bob");
        let mut p = deck();
        p.slides.clear();

        assert!(!apply(&store, &ServerEvent::PresentationData(p)));
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_every_inbound_event_is_handled() {
        assert_eq!(handled_events().len(), 9);
    }
}
