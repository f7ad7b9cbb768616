//! Role gate: which user role may perform which action.
//!
//! Consulted before any mutation is attempted. The gate is total over
//! [`Role`]; a role string that does not match a known value becomes
//! [`Role::Unknown`] and is denied every mutating action.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a user within one presentation.
///
/// Transmitted as `"CREATOR"`, `"EDITOR"` or `"VIEWER"` (case-sensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Creator,
    Editor,
    Viewer,
    /// Anything else received on the wire.
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Method form of [`can`].
    pub fn permits(self, action: Action) -> bool {
        can(Some(self), action)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Creator => "CREATOR",
            Role::Editor => "EDITOR",
            Role::Viewer => "VIEWER",
            Role::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a user may try to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    View,
    /// Change the slide shown on this client only.
    NavigateLocal,
    /// Change the slide shown on every client.
    NavigateBroadcast,
    AddBlock,
    UpdateBlock,
    RemoveBlock,
    AddSlide,
    RemoveSlide,
    ChangeUserRole,
}

impl Action {
    /// Whether the action changes shared presentation state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Action::View | Action::NavigateLocal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::View => "view",
            Action::NavigateLocal => "navigate-slide",
            Action::NavigateBroadcast => "navigate-slide-broadcast",
            Action::AddBlock => "add-block",
            Action::UpdateBlock => "update-block",
            Action::RemoveBlock => "remove-block",
            Action::AddSlide => "add-slide",
            Action::RemoveSlide => "remove-slide",
            Action::ChangeUserRole => "change-user-role",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide whether `role` may perform `action`.
///
/// `None` means the local user is not resolved yet and is treated like an
/// unknown role.
pub fn can(role: Option<Role>, action: Action) -> bool {
    use Action::*;

    match (role.unwrap_or(Role::Unknown), action) {
        (_, View | NavigateLocal) => true,
        (Role::Creator, _) => true,
        (Role::Editor, AddBlock | UpdateBlock | RemoveBlock) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ACTIONS: [Action; 9] = [
        Action::View,
        Action::NavigateLocal,
        Action::NavigateBroadcast,
        Action::AddBlock,
        Action::UpdateBlock,
        Action::RemoveBlock,
        Action::AddSlide,
        Action::RemoveSlide,
        Action::ChangeUserRole,
    ];

    #[test]
    fn test_viewer_only_views() {
        for action in ALL_ACTIONS {
            assert_eq!(Role::Viewer.permits(action), !action.is_mutating(), "{action}");
        }
    }

    #[test]
    fn test_editor_edits_blocks_only() {
        assert!(Role::Editor.permits(Action::AddBlock));
        assert!(Role::Editor.permits(Action::UpdateBlock));
        assert!(Role::Editor.permits(Action::RemoveBlock));
        assert!(!Role::Editor.permits(Action::AddSlide));
        assert!(!Role::Editor.permits(Action::RemoveSlide));
        assert!(!Role::Editor.permits(Action::ChangeUserRole));
        assert!(!Role::Editor.permits(Action::NavigateBroadcast));
    }

    #[test]
    fn test_creator_can_do_everything() {
        assert!(ALL_ACTIONS.iter().all(|a| Role::Creator.permits(*a)));
    }

    #[test]
    fn test_unknown_and_unresolved_fail_closed() {
        for action in ALL_ACTIONS.into_iter().filter(|a| a.is_mutating()) {
            assert!(!Role::Unknown.permits(action));
            assert!(!can(None, action));
        }
        assert!(can(None, Action::View));
    }

    #[test]
    fn test_role_wire_values_are_case_sensitive() {
        let parsed: Role = serde_json::from_str("\"EDITOR\"").unwrap();
        assert_eq!(parsed, Role::Editor);

        let lower: Role = serde_json::from_str("\"editor\"").unwrap();
        assert_eq!(lower, Role::Unknown);

        assert_eq!(serde_json::to_string(&Role::Viewer).unwrap(), "\"VIEWER\"");
    }
}
