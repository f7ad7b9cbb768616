//! Named-event wire protocol spoken with the presentation authority.
//!
//! Every WebSocket text frame carries one JSON envelope:
//! ```text
//! { "event": "<kebab-case name>", "data": <payload> }
//! ```
//!
//! [`ClientEvent`] covers the outbound names, [`ServerEvent`] the inbound
//! ones. Payload field names are camelCase and role values are the exact
//! strings `"CREATOR"`, `"EDITOR"` and `"VIEWER"`.

use deck_core::{Presentation, Role, Slide, TextBlock, User};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event names, as they appear in the `event` field of the envelope.
pub mod names {
    pub const JOIN_PRESENTATION: &str = "join-presentation";
    pub const ADD_SLIDE: &str = "add-slide";
    pub const REMOVE_SLIDE: &str = "remove-slide";
    pub const ADD_BLOCK: &str = "add-block";
    pub const UPDATE_BLOCK: &str = "update-block";
    pub const REMOVE_BLOCK: &str = "remove-block";
    pub const CHANGE_USER_ROLE: &str = "change-user-role";
    pub const NAVIGATE_SLIDE: &str = "navigate-slide";

    pub const PRESENTATION_DATA: &str = "presentation-data";
    pub const PRESENTATION_UPDATE: &str = "presentation-update";
    pub const SLIDE_ADDED: &str = "slide-added";
    pub const SLIDE_REMOVED: &str = "slide-removed";
    pub const BLOCK_ADDED: &str = "block-added";
    pub const BLOCK_UPDATED: &str = "block-updated";
    pub const BLOCK_REMOVED: &str = "block-removed";
    pub const USER_ROLE_CHANGED: &str = "user-role-changed";
    pub const SLIDE_NAVIGATED: &str = "slide-navigated";

    /// Every event name the authority may send.
    pub const INBOUND: [&str; 9] = [
        PRESENTATION_DATA,
        PRESENTATION_UPDATE,
        SLIDE_ADDED,
        SLIDE_REMOVED,
        BLOCK_ADDED,
        BLOCK_UPDATED,
        BLOCK_REMOVED,
        USER_ROLE_CHANGED,
        SLIDE_NAVIGATED,
    ];
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("failed to encode {event}: {reason}")]
    Encode { event: String, reason: String },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("malformed payload for {event}: {reason}")]
    MalformedPayload { event: String, reason: String },
}

/// Raw frame before the payload is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

/// Events sent from this client to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinPresentation {
        nickname: String,
        presentation_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AddSlide { presentation_id: String, slide: Slide },
    #[serde(rename_all = "camelCase")]
    RemoveSlide {
        presentation_id: String,
        slide_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AddBlock {
        presentation_id: String,
        slide_id: String,
        block: TextBlock,
    },
    #[serde(rename_all = "camelCase")]
    UpdateBlock {
        presentation_id: String,
        slide_id: String,
        block: TextBlock,
    },
    #[serde(rename_all = "camelCase")]
    RemoveBlock {
        presentation_id: String,
        slide_id: String,
        block_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ChangeUserRole {
        presentation_id: String,
        user_id: String,
        new_role: Role,
    },
    #[serde(rename_all = "camelCase")]
    NavigateSlide {
        presentation_id: String,
        slide_id: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinPresentation { .. } => names::JOIN_PRESENTATION,
            ClientEvent::AddSlide { .. } => names::ADD_SLIDE,
            ClientEvent::RemoveSlide { .. } => names::REMOVE_SLIDE,
            ClientEvent::AddBlock { .. } => names::ADD_BLOCK,
            ClientEvent::UpdateBlock { .. } => names::UPDATE_BLOCK,
            ClientEvent::RemoveBlock { .. } => names::REMOVE_BLOCK,
            ClientEvent::ChangeUserRole { .. } => names::CHANGE_USER_ROLE,
            ClientEvent::NavigateSlide { .. } => names::NAVIGATE_SLIDE,
        }
    }

    /// Id of the block this event targets, if any.
    pub fn block_id(&self) -> Option<&str> {
        match self {
            ClientEvent::AddBlock { block, .. } | ClientEvent::UpdateBlock { block, .. } => {
                Some(&block.id)
            }
            ClientEvent::RemoveBlock { block_id, .. } => Some(block_id),
            _ => None,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode {
            event: self.name().to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a text frame (used by test authorities).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(text)?;
        let event = envelope.event.clone();
        let value = serde_json::to_value(&envelope)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
            event,
            reason: e.to_string(),
        })
    }
}

/// Reference to a slide by id.
///
/// Accepts both `{"slideId": "s2"}` and the bare string `"s2"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SlideRefWire")]
pub struct SlideRef {
    pub slide_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SlideRefWire {
    Bare(String),
    #[serde(rename_all = "camelCase")]
    Object { slide_id: String },
}

impl From<SlideRefWire> for SlideRef {
    fn from(wire: SlideRefWire) -> Self {
        match wire {
            SlideRefWire::Bare(slide_id) | SlideRefWire::Object { slide_id } => Self { slide_id },
        }
    }
}

impl SlideRef {
    pub fn new(slide_id: impl Into<String>) -> Self {
        Self {
            slide_id: slide_id.into(),
        }
    }
}

/// Events pushed by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Full snapshot, the reply to `join-presentation`.
    PresentationData(Presentation),
    /// Full-state broadcast after an edit.
    PresentationUpdate(Presentation),
    SlideAdded(Slide),
    SlideRemoved(SlideRef),
    #[serde(rename_all = "camelCase")]
    BlockAdded { slide_id: String, block: TextBlock },
    #[serde(rename_all = "camelCase")]
    BlockUpdated { slide_id: String, block: TextBlock },
    #[serde(rename_all = "camelCase")]
    BlockRemoved { slide_id: String, block_id: String },
    UserRoleChanged(User),
    SlideNavigated(SlideRef),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PresentationData(_) => names::PRESENTATION_DATA,
            ServerEvent::PresentationUpdate(_) => names::PRESENTATION_UPDATE,
            ServerEvent::SlideAdded(_) => names::SLIDE_ADDED,
            ServerEvent::SlideRemoved(_) => names::SLIDE_REMOVED,
            ServerEvent::BlockAdded { .. } => names::BLOCK_ADDED,
            ServerEvent::BlockUpdated { .. } => names::BLOCK_UPDATED,
            ServerEvent::BlockRemoved { .. } => names::BLOCK_REMOVED,
            ServerEvent::UserRoleChanged(_) => names::USER_ROLE_CHANGED,
            ServerEvent::SlideNavigated(_) => names::SLIDE_NAVIGATED,
        }
    }

    /// Parse a text frame.
    ///
    /// Unknown names yield [`ProtocolError::UnknownEvent`] so callers can
    /// ignore them quietly; a known name with a bad payload yields
    /// [`ProtocolError::MalformedPayload`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::decode(text)?)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        if !names::INBOUND.contains(&envelope.event.as_str()) {
            return Err(ProtocolError::UnknownEvent(envelope.event));
        }
        let event = envelope.event.clone();
        let value = serde_json::to_value(&envelope)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
            event,
            reason: e.to_string(),
        })
    }

    /// Serialize to a text frame (used by test authorities).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode {
            event: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}
