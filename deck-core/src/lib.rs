//! # deck-core: shared data model for collaborative slide decks
//!
//! Plain value types exchanged between clients and the presentation
//! authority, plus the [`role`] gate that decides which user may do what.
//! Nothing in this crate performs I/O.
//!
//! Entities are value-like: every transition produces a new snapshot, so a
//! reader holding an older `Arc<Presentation>` never observes a partially
//! applied change.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod role;

pub use role::{can, Action, Role};

/// Title given to slides created from the client.
pub const DEFAULT_SLIDE_TITLE: &str = "New Slide";
/// Content given to text blocks created from the client.
pub const DEFAULT_BLOCK_CONTENT: &str = "New text block. **Markdown** supported!";
pub const DEFAULT_BLOCK_X: f64 = 50.0;
pub const DEFAULT_BLOCK_Y: f64 = 50.0;
pub const DEFAULT_BLOCK_WIDTH: f64 = 200.0;
pub const DEFAULT_BLOCK_HEIGHT: f64 = 100.0;

/// Generate a fresh entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Invariant violations of a [`Presentation`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("presentation {0} has no slides")]
    NoSlides(String),
    #[error("creator {0} is not a member of the presentation")]
    CreatorNotMember(String),
    #[error("user {user_id} holds CREATOR but the presentation creator is {creator_id}")]
    ForeignCreator { user_id: String, creator_id: String },
    #[error("creator {0} does not hold the CREATOR role")]
    CreatorDemoted(String),
    #[error("duplicate user id: {0}")]
    DuplicateUser(String),
    #[error("duplicate slide id: {0}")]
    DuplicateSlide(String),
}

/// The shared deck: ordered slides plus the users allowed to see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presentation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub creator_id: String,
    #[serde(default)]
    pub slides: Vec<Slide>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl Presentation {
    /// Create a presentation owned by `creator`, with one empty slide.
    pub fn new(title: impl Into<String>, creator: User) -> Self {
        let creator = User {
            role: Role::Creator,
            ..creator
        };
        Self {
            id: new_id(),
            title: title.into(),
            creator_id: creator.id.clone(),
            slides: vec![Slide::new(DEFAULT_SLIDE_TITLE)],
            users: vec![creator],
        }
    }

    pub fn slide(&self, slide_id: &str) -> Option<&Slide> {
        self.slides.iter().find(|s| s.id == slide_id)
    }

    pub fn slide_index(&self, slide_id: &str) -> Option<usize> {
        self.slides.iter().position(|s| s.id == slide_id)
    }

    pub fn has_slide(&self, slide_id: &str) -> bool {
        self.slide(slide_id).is_some()
    }

    /// Id of the first slide in display order.
    pub fn first_slide_id(&self) -> Option<&str> {
        self.slides.first().map(|s| s.id.as_str())
    }

    pub fn block(&self, slide_id: &str, block_id: &str) -> Option<&TextBlock> {
        self.slide(slide_id).and_then(|s| s.block(block_id))
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == user_id)
    }

    pub fn user_by_nickname(&self, nickname: &str) -> Option<&User> {
        self.users.iter().find(|u| u.nickname == nickname)
    }

    pub fn creator(&self) -> Option<&User> {
        self.user(&self.creator_id)
    }

    /// Copy of this presentation with `f` applied to the slide `slide_id`.
    ///
    /// Returns `None` when the slide does not exist or `f` declines the change.
    pub fn map_slide(
        &self,
        slide_id: &str,
        f: impl FnOnce(&Slide) -> Option<Slide>,
    ) -> Option<Presentation> {
        let index = self.slide_index(slide_id)?;
        let updated = f(&self.slides[index])?;
        let mut next = self.clone();
        next.slides[index] = updated;
        Some(next)
    }

    /// Check the aggregate invariants.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.slides.is_empty() {
            return Err(ModelError::NoSlides(self.id.clone()));
        }

        let mut seen_slides = std::collections::HashSet::new();
        for slide in &self.slides {
            if !seen_slides.insert(slide.id.as_str()) {
                return Err(ModelError::DuplicateSlide(slide.id.clone()));
            }
        }

        let mut seen_users = std::collections::HashSet::new();
        for user in &self.users {
            if !seen_users.insert(user.id.as_str()) {
                return Err(ModelError::DuplicateUser(user.id.clone()));
            }
            if user.role == Role::Creator && user.id != self.creator_id {
                return Err(ModelError::ForeignCreator {
                    user_id: user.id.clone(),
                    creator_id: self.creator_id.clone(),
                });
            }
        }

        match self.creator() {
            None => Err(ModelError::CreatorNotMember(self.creator_id.clone())),
            Some(creator) if creator.role != Role::Creator => {
                Err(ModelError::CreatorDemoted(creator.id.clone()))
            }
            Some(_) => Ok(()),
        }
    }
}

/// One slide: a title plus text blocks in display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub blocks: Vec<TextBlock>,
}

impl Slide {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            blocks: Vec::new(),
        }
    }

    pub fn block(&self, block_id: &str) -> Option<&TextBlock> {
        self.blocks.iter().find(|b| b.id == block_id)
    }

    pub fn has_block(&self, block_id: &str) -> bool {
        self.block(block_id).is_some()
    }
}

/// A positioned rich-text box on a slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub id: String,
    /// Markdown source.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_height")]
    pub height: f64,
    #[serde(default)]
    pub styles: BlockStyles,
}

fn default_width() -> f64 {
    DEFAULT_BLOCK_WIDTH
}

fn default_height() -> f64 {
    DEFAULT_BLOCK_HEIGHT
}

impl TextBlock {
    /// A block at (`x`, `y`) with the default size and styles.
    pub fn new(content: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: new_id(),
            content: content.into(),
            x,
            y,
            width: DEFAULT_BLOCK_WIDTH,
            height: DEFAULT_BLOCK_HEIGHT,
            styles: BlockStyles::default(),
        }
    }

    pub fn moved_to(&self, x: f64, y: f64) -> Self {
        Self { x, y, ..self.clone() }
    }

    pub fn resized_to(&self, width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    pub fn with_styles(&self, styles: BlockStyles) -> Self {
        Self {
            styles,
            ..self.clone()
        }
    }
}

impl Default for TextBlock {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_CONTENT, DEFAULT_BLOCK_X, DEFAULT_BLOCK_Y)
    }
}

/// Horizontal text alignment inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

/// Character and paragraph styling of a block.
///
/// Colours left as `None` inherit the foreground and keep a transparent
/// background.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockStyles {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    pub text_align: TextAlign,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
}

/// A member of a presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub nickname: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_id: Option<String>,
}

impl User {
    pub fn new(nickname: impl Into<String>, role: Role) -> Self {
        Self {
            id: new_id(),
            nickname: nickname.into(),
            role,
            presentation_id: None,
        }
    }

    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Presentation {
        let mut p = Presentation::new("Quarterly", User::new("alice", Role::Editor));
        p.users.push(User::new("bob", Role::Editor));
        p
    }

    #[test]
    fn test_new_presentation_is_valid() {
        let p = sample();
        assert_eq!(p.slides.len(), 1);
        assert_eq!(p.slides[0].title, DEFAULT_SLIDE_TITLE);
        assert_eq!(p.creator().unwrap().nickname, "alice");
        assert_eq!(p.creator().unwrap().role, Role::Creator);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_deck() {
        let mut p = sample();
        p.slides.clear();
        assert_eq!(p.validate(), Err(ModelError::NoSlides(p.id.clone())));
    }

    #[test]
    fn test_validate_rejects_missing_creator() {
        let mut p = sample();
        p.users.retain(|u| u.role != Role::Creator);
        assert!(matches!(p.validate(), Err(ModelError::CreatorNotMember(_))));
    }

    #[test]
    fn test_validate_rejects_second_creator() {
        let mut p = sample();
        p.users[1].role = Role::Creator;
        assert!(matches!(p.validate(), Err(ModelError::ForeignCreator { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_users() {
        let mut p = sample();
        let dup = p.users[1].clone();
        p.users.push(dup);
        assert!(matches!(p.validate(), Err(ModelError::DuplicateUser(_))));
    }

    #[test]
    fn test_map_slide_leaves_source_untouched() {
        let p = sample();
        let slide_id = p.slides[0].id.clone();
        let block = TextBlock::default();

        let next = p
            .map_slide(&slide_id, |s| {
                let mut s = s.clone();
                s.blocks.push(block.clone());
                Some(s)
            })
            .unwrap();

        assert!(p.slides[0].blocks.is_empty());
        assert_eq!(next.slides[0].blocks, vec![block]);
        assert!(p.map_slide("missing", |s| Some(s.clone())).is_none());
    }

    #[test]
    fn test_block_defaults_from_sparse_wire_value() {
        let block: TextBlock = serde_json::from_value(json!({
            "id": "b1",
            "content": "hello",
            "x": 10,
            "y": 20
        }))
        .unwrap();

        assert_eq!(block.width, DEFAULT_BLOCK_WIDTH);
        assert_eq!(block.height, DEFAULT_BLOCK_HEIGHT);
        assert_eq!(block.styles, BlockStyles::default());
        assert_eq!(block.styles.text_align, TextAlign::Left);
        assert!(block.styles.color.is_none());
    }

    #[test]
    fn test_styles_use_camel_case_on_the_wire() {
        let styles = BlockStyles {
            bold: true,
            background_color: Some("#ffee00".into()),
            text_align: TextAlign::Center,
            font_size: Some(24.0),
            ..BlockStyles::default()
        };
        let value = serde_json::to_value(&styles).unwrap();
        assert_eq!(value["backgroundColor"], "#ffee00");
        assert_eq!(value["textAlign"], "center");
        assert_eq!(value["fontSize"], 24.0);
        assert!(value.get("color").is_none());
    }

    #[test]
    fn test_presentation_wire_names() {
        let p = sample();
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["creatorId"], p.creator_id.as_str());
        assert_eq!(value["users"][0]["role"], "CREATOR");
    }
}
