//! HTTP catalog of presentations: list existing decks, create new ones.
//!
//! `GET {base}/presentation` and `POST {base}/presentation/create`.

use deck_core::{Presentation, Role, User};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CatalogConfig;

/// Catalog errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("catalog returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid catalog input: {0}")]
    InvalidInput(String),
}

/// One entry of the presentation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub slides: Vec<serde_json::Value>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl PresentationSummary {
    pub fn slide_count(&self) -> usize {
        self.slides.len()
    }

    /// Nickname of the creator, when listed among the users.
    pub fn creator_nickname(&self) -> Option<&str> {
        let creator_id = self.creator_id.as_deref()?;
        self.users
            .iter()
            .find(|u| u.id == creator_id)
            .map(|u| u.nickname.as_str())
    }
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    title: &'a str,
    user: &'a User,
}

/// Client for the catalog REST API.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CatalogError::InvalidInput("base_url must not be empty".into()));
        }
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Every presentation known to the authority.
    pub async fn list_presentations(&self) -> Result<Vec<PresentationSummary>, CatalogError> {
        let url = format!("{}/presentation", self.base_url);
        log::debug!("GET {url}");
        let response = check(self.http.get(&url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Create a presentation owned by a new user called `nickname`.
    pub async fn create_presentation(
        &self,
        title: &str,
        nickname: &str,
    ) -> Result<Presentation, CatalogError> {
        if title.trim().is_empty() {
            return Err(CatalogError::InvalidInput("title must not be empty".into()));
        }
        if nickname.trim().is_empty() {
            return Err(CatalogError::InvalidInput("nickname must not be empty".into()));
        }

        let user = User::new(nickname, Role::Creator);
        let url = format!("{}/presentation/create", self.base_url);
        log::debug!("POST {url}");
        let response = self
            .http
            .post(&url)
            .json(&CreateRequest { title, user: &user })
            .send()
            .await?;
        let presentation: Presentation = check(response).await?.json().await?;
        log::info!("Created presentation {} ({})", presentation.title, presentation.id);
        Ok(presentation)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_string());
    Err(CatalogError::Api {
        status: status.as_u16(),
        message,
    })
}
