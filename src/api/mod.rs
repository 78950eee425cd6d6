//! Chat API collaborator. The sync core only calls this surface: cursor
//! message fetches for polling/pagination and the profile lookup that yields
//! the pubsub credential.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::model::{ConversationId, Message};

/// Cursor query for a message fetch. `before`/`after` are `created_at`
/// boundaries; `limit` caps the page length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub before: Option<i64>,
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn before(ts: i64) -> Self {
        Self {
            before: Some(ts),
            ..Self::default()
        }
    }

    pub fn after(ts: i64) -> Self {
        Self {
            after: Some(ts),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub payload: Vec<Message>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub pubsub_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        query: MessageQuery,
    ) -> Result<MessagePage, ApiError>;

    async fn get_profile(&self) -> Result<Profile, ApiError>;
}

/// Reqwest-backed implementation against the chat backend's REST surface.
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: Url,
    api_token: String,
    account_id: i64,
}

impl HttpChatApi {
    pub fn new(
        base_url: impl AsRef<str>,
        api_token: impl Into<String>,
        account_id: i64,
    ) -> Result<Self, ApiError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ApiError::InvalidConfig("base url cannot be empty".into()));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid base url: {err}")))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_token: api_token.into(),
            account_id,
        })
    }

    fn messages_url(
        &self,
        conversation_id: ConversationId,
        query: &MessageQuery,
    ) -> Result<Url, ApiError> {
        let mut url = self
            .base_url
            .join(&format!(
                "api/v1/accounts/{}/conversations/{}/messages",
                self.account_id, conversation_id
            ))
            .map_err(|err| ApiError::InvalidConfig(format!("invalid messages endpoint: {err}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(before) = query.before {
                pairs.append_pair("before", &before.to_string());
            }
            if let Some(after) = query.after {
                pairs.append_pair("after", &after.to_string());
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn profile_url(&self) -> Result<Url, ApiError> {
        self.base_url
            .join("api/v1/profile")
            .map_err(|err| ApiError::InvalidConfig(format!("invalid profile endpoint: {err}")))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        query: MessageQuery,
    ) -> Result<MessagePage, ApiError> {
        let url = self.messages_url(conversation_id, &query)?;
        let response = self
            .client
            .get(url)
            .header("api_access_token", &self.api_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<MessagePage>().await?)
    }

    async fn get_profile(&self) -> Result<Profile, ApiError> {
        let url = self.profile_url()?;
        let response = self
            .client
            .get(url)
            .header("api_access_token", &self.api_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<Profile>().await?)
    }
}
