//! Request/response access to the chat server.

use async_trait::async_trait;
use reqwest::{header, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelSummary, CreateChannelRequest, ListMessagesQuery, MembershipPayload,
        MessagePayload, PostMessageRequest, ReactionPayload, ReactionsByEmoji, SessionRequest,
        SessionResponse, ToggleReactionRequest, UpdateMessageRequest, UpdateProfileRequest,
        UserProfile,
    },
};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, ClientResult};

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn current_user(&self) -> ClientResult<UserProfile>;
    async fn update_profile(&self, req: UpdateProfileRequest) -> ClientResult<UserProfile>;
    async fn list_channels(&self) -> ClientResult<Vec<ChannelSummary>>;
    async fn create_channel(&self, req: CreateChannelRequest) -> ClientResult<ChannelSummary>;
    async fn join_channel(&self, channel_id: ChannelId) -> ClientResult<MembershipPayload>;
    async fn list_messages(
        &self,
        channel_id: ChannelId,
        query: &ListMessagesQuery,
    ) -> ClientResult<Vec<MessagePayload>>;
    async fn post_message(
        &self,
        channel_id: ChannelId,
        req: PostMessageRequest,
    ) -> ClientResult<MessagePayload>;
    async fn update_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload>;
    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> ClientResult<()>;
    async fn list_replies(
        &self,
        channel_id: ChannelId,
        parent_id: MessageId,
    ) -> ClientResult<Vec<MessagePayload>>;
    async fn toggle_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> ClientResult<ReactionsByEmoji>;
    async fn list_reactions(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> ClientResult<Vec<ReactionPayload>>;
}

/// [`ChatBackend`] over the server's JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpBackend {
    pub fn new(server_url: &str, token: impl Into<String>) -> ClientResult<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base: Url::parse(server_url)?,
            token: token.into(),
        })
    }

    /// Signs in (creating the account on first use) and returns a backend
    /// bound to the new session.
    pub async fn sign_in(
        server_url: &str,
        email: &str,
        name: &str,
    ) -> ClientResult<(Self, SessionResponse)> {
        let http = reqwest::Client::new();
        let base = Url::parse(server_url)?;
        let response = http
            .post(base.join("/auth/session")?)
            .json(&SessionRequest {
                email: email.to_string(),
                name: name.to_string(),
            })
            .send()
            .await?;
        let session: SessionResponse = decode(response).await?;
        debug!(user_id = session.user.id.0, "signed in");
        let backend = Self {
            http,
            base,
            token: session.token.clone(),
        };
        Ok((backend, session))
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        Ok(self.base.join(path)?)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> ClientResult<reqwest::RequestBuilder> {
        Ok(self
            .http
            .request(method, self.url(path)?)
            .bearer_auth(&self.token))
    }
}

/// Maps a non-success status onto the server's typed error body, falling
/// back to the status alone when the body is not one.
async fn check(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let body = response.bytes().await?;
    let mut err = serde_json::from_slice::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(code_for_status(status), status.to_string()));
    if err.retry_after_secs.is_none() {
        err.retry_after_secs = retry_after;
    }
    Err(ClientError::Api(err))
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    Ok(check(response).await?.json::<T>().await?)
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthenticated,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        status if status.is_client_error() => ErrorCode::InvalidInput,
        _ => ErrorCode::UpstreamFailure,
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn current_user(&self) -> ClientResult<UserProfile> {
        let response = self.request(reqwest::Method::GET, "/me")?.send().await?;
        decode(response).await
    }

    async fn update_profile(&self, req: UpdateProfileRequest) -> ClientResult<UserProfile> {
        let response = self
            .request(reqwest::Method::PATCH, "/me")?
            .json(&req)
            .send()
            .await?;
        decode(response).await
    }

    async fn list_channels(&self) -> ClientResult<Vec<ChannelSummary>> {
        let response = self.request(reqwest::Method::GET, "/channels")?.send().await?;
        decode(response).await
    }

    async fn create_channel(&self, req: CreateChannelRequest) -> ClientResult<ChannelSummary> {
        let response = self
            .request(reqwest::Method::POST, "/channels")?
            .json(&req)
            .send()
            .await?;
        decode(response).await
    }

    async fn join_channel(&self, channel_id: ChannelId) -> ClientResult<MembershipPayload> {
        let response = self
            .request(reqwest::Method::POST, &format!("/channels/{channel_id}/join"))?
            .send()
            .await?;
        decode(response).await
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        query: &ListMessagesQuery,
    ) -> ClientResult<Vec<MessagePayload>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/channels/{channel_id}/messages"),
            )?
            .query(query)
            .send()
            .await?;
        decode(response).await
    }

    async fn post_message(
        &self,
        channel_id: ChannelId,
        req: PostMessageRequest,
    ) -> ClientResult<MessagePayload> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/channels/{channel_id}/messages"),
            )?
            .json(&req)
            .send()
            .await?;
        decode(response).await
    }

    async fn update_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/channels/{channel_id}/messages/{message_id}"),
            )?
            .json(&UpdateMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> ClientResult<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/channels/{channel_id}/messages/{message_id}"),
            )?
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list_replies(
        &self,
        channel_id: ChannelId,
        parent_id: MessageId,
    ) -> ClientResult<Vec<MessagePayload>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/channels/{channel_id}/messages/{parent_id}/replies"),
            )?
            .send()
            .await?;
        decode(response).await
    }

    async fn toggle_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> ClientResult<ReactionsByEmoji> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/channels/{channel_id}/messages/{message_id}/reactions"),
            )?
            .json(&ToggleReactionRequest {
                emoji: emoji.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn list_reactions(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> ClientResult<Vec<ReactionPayload>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/channels/{channel_id}/messages/{message_id}/reactions"),
            )?
            .send()
            .await?;
        decode(response).await
    }
}
