use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use natter_core::model::{Conversation, Message, MessageType, PresenceEntry, User};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DataServiceError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuildFailed(String),

    #[error("request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("{endpoint} returned HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("failed to decode response from {endpoint}: {reason}")]
    DecodeFailed { endpoint: String, reason: String },
}

/// Server-side chat data behind the REST API. Trackers call through this
/// seam so tests can substitute an in-memory implementation.
///
/// Returned futures are `Send`; session tasks await them on a
/// multi-threaded runtime.
pub trait DataService: Send + Sync + 'static {
    fn fetch_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<Conversation>, DataServiceError>> + Send;

    /// Users selectable as direct-conversation partners. The server
    /// excludes the requesting user from the list.
    fn fetch_users(&self) -> impl Future<Output = Result<Vec<User>, DataServiceError>> + Send;

    fn fetch_presence(
        &self,
    ) -> impl Future<Output = Result<Vec<PresenceEntry>, DataServiceError>> + Send;

    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, DataServiceError>> + Send;

    fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> impl Future<Output = Result<Message, DataServiceError>> + Send;

    /// Create a direct conversation with `target_user_id`, or return the
    /// existing one when the pair already shares a thread.
    fn create_direct_conversation(
        &self,
        target_user_id: &str,
    ) -> impl Future<Output = Result<Conversation, DataServiceError>> + Send;

    fn mark_read(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<(), DataServiceError>> + Send;

    fn mark_all_read(&self) -> impl Future<Output = Result<(), DataServiceError>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMessageBody<'a> {
    content: &'a str,
    message_type: MessageType,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDirectBody<'a> {
    user_id: &'a str,
}

/// `DataService` over HTTP with optional bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpDataService {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

impl HttpDataService {
    pub fn new(api_url: &str, auth_token: Option<String>) -> Result<Self, DataServiceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| DataServiceError::ClientBuildFailed(error.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.api_url));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
    ) -> Result<Response, DataServiceError> {
        let response = builder
            .send()
            .await
            .map_err(|error| DataServiceError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: error.to_string(),
            })?;

        let status = response.status();
        debug!(endpoint, status = status.as_u16(), "data service response");

        if !status.is_success() {
            return Err(DataServiceError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(
        response: Response,
        endpoint: &str,
    ) -> Result<T, DataServiceError> {
        response
            .json()
            .await
            .map_err(|error| DataServiceError::DecodeFailed {
                endpoint: endpoint.to_string(),
                reason: error.to_string(),
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DataServiceError> {
        let response = self.send(self.request(Method::GET, path), path).await?;
        Self::decode(response, path).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, DataServiceError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.request(Method::POST, path).json(body), path)
            .await?;
        Self::decode(response, path).await
    }

    async fn post_empty(&self, path: &str) -> Result<(), DataServiceError> {
        self.send(self.request(Method::POST, path), path).await?;
        Ok(())
    }
}

impl DataService for HttpDataService {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, DataServiceError> {
        self.get_json("/conversations").await
    }

    async fn fetch_users(&self) -> Result<Vec<User>, DataServiceError> {
        self.get_json("/users").await
    }

    async fn fetch_presence(&self) -> Result<Vec<PresenceEntry>, DataServiceError> {
        self.get_json("/presence").await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, DataServiceError> {
        self.get_json(&format!("/conversations/{conversation_id}/messages"))
            .await
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message, DataServiceError> {
        let body = CreateMessageBody {
            content,
            message_type,
        };
        self.post_json(&format!("/conversations/{conversation_id}/messages"), &body)
            .await
    }

    async fn create_direct_conversation(
        &self,
        target_user_id: &str,
    ) -> Result<Conversation, DataServiceError> {
        let body = CreateDirectBody {
            user_id: target_user_id,
        };
        self.post_json("/conversations/direct", &body).await
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<(), DataServiceError> {
        self.post_empty(&format!("/conversations/{conversation_id}/read"))
            .await
    }

    async fn mark_all_read(&self) -> Result<(), DataServiceError> {
        self.post_empty("/conversations/read-all").await
    }
}
