mod mock;
mod openai_compat;
mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::{error::CompletionError, types::ModelConfig};

#[cfg(test)]
pub(crate) use mock::StalledClientFactory;
pub use mock::{MockChatClient, MockClientFactory};
pub use openai_compat::{OpenAiCompatClient, OpenAiCompatFactory};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f64,
    pub messages: Vec<ChatMessage>,
}

/// One streamed event; `content` is `None` for role-only or empty deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDelta {
    pub content: Option<String>,
}

pub type DeltaStream = BoxStream<'static, Result<ChatDelta, CompletionError>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, CompletionError>;

    /// Starts a streamed completion. Dropping the returned stream aborts it.
    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, CompletionError>;
}

/// Builds the network client for a profile from its config.
pub trait ClientFactory: Send + Sync {
    fn build(&self, config: &ModelConfig) -> Arc<dyn ChatClient>;
}
