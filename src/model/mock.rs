use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
#[cfg(test)]
use tokio::sync::Notify;

use crate::{error::CompletionError, types::ModelConfig};

use super::{
    ChatClient, ChatDelta, ChatRequest, ClientFactory, ContentPart, DeltaStream, MessageContent,
    Role,
};

/// Offline client that describes the request it received.
#[derive(Debug, Default)]
pub struct MockChatClient;

impl MockChatClient {
    fn reply(request: &ChatRequest) -> String {
        let (mut images, mut text) = (0usize, String::new());
        for message in request.messages.iter().filter(|m| m.role == Role::User) {
            match &message.content {
                MessageContent::Text(value) => text.push_str(value),
                MessageContent::Parts(parts) => {
                    for part in parts {
                        match part {
                            ContentPart::Text { text: value } => text.push_str(value),
                            ContentPart::ImageUrl { .. } => images += 1,
                        }
                    }
                }
            }
        }

        format!(
            "snapanswer mock reply from {} ({} image(s)).\n\nUser: {}",
            request.model, images, text
        )
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, CompletionError> {
        Ok(Self::reply(&request))
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, CompletionError> {
        let reply = Self::reply(&request);
        let words = reply
            .split_inclusive(' ')
            .map(|word| {
                Ok(ChatDelta {
                    content: Some(word.to_owned()),
                })
            })
            .collect::<Vec<_>>();
        Ok(futures::stream::iter(words).boxed())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MockClientFactory;

impl ClientFactory for MockClientFactory {
    fn build(&self, _config: &ModelConfig) -> Arc<dyn ChatClient> {
        Arc::new(MockChatClient)
    }
}

/// Builds clients whose calls never resolve. `started` is notified when a
/// call begins and `dropped` once that call's future is dropped.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct StalledClientFactory {
    pub(crate) started: Arc<Notify>,
    pub(crate) dropped: Arc<Notify>,
}

#[cfg(test)]
impl ClientFactory for StalledClientFactory {
    fn build(&self, _config: &ModelConfig) -> Arc<dyn ChatClient> {
        Arc::new(StalledChatClient {
            started: self.started.clone(),
            dropped: self.dropped.clone(),
        })
    }
}

#[cfg(test)]
struct StalledChatClient {
    started: Arc<Notify>,
    dropped: Arc<Notify>,
}

#[cfg(test)]
struct DropSignal(Arc<Notify>);

#[cfg(test)]
impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

#[cfg(test)]
impl StalledChatClient {
    async fn stall<T>(&self) -> T {
        let _signal = DropSignal(self.dropped.clone());
        self.started.notify_one();
        std::future::pending::<T>().await
    }
}

#[cfg(test)]
#[async_trait]
impl ChatClient for StalledChatClient {
    async fn complete(&self, _request: ChatRequest) -> Result<String, CompletionError> {
        self.stall().await
    }

    async fn stream(&self, _request: ChatRequest) -> Result<DeltaStream, CompletionError> {
        self.stall().await
    }
}
