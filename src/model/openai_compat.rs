use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use reqwest::{Client, StatusCode, header::ACCEPT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::CompletionError,
    types::{DEFAULT_BASE_URL, ModelConfig},
};

use super::{
    ChatClient, ChatDelta, ChatMessage, ChatRequest, ClientFactory, DeltaStream,
    sse::{SseDecoder, SseEvent},
};

/// Client for any endpoint speaking the OpenAI chat-completions protocol.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        let base_url = base_url.trim().trim_end_matches('/');
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };

        Self {
            client,
            base_url: base_url.to_owned(),
            api_key: api_key.trim().to_owned(),
        }
    }

    #[cfg(test)]
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, CompletionError> {
        let payload = ChatCompletionRequest {
            model: &request.model,
            temperature: request.temperature,
            messages: &request.messages,
            stream,
        };

        let mut builder = self.client.post(self.endpoint()).json(&payload);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        if stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api { status, body });
        }

        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChunkDelta {
    content: Option<String>,
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, CompletionError> {
        let response = self.send(&request, false).await?;
        let body = response.bytes().await?;
        let response = serde_json::from_slice::<ChatCompletionResponse>(&body)?;

        response
            .choices
            .first()
            .and_then(|choice| extract_message_content(&choice.message.content))
            .ok_or(CompletionError::EmptyResponse)
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, CompletionError> {
        let response = self.send(&request, true).await?;
        let status = response.status();
        debug!(%status, endpoint = %self.endpoint(), "streaming response opened");
        Ok(delta_stream(response.bytes_stream(), status))
    }
}

fn extract_message_content(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        return Some(text.to_owned());
    }

    let array = content.as_array()?;
    let joined = array
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

struct StreamState<B> {
    body: BoxStream<'static, Result<B, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<ChatDelta, CompletionError>>,
    status: StatusCode,
    finished: bool,
}

impl<B> StreamState<B> {
    fn absorb(&mut self, events: impl IntoIterator<Item = SseEvent>) {
        for event in events {
            if self.finished {
                break;
            }
            match event {
                SseEvent::Done => self.finished = true,
                SseEvent::Data(data) => match serde_json::from_str::<StreamChunk>(&data) {
                    Ok(StreamChunk {
                        error: Some(error), ..
                    }) => {
                        self.pending.push_back(Err(CompletionError::Api {
                            status: self.status,
                            body: error.to_string(),
                        }));
                        self.finished = true;
                    }
                    Ok(chunk) => {
                        let content = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.delta.content);
                        self.pending.push_back(Ok(ChatDelta { content }));
                    }
                    Err(error) => {
                        self.pending.push_back(Err(error.into()));
                        self.finished = true;
                    }
                },
            }
        }
    }
}

/// Decodes an SSE response body into chat deltas.
fn delta_stream<S, B>(body: S, status: StatusCode) -> DeltaStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = StreamState {
        body: body.boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        status,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.absorb(events);
                }
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(error.into()), state));
                }
                None => {
                    let tail = state.decoder.finish();
                    state.absorb(tail);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

/// Builds [`OpenAiCompatClient`]s sharing one connection pool.
#[derive(Debug, Clone, Default)]
pub struct OpenAiCompatFactory {
    http: Client,
}

impl OpenAiCompatFactory {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl ClientFactory for OpenAiCompatFactory {
    fn build(&self, config: &ModelConfig) -> Arc<dyn ChatClient> {
        Arc::new(OpenAiCompatClient::new(
            self.http.clone(),
            &config.base_url,
            &config.api_key,
        ))
    }
}
