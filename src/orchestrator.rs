use std::{collections::HashMap, fmt, sync::Arc};

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::CompletionError,
    filter::{DeltaTracker, strip_reasoning},
    model::{
        ChatClient, ChatMessage, ChatRequest, ClientFactory, ContentPart, ImageUrl,
        MessageContent, Role,
    },
    settings::{SettingsStore, load_profile, save_profile},
    types::{CompletionMode, ModelConfig, Profile},
};

/// Appended to the partial output of a cancelled streaming completion.
pub const CANCELLED_MARKER: &str = "\n\n[Generation cancelled]";

/// Receives `(delta, filtered_text_so_far)` for each streamed update.
pub type DeltaCallback = Box<dyn FnMut(&str, &str) + Send>;

pub struct CompletionRequest {
    pub text: Option<String>,
    /// Base64 payloads or complete `data:` URIs, in display order.
    pub images: Vec<String>,
    pub mode: CompletionMode,
    pub stream: bool,
    pub on_delta: Option<DeltaCallback>,
    pub cancel: Option<CancellationToken>,
}

impl CompletionRequest {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            text: None,
            images: Vec::new(),
            mode,
            stream: false,
            on_delta: None,
            cancel: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Streams the response, reporting each update to `on_delta`.
    pub fn streaming(mut self, on_delta: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.stream = true;
        self.on_delta = Some(Box::new(on_delta));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("text", &self.text)
            .field("images", &self.images.len())
            .field("mode", &self.mode)
            .field("stream", &self.stream)
            .field("on_delta", &self.on_delta.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Holds both profiles' settings and network clients.
pub struct CompletionOrchestrator {
    settings: Arc<dyn SettingsStore>,
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<Profile, Arc<dyn ChatClient>>>,
}

impl CompletionOrchestrator {
    pub async fn new(
        settings: Arc<dyn SettingsStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> anyhow::Result<Self> {
        let mut clients = HashMap::new();
        for profile in Profile::ALL {
            // A broken profile stays without a client until it loads or is replaced.
            match load_profile(settings.as_ref(), profile).await {
                Ok(config) => {
                    clients.insert(profile, factory.build(&config));
                }
                Err(error) => {
                    warn!(%profile, error = %format!("{error:#}"), "stored profile is unreadable");
                }
            }
        }

        Ok(Self {
            settings,
            factory,
            clients: RwLock::new(clients),
        })
    }

    pub async fn profile(&self, profile: Profile) -> anyhow::Result<ModelConfig> {
        let _clients = self.clients.read().await;
        load_profile(self.settings.as_ref(), profile).await
    }

    /// Replaces a profile's config and rebuilds its client. The write lock is
    /// held across both, so completions see either the old pair or the new one.
    pub async fn update_profile(&self, profile: Profile, config: ModelConfig) -> anyhow::Result<()> {
        let mut clients = self.clients.write().await;
        save_profile(self.settings.as_ref(), profile, &config).await?;
        clients.insert(profile, self.factory.build(&config));
        drop(clients);
        info!(%profile, model = %config.model, base_url = %config.base_url, "profile updated");
        Ok(())
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let CompletionRequest {
            text,
            images,
            mode,
            stream,
            on_delta,
            cancel,
        } = request;

        let profile = mode.profile();
        let (config, client) = self.resolve(profile).await?;

        let chat = ChatRequest {
            model: config.model.clone(),
            temperature: config.temperature,
            messages: build_messages(&config, text.as_deref(), &images),
        };
        info!(
            %profile,
            model = %config.model,
            stream,
            images = images.len(),
            "dispatching completion"
        );

        let result = if stream {
            stream_completion(client.as_ref(), chat, on_delta, cancel).await
        } else {
            complete_once(client.as_ref(), chat, cancel).await
        };

        match &result {
            Err(CompletionError::Aborted) => warn!(%profile, "completion aborted"),
            Err(error) => error!(%profile, %error, "chat completion failed"),
            Ok(_) => {}
        }
        result
    }

    /// Loads a profile's config together with its client.
    async fn resolve(
        &self,
        profile: Profile,
    ) -> Result<(ModelConfig, Arc<dyn ChatClient>), CompletionError> {
        {
            let clients = self.clients.read().await;
            let config = load_profile(self.settings.as_ref(), profile)
                .await
                .map_err(CompletionError::Settings)?;
            if let Some(client) = clients.get(&profile) {
                return Ok((config, client.clone()));
            }
        }

        let mut clients = self.clients.write().await;
        let config = load_profile(self.settings.as_ref(), profile)
            .await
            .map_err(CompletionError::Settings)?;
        let client = clients
            .entry(profile)
            .or_insert_with(|| self.factory.build(&config))
            .clone();
        Ok((config, client))
    }
}

async fn complete_once(
    client: &dyn ChatClient,
    chat: ChatRequest,
    cancel: Option<CancellationToken>,
) -> Result<String, CompletionError> {
    let raw = match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CompletionError::Aborted),
            result = client.complete(chat) => result?,
        },
        None => client.complete(chat).await?,
    };
    Ok(strip_reasoning(&raw))
}

async fn stream_completion(
    client: &dyn ChatClient,
    chat: ChatRequest,
    mut on_delta: Option<DeltaCallback>,
    cancel: Option<CancellationToken>,
) -> Result<String, CompletionError> {
    let cancel = cancel.unwrap_or_else(CancellationToken::new);
    let mut tracker = DeltaTracker::default();

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(cancelled_output(&tracker)),
        result = client.stream(chat) => result?,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = stream.next() => Some(item),
        };

        let Some(item) = next else {
            // Dropping the stream closes the connection.
            drop(stream);
            info!(bytes = tracker.text().len(), "generation cancelled");
            return Ok(cancelled_output(&tracker));
        };
        let Some(item) = item else {
            break;
        };

        let Some(fragment) = item?.content else {
            continue;
        };
        if let Some(delta) = tracker.push(&fragment)
            && let Some(callback) = on_delta.as_mut()
        {
            callback(&delta, tracker.text());
        }
    }

    Ok(tracker.into_text())
}

fn cancelled_output(tracker: &DeltaTracker) -> String {
    format!("{}{CANCELLED_MARKER}", tracker.text())
}

/// System prompt first, then one user message holding every image followed
/// by the text. Without text or images only the system message is sent.
pub fn build_messages(config: &ModelConfig, text: Option<&str>, images: &[String]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage {
        role: Role::System,
        content: MessageContent::Text(config.system_prompt.clone()),
    }];

    let mut parts = images
        .iter()
        .map(|image| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image_data_uri(image),
            },
        })
        .collect::<Vec<_>>();
    if let Some(text) = text.filter(|text| !text.trim().is_empty()) {
        parts.push(ContentPart::Text {
            text: text.to_owned(),
        });
    }

    if !parts.is_empty() {
        messages.push(ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(parts),
        });
    }
    messages
}

fn image_data_uri(image: &str) -> String {
    let image = image.trim();
    if image.starts_with("data:") {
        image.to_owned()
    } else {
        format!("data:image/jpeg;base64,{image}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use futures::StreamExt;
    use reqwest::StatusCode;
    use tokio_util::sync::CancellationToken;

    use crate::{
        error::CompletionError,
        filter::strip_reasoning,
        model::{
            ChatClient, ChatDelta, ChatRequest, ClientFactory, ContentPart, DeltaStream,
            MessageContent, Role, StalledClientFactory,
        },
        settings::{InMemorySettingsStore, SettingsStore},
        types::{CompletionMode, ModelConfig, Profile},
    };

    use super::{CANCELLED_MARKER, CompletionOrchestrator, CompletionRequest, build_messages};

    /// Every request seen by a scripted client, tagged with the client's endpoint.
    type CallLog = Arc<Mutex<Vec<(String, ChatRequest)>>>;

    struct ScriptedClient {
        endpoint: String,
        chunks: Vec<String>,
        fail: Option<StatusCode>,
        calls: CallLog,
        pulled: Arc<AtomicUsize>,
    }

    impl ScriptedClient {
        fn record(&self, request: &ChatRequest) -> Result<(), CompletionError> {
            self.calls
                .lock()
                .expect("lock should not be poisoned")
                .push((self.endpoint.clone(), request.clone()));
            match self.fail {
                Some(status) => Err(CompletionError::Api {
                    status,
                    body: "upstream failure".into(),
                }),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(&self, request: ChatRequest) -> Result<String, CompletionError> {
            self.record(&request)?;
            Ok(self.chunks.concat())
        }

        async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, CompletionError> {
            self.record(&request)?;
            let pulled = self.pulled.clone();
            let mut deltas = vec![Ok(ChatDelta { content: None })];
            deltas.extend(self.chunks.iter().map(|chunk| {
                Ok(ChatDelta {
                    content: Some(chunk.clone()),
                })
            }));
            Ok(futures::stream::iter(deltas)
                .inspect(move |delta| {
                    if matches!(delta, Ok(ChatDelta { content: Some(_) })) {
                        pulled.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .boxed())
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedFactory {
        chunks: Vec<String>,
        fail: Option<StatusCode>,
        calls: CallLog,
        pulled: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        fn with_chunks(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|chunk| (*chunk).to_owned()).collect(),
                ..Self::default()
            }
        }

        fn endpoints(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("lock should not be poisoned")
                .iter()
                .map(|(endpoint, _)| endpoint.clone())
                .collect()
        }

        fn last_request(&self) -> ChatRequest {
            self.calls
                .lock()
                .expect("lock should not be poisoned")
                .last()
                .map(|(_, request)| request.clone())
                .expect("a request should have been made")
        }
    }

    impl ClientFactory for ScriptedFactory {
        fn build(&self, config: &ModelConfig) -> Arc<dyn ChatClient> {
            Arc::new(ScriptedClient {
                endpoint: format!("{}#{}", config.base_url, config.api_key),
                chunks: self.chunks.clone(),
                fail: self.fail,
                calls: self.calls.clone(),
                pulled: self.pulled.clone(),
            })
        }
    }

    fn config(base_url: &str, api_key: &str, model: &str) -> ModelConfig {
        ModelConfig {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
            system_prompt: format!("prompt for {model}"),
        }
    }

    async fn orchestrator(factory: &ScriptedFactory) -> CompletionOrchestrator {
        let orchestrator = CompletionOrchestrator::new(
            Arc::new(InMemorySettingsStore::default()),
            Arc::new(factory.clone()),
        )
        .await
        .expect("orchestrator should build");
        orchestrator
            .update_profile(Profile::Text, config("http://text", "tk", "text-model"))
            .await
            .expect("text profile should save");
        orchestrator
            .update_profile(Profile::Vision, config("http://vision", "vk", "vision-model"))
            .await
            .expect("vision profile should save");
        orchestrator
    }

    #[test]
    fn images_precede_text_in_one_user_message() {
        let config = ModelConfig::default_for(Profile::Vision);
        let images = vec!["AAA".to_owned(), "data:image/png;base64,BBB".to_owned()];
        let messages = build_messages(&config, Some("transcribe"), &images);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(
            messages[0].content,
            MessageContent::Text(config.system_prompt.clone())
        );

        let MessageContent::Parts(parts) = &messages[1].content else {
            panic!("user content should be a part list");
        };
        let kinds = parts
            .iter()
            .map(|part| match part {
                ContentPart::ImageUrl { image_url } => image_url.url.clone(),
                ContentPart::Text { text } => format!("text:{text}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "data:image/jpeg;base64,AAA".to_owned(),
                "data:image/png;base64,BBB".to_owned(),
                "text:transcribe".to_owned(),
            ]
        );
    }

    #[test]
    fn two_images_and_empty_text_yield_only_image_parts() {
        let config = ModelConfig::default_for(Profile::Vision);
        let images = vec!["first".to_owned(), "second".to_owned()];
        let messages = build_messages(&config, Some("   "), &images);

        let MessageContent::Parts(parts) = &messages[1].content else {
            panic!("user content should be a part list");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], ContentPart::ImageUrl { image_url } if image_url.url.ends_with("first")));
        assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url.ends_with("second")));
    }

    #[test]
    fn no_text_and_no_images_sends_only_system_prompt() {
        let config = ModelConfig::default_for(Profile::Text);
        let messages = build_messages(&config, None, &[]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
    }

    #[tokio::test]
    async fn ocr_mode_uses_vision_profile_whether_streaming_or_not() {
        let factory = ScriptedFactory::with_chunks(&["text ", "found"]);
        let orchestrator = orchestrator(&factory).await;

        let text = orchestrator
            .complete(CompletionRequest::new(CompletionMode::Ocr).with_images(vec!["img".into()]))
            .await
            .expect("completion should succeed");
        assert_eq!(text, "text found");
        assert_eq!(factory.last_request().model, "vision-model");

        let streamed = orchestrator
            .complete(
                CompletionRequest::new(CompletionMode::Ocr)
                    .with_text("notes")
                    .streaming(|_, _| {}),
            )
            .await
            .expect("streaming completion should succeed");
        assert_eq!(streamed, "text found");
        assert_eq!(factory.last_request().model, "vision-model");
        assert_eq!(
            factory.endpoints(),
            vec!["http://vision#vk".to_owned(), "http://vision#vk".to_owned()]
        );
    }

    #[tokio::test]
    async fn answer_mode_uses_text_profile_even_with_images() {
        let factory = ScriptedFactory::with_chunks(&["ok"]);
        let orchestrator = orchestrator(&factory).await;

        orchestrator
            .complete(
                CompletionRequest::new(CompletionMode::Answer)
                    .with_text("what is shown?")
                    .with_images(vec!["img".into()]),
            )
            .await
            .expect("completion should succeed");

        let request = factory.last_request();
        assert_eq!(request.model, "text-model");
        assert_eq!(request.temperature, 0.2);
        assert_eq!(
            request.messages[0].content,
            MessageContent::Text("prompt for text-model".into())
        );
        assert_eq!(factory.endpoints(), vec!["http://text#tk".to_owned()]);
    }

    #[tokio::test]
    async fn non_streaming_result_is_filtered() {
        let factory = ScriptedFactory::with_chunks(&["<think>hmm\n</think>", "  Paris. "]);
        let orchestrator = orchestrator(&factory).await;

        let text = orchestrator
            .complete(CompletionRequest::new(CompletionMode::Answer).with_text("capital?"))
            .await
            .expect("completion should succeed");
        assert_eq!(text, "Paris.");
    }

    #[tokio::test]
    async fn streamed_updates_converge_to_filtered_output() {
        let chunks = ["<think>", "let me", " think</th", "ink>The", " answer", " is 42."];
        let factory = ScriptedFactory::with_chunks(&chunks);
        let orchestrator = orchestrator(&factory).await;

        let updates = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
        let sink = updates.clone();
        let text = orchestrator
            .complete(
                CompletionRequest::new(CompletionMode::Answer)
                    .with_text("question")
                    .streaming(move |delta, full| {
                        sink.lock()
                            .expect("lock should not be poisoned")
                            .push((delta.to_owned(), full.to_owned()));
                    }),
            )
            .await
            .expect("streaming completion should succeed");

        let expected = strip_reasoning(&chunks.concat());
        assert_eq!(expected, "The answer is 42.");
        assert_eq!(text, expected);

        let updates = updates.lock().expect("lock should not be poisoned");
        assert_eq!(
            updates.last().map(|(_, full)| full.as_str()),
            Some(expected.as_str())
        );
        assert!(updates.iter().any(|(delta, _)| delta == " is 42."));
    }

    #[tokio::test]
    async fn cancellation_after_two_chunks_returns_partial_output() {
        let factory = ScriptedFactory::with_chunks(&["One ", "two ", "three ", "four ", "five"]);
        let orchestrator = orchestrator(&factory).await;

        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut seen = 0;
        let text = orchestrator
            .complete(
                CompletionRequest::new(CompletionMode::Answer)
                    .with_text("count")
                    .with_cancellation(token)
                    .streaming(move |_, _| {
                        seen += 1;
                        if seen == 2 {
                            trigger.cancel();
                        }
                    }),
            )
            .await
            .expect("cancelled stream should still return text");

        assert_eq!(text, format!("{}{CANCELLED_MARKER}", strip_reasoning("One two ")));
        assert_eq!(factory.pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_non_streaming_request_is_aborted() {
        let factory = ScriptedFactory::with_chunks(&["never"]);
        let orchestrator = orchestrator(&factory).await;

        let token = CancellationToken::new();
        token.cancel();
        let result = orchestrator
            .complete(
                CompletionRequest::new(CompletionMode::Answer)
                    .with_text("hi")
                    .with_cancellation(token),
            )
            .await;
        assert!(matches!(result, Err(CompletionError::Aborted)));
    }

    #[tokio::test]
    async fn api_errors_propagate_unchanged() {
        let factory = ScriptedFactory {
            fail: Some(StatusCode::TOO_MANY_REQUESTS),
            ..ScriptedFactory::default()
        };
        let orchestrator = orchestrator(&factory).await;

        let result = orchestrator
            .complete(CompletionRequest::new(CompletionMode::Answer).with_text("hi"))
            .await;
        match result {
            Err(CompletionError::Api { status, body }) => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(body, "upstream failure");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_round_trips_and_rebuilds_client() {
        let factory = ScriptedFactory::with_chunks(&["ok"]);
        let orchestrator = orchestrator(&factory).await;

        let updated = config("http://new-text", "new-key", "text-model-2");
        orchestrator
            .update_profile(Profile::Text, updated.clone())
            .await
            .expect("update should succeed");
        assert_eq!(
            orchestrator
                .profile(Profile::Text)
                .await
                .expect("profile should load"),
            updated
        );

        orchestrator
            .complete(CompletionRequest::new(CompletionMode::Answer).with_text("hi"))
            .await
            .expect("completion should succeed");
        assert_eq!(factory.endpoints(), vec!["http://new-text#new-key".to_owned()]);
        assert_eq!(factory.last_request().model, "text-model-2");
    }

    #[tokio::test]
    async fn malformed_stored_profile_surfaces_settings_error() {
        let store = Arc::new(InMemorySettingsStore::default());
        let factory = ScriptedFactory::with_chunks(&["ok"]);
        let orchestrator = CompletionOrchestrator::new(store.clone(), Arc::new(factory.clone()))
            .await
            .expect("orchestrator should build");

        store
            .set("visionConfig", "[]")
            .await
            .expect("set should succeed");
        let result = orchestrator
            .complete(CompletionRequest::new(CompletionMode::Ocr).with_images(vec!["img".into()]))
            .await;
        assert!(matches!(result, Err(CompletionError::Settings(_))));
        assert!(factory.endpoints().is_empty());
    }

    async fn stalled_orchestrator(factory: &StalledClientFactory) -> Arc<CompletionOrchestrator> {
        let orchestrator = CompletionOrchestrator::new(
            Arc::new(InMemorySettingsStore::default()),
            Arc::new(factory.clone()),
        )
        .await
        .expect("orchestrator should build");
        Arc::new(orchestrator)
    }

    #[tokio::test]
    async fn cancelling_while_stream_opens_returns_marker_alone() {
        let factory = StalledClientFactory::default();
        let orchestrator = stalled_orchestrator(&factory).await;
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let token = token.clone();
            async move {
                orchestrator
                    .complete(
                        CompletionRequest::new(CompletionMode::Answer)
                            .with_text("hi")
                            .with_cancellation(token)
                            .streaming(|_, _| {}),
                    )
                    .await
            }
        });

        factory.started.notified().await;
        token.cancel();
        let text = task
            .await
            .expect("completion task should join")
            .expect("cancelled stream should still return text");
        assert_eq!(text, CANCELLED_MARKER);
        factory.dropped.notified().await;
    }

    #[tokio::test]
    async fn cancelling_in_flight_non_streaming_request_is_aborted() {
        let factory = StalledClientFactory::default();
        let orchestrator = stalled_orchestrator(&factory).await;
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let token = token.clone();
            async move {
                orchestrator
                    .complete(
                        CompletionRequest::new(CompletionMode::Ocr)
                            .with_images(vec!["img".into()])
                            .with_cancellation(token),
                    )
                    .await
            }
        });

        factory.started.notified().await;
        token.cancel();
        let result = task.await.expect("completion task should join");
        assert!(matches!(result, Err(CompletionError::Aborted)));
        factory.dropped.notified().await;
    }

    #[tokio::test]
    async fn unreadable_profile_does_not_block_construction() {
        let store = Arc::new(InMemorySettingsStore::default());
        store
            .set("visionConfig", "{not json")
            .await
            .expect("set should succeed");
        let factory = ScriptedFactory::with_chunks(&["fine"]);

        let orchestrator = CompletionOrchestrator::new(store.clone(), Arc::new(factory.clone()))
            .await
            .expect("orchestrator should build despite a broken profile");

        let text = orchestrator
            .complete(CompletionRequest::new(CompletionMode::Answer).with_text("hi"))
            .await
            .expect("text profile should still work");
        assert_eq!(text, "fine");

        assert!(orchestrator.profile(Profile::Vision).await.is_err());
        let result = orchestrator
            .complete(CompletionRequest::new(CompletionMode::Ocr).with_images(vec!["img".into()]))
            .await;
        assert!(matches!(result, Err(CompletionError::Settings(_))));

        orchestrator
            .update_profile(Profile::Vision, config("http://repaired", "rk", "vision-model"))
            .await
            .expect("update should repair the profile");
        orchestrator
            .complete(CompletionRequest::new(CompletionMode::Ocr).with_images(vec!["img".into()]))
            .await
            .expect("repaired profile should complete");
        let endpoints = factory.endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1], "http://repaired#rk");
        assert_eq!(factory.last_request().model, "vision-model");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completions_never_mix_old_and_new_profile() {
        let factory = ScriptedFactory::with_chunks(&["ok"]);
        let orchestrator = Arc::new(orchestrator(&factory).await);

        let updater = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                for round in 0..50 {
                    let endpoint = format!("http://text-{round}");
                    let model = format!("model-{round}");
                    orchestrator
                        .update_profile(Profile::Text, config(&endpoint, "k", &model))
                        .await
                        .expect("update should succeed");
                }
            }
        });
        let mut callers = Vec::new();
        for _ in 0..4 {
            let orchestrator = orchestrator.clone();
            callers.push(tokio::spawn(async move {
                for _ in 0..25 {
                    orchestrator
                        .complete(CompletionRequest::new(CompletionMode::Answer).with_text("hi"))
                        .await
                        .expect("completion should succeed");
                }
            }));
        }
        updater.await.expect("updater should join");
        for caller in callers {
            caller.await.expect("caller should join");
        }

        let calls = factory.calls.lock().expect("lock should not be poisoned");
        for (endpoint, request) in calls.iter() {
            let round = request.model.trim_start_matches("model-");
            if request.model == "text-model" {
                assert_eq!(endpoint, "http://text#tk");
            } else {
                assert_eq!(endpoint, &format!("http://text-{round}#k"));
            }
        }
    }
}
