//! Conversation orchestration
//!
//! Turns a user message into model calls and a stream of [`ChatEvent`]s.
//! Text goes through semantic routing (when enabled) to chat, vision or
//! image generation; attachments go to vision, chat or transcription by MIME
//! type. Speak actions offered on responses are handled by `on_speak`.

use crate::chat::ChatError;
use crate::chat::events::{ChatEvent, Element, EventSink};
use crate::chat::history::trim_messages;
use crate::chat::session::{PendingAction, SessionStore};
use crate::chat::settings::ChatSettings;
use crate::chat::url_extractor::extract_urls;
use crate::core::config::Config;
use crate::core::constants::{action, role, route};
use crate::core::gateway::LlmGateway;
use crate::core::provider::ProviderError;
use crate::models::openai::ChatMessage;
use crate::routing::RouteLayer;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// URL path under which stored audio files are served
pub const AUDIO_URL_PREFIX: &str = "/v1/audio";

/// A file sent along with a message
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    /// Base64-encoded file content
    pub data: String,
}

impl Attachment {
    fn bytes(&self) -> Result<Vec<u8>, ChatError> {
        STANDARD
            .decode(self.data.trim())
            .map_err(|e| ChatError::InvalidAttachment(format!("{}: {}", self.name, e)))
    }
}

/// A user message with optional attachments
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Image to be described by a vision model
enum ImageSource {
    /// Uploaded by the user, sent inline as a data URL
    Upload { name: String, data_url: String },
    Remote(String),
}

impl ImageSource {
    fn url(&self) -> &str {
        match self {
            ImageSource::Upload { data_url, .. } => data_url,
            ImageSource::Remote(url) => url,
        }
    }

    fn element(&self, prompt: &str) -> Element {
        match self {
            ImageSource::Upload { name, .. } => Element::Image {
                url: None,
                path: Some(name.clone()),
                name: prompt.to_string(),
            },
            ImageSource::Remote(url) => Element::Image {
                url: Some(url.clone()),
                path: None,
                name: prompt.to_string(),
            },
        }
    }
}

pub struct ChatHandler {
    gateway: Arc<LlmGateway>,
    sessions: Arc<SessionStore>,
    router: Option<Arc<RouteLayer>>,
    default_vision_model: String,
    image_gen_model: String,
    whisper_model: String,
    temperature: f32,
    trim_ratio: f32,
    audio_dir: PathBuf,
}

impl ChatHandler {
    pub fn new(
        gateway: Arc<LlmGateway>,
        sessions: Arc<SessionStore>,
        router: Option<Arc<RouteLayer>>,
        config: &Config,
        audio_dir: PathBuf,
    ) -> Self {
        Self {
            gateway,
            sessions,
            router,
            default_vision_model: config.models.default_vision_model.clone(),
            image_gen_model: config.models.default_image_gen_model.clone(),
            whisper_model: config.models.default_whisper_model.clone(),
            temperature: config.temperature,
            trim_ratio: config.trim_ratio,
            audio_dir,
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    /// Handle a user message; the event stream always ends with `done`
    pub async fn on_message(&self, session_id: Uuid, message: IncomingMessage, sink: &EventSink) {
        let result = if message.attachments.is_empty() {
            self.handle_conversation(session_id, &message.content, sink)
                .await
        } else {
            self.handle_attachments(session_id, message, sink).await
        };

        if let Err(e) = result {
            self.report_error(&e, sink).await;
        }
        sink.send(ChatEvent::Done).await;
    }

    /// Run a speak action already taken from the session
    pub async fn on_speak(&self, session_id: Uuid, action: PendingAction, sink: &EventSink) {
        if let Err(e) = self.speak(session_id, &action.value, sink).await {
            self.report_error(&e, sink).await;
        }
        sink.send(ChatEvent::Done).await;
    }

    async fn report_error(&self, e: &ChatError, sink: &EventSink) {
        error!("Error type: {}, Error: {}", e.kind(), e);
        sink.send(ChatEvent::Error {
            message: format!(
                "Something went wrong, please try again. Error type: {}, Error: {}",
                e.kind(),
                e
            ),
        })
        .await;
    }

    async fn handle_attachments(
        &self,
        session_id: Uuid,
        message: IncomingMessage,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let prompt = message.content;
        self.sessions.append(session_id, role::USER, &prompt).await?;

        for attachment in &message.attachments {
            let mime = attachment.mime.to_lowercase();
            info!("📎 Attachment {} ({})", attachment.name, mime);

            let result = if mime.contains("image") {
                self.handle_image_attachment(session_id, attachment, &prompt, sink)
                    .await
            } else if mime.contains("text") {
                self.handle_text_attachment(session_id, attachment, sink)
                    .await
            } else if mime.contains("audio") {
                self.handle_audio_attachment(session_id, attachment, sink)
                    .await
            } else {
                warn!("Skipping attachment {} with unsupported type {}", attachment.name, mime);
                Ok(())
            };

            // One failing attachment does not stop the others
            if let Err(e) = result {
                self.report_error(&e, sink).await;
            }
        }
        Ok(())
    }

    async fn handle_image_attachment(
        &self,
        session_id: Uuid,
        attachment: &Attachment,
        prompt: &str,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let bytes = attachment.bytes()?;
        let source = ImageSource::Upload {
            name: attachment.name.clone(),
            data_url: format!("data:{};base64,{}", attachment.mime, STANDARD.encode(bytes)),
        };
        let model = self.default_vision_model.clone();
        self.vision(session_id, source, prompt, &model, sink).await
    }

    async fn handle_text_attachment(
        &self,
        session_id: Uuid,
        attachment: &Attachment,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let text = String::from_utf8(attachment.bytes()?).map_err(|_| {
            ChatError::InvalidAttachment(format!("{} is not valid UTF-8 text", attachment.name))
        })?;
        self.handle_conversation(session_id, &text, sink).await
    }

    async fn handle_audio_attachment(
        &self,
        session_id: Uuid,
        attachment: &Attachment,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let bytes = attachment.bytes()?;
        let extension = Path::new(&attachment.name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin")
            .to_lowercase();
        let url = self.store_audio("upload", &extension, &bytes).await?;

        let transcript = self
            .gateway
            .transcribe(&self.whisper_model, &attachment.name, bytes)
            .await?;

        let message_id = sink.start_message(&self.whisper_model, "").await;
        sink.element(
            message_id,
            Element::Audio {
                url,
                name: "Audio".to_string(),
            },
        )
        .await;
        sink.element(
            message_id,
            Element::Text {
                name: "Transcript".to_string(),
                content: transcript.clone(),
            },
        )
        .await;
        sink.end_message(message_id, "").await;

        self.sessions
            .append(session_id, role::ASSISTANT, &transcript)
            .await
    }

    async fn handle_conversation(
        &self,
        session_id: Uuid,
        query: &str,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let settings = self.sessions.settings(session_id).await?;
        let model = settings.chat_model.clone();
        let message_id = sink.start_message(&model, "").await;

        self.sessions.append(session_id, role::USER, query).await?;
        let mut messages = self.sessions.history(session_id).await?;

        if settings.use_dynamic_conversation_routing {
            if settings.trim_messages {
                messages = self.trim(&model, &messages);
            }

            if let Some(route_name) = self.classify(query, sink).await {
                match route_name.as_str() {
                    route::IMAGE_GENERATION => {
                        info!("💡 Processing image generation...");
                        sink.end_message(message_id, "").await;
                        return self.generate_image(session_id, query, sink).await;
                    }
                    route::VISION_IMAGE_PROCESSING => {
                        if let Some(url) = extract_urls(query).into_iter().next() {
                            info!("💡 Received image URL, processing with vision model...");
                            sink.end_message(message_id, "").await;
                            return self
                                .vision(
                                    session_id,
                                    ImageSource::Remote(url),
                                    query,
                                    &settings.vision_model,
                                    sink,
                                )
                                .await;
                        }
                        info!("💡 Received no image URL, processing with chat...");
                    }
                    _ => {}
                }
            }
        }

        self.chat(session_id, &model, messages, message_id, &settings, sink)
            .await
    }

    /// Route name for the query, if routing is available and a route matched
    async fn classify(&self, query: &str, sink: &EventSink) -> Option<String> {
        let router = self.router.as_ref()?;
        match router.classify(query).await {
            Ok(choice) => {
                info!(
                    "💡 Query classified as route: {:?} (score {:?})",
                    choice.name, choice.score
                );
                sink.send(ChatEvent::Route {
                    name: choice.name.clone(),
                })
                .await;
                choice.name
            }
            Err(e) => {
                warn!("Routing failed, falling back to chat: {}", e);
                None
            }
        }
    }

    fn trim(&self, model: &str, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let window = self.gateway.registry().context_window(model);
        let budget = (window as f32 * self.trim_ratio) as usize;
        let trimmed = trim_messages(messages, budget);
        if trimmed.len() < messages.len() {
            debug!(
                "Trimmed history from {} to {} messages for {}",
                messages.len(),
                trimmed.len(),
                model
            );
        }
        trimmed
    }

    async fn chat(
        &self,
        session_id: Uuid,
        model: &str,
        messages: Vec<ChatMessage>,
        message_id: Uuid,
        settings: &ChatSettings,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let mut stream = self
            .gateway
            .chat_stream(model, messages, Some(self.temperature))
            .await?;

        let mut content = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            if token.is_empty() {
                continue;
            }
            if sink.is_closed() {
                warn!("Client disconnected during streaming, stopping generation");
                break;
            }
            content.push_str(&token);
            sink.send(ChatEvent::Token {
                message_id,
                text: token,
            })
            .await;
        }

        self.sessions
            .append(session_id, role::ASSISTANT, &content)
            .await?;
        if settings.enable_tts_response {
            self.offer_speak(session_id, message_id, &content, sink)
                .await?;
        }
        sink.end_message(message_id, &content).await;
        Ok(())
    }

    async fn generate_image(
        &self,
        session_id: Uuid,
        query: &str,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let model = &self.image_gen_model;
        let notice = format!(
            "Sure! I'll use the `{}` model to create an image based on your description. This might take a moment, please be patient.",
            model
        );
        let notice_id = sink.start_message(model, &notice).await;
        sink.end_message(notice_id, &notice).await;

        let response = self.gateway.generate_image(model, query).await?;
        let image = response.data.into_iter().next().ok_or_else(|| {
            ProviderError::Unexpected("Image generation returned no images".to_string())
        })?;
        let url = image
            .url
            .or_else(|| image.b64_json.map(|b64| format!("data:image/png;base64,{}", b64)))
            .ok_or_else(|| ProviderError::Unexpected("Generated image has no URL".to_string()))?;
        let revised_prompt = image.revised_prompt.unwrap_or_else(|| query.to_string());

        let content = "Here's the image, along with a refined description based on your input:";
        let message_id = sink.start_message(model, content).await;
        sink.element(
            message_id,
            Element::Image {
                url: Some(url),
                path: None,
                name: query.to_string(),
            },
        )
        .await;
        sink.element(
            message_id,
            Element::Text {
                name: "Description".to_string(),
                content: revised_prompt.clone(),
            },
        )
        .await;
        self.offer_speak(session_id, message_id, &revised_prompt, sink)
            .await?;
        self.sessions
            .append(session_id, role::ASSISTANT, &revised_prompt)
            .await?;
        sink.end_message(message_id, content).await;
        Ok(())
    }

    async fn vision(
        &self,
        session_id: Uuid,
        source: ImageSource,
        prompt: &str,
        model: &str,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        if !self.gateway.supports_vision(model) {
            warn!("Unsupported vision model: {}", model);
            let content = format!(
                "It seems the vision model `{}` doesn't support image processing. Please choose a different model in Settings that offers Vision capabilities.",
                model
            );
            let message_id = sink.start_message(role::ASSISTANT, &content).await;
            sink.end_message(message_id, &content).await;
            return Ok(());
        }

        let notice = format!(
            "Analyzing the image using the `{}` model... This might take a moment. 🔎",
            model
        );
        let notice_id = sink.start_message(model, &notice).await;
        sink.end_message(notice_id, &notice).await;

        let description = self
            .gateway
            .vision(model, prompt, source.url(), None)
            .await?;

        let message_id = sink.start_message(model, "").await;
        sink.element(message_id, source.element(prompt)).await;
        sink.element(
            message_id,
            Element::Text {
                name: "Explain".to_string(),
                content: description.clone(),
            },
        )
        .await;
        self.offer_speak(session_id, message_id, &description, sink)
            .await?;
        self.sessions
            .append(session_id, role::ASSISTANT, &description)
            .await?;
        sink.end_message(message_id, "").await;
        Ok(())
    }

    async fn offer_speak(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        value: &str,
        sink: &EventSink,
    ) -> Result<(), ChatError> {
        let action_id = self
            .sessions
            .register_action(session_id, action::SPEAK, value)
            .await?;
        sink.send(ChatEvent::Action {
            message_id,
            action_id,
            name: action::SPEAK.to_string(),
            label: action::SPEAK_LABEL.to_string(),
            value: value.to_string(),
        })
        .await;
        Ok(())
    }

    async fn speak(&self, session_id: Uuid, text: &str, sink: &EventSink) -> Result<(), ChatError> {
        let settings = self.sessions.settings(session_id).await?;
        if !settings.enable_tts_response || text.is_empty() {
            return Ok(());
        }

        let model = &settings.tts_model;
        let voice = &settings.tts_voice_preset;
        let audio = self.gateway.speak(model, voice, text).await?;
        let url = self.store_audio("tts", "mp3", &audio).await?;

        let content = format!(
            "You're hearing an AI voice generated by OpenAI's {} model, using the {} style.  You can customize this in Settings if you'd like!",
            model, voice
        );
        let message_id = sink.start_message(model, &content).await;
        sink.element(
            message_id,
            Element::Text {
                name: "Context".to_string(),
                content: text.to_string(),
            },
        )
        .await;
        sink.element(
            message_id,
            Element::Audio {
                url,
                name: String::new(),
            },
        )
        .await;
        sink.end_message(message_id, &content).await;

        self.sessions
            .append(session_id, role::ASSISTANT, text)
            .await
    }

    /// Write audio into the audio directory and return the URL serving it
    async fn store_audio(&self, prefix: &str, extension: &str, bytes: &[u8]) -> Result<String, ChatError> {
        let file_name = format!("{}-{}.{}", prefix, Uuid::new_v4(), extension);
        tokio::fs::write(self.audio_dir.join(&file_name), bytes).await?;
        debug!("Stored {} bytes of audio as {}", bytes.len(), file_name);
        Ok(format!("{}/{}", AUDIO_URL_PREFIX, file_name))
    }
}
