//! API endpoint handlers
//!
//! Sessions, settings, message handling over server-sent events, route
//! diagnostics, generated audio and health checks.

use crate::chat::ChatError;
use crate::chat::events::{ChatEvent, EventSink};
use crate::chat::handler::{ChatHandler, IncomingMessage};
use crate::chat::session::SessionStore;
use crate::chat::settings::{ChatSettingsUpdate, settings_schema};
use crate::core::config::Config;
use crate::core::constants::prompt;
use crate::core::gateway::LlmGateway;
use crate::routing::RouteLayer;
use axum::{
    Json, Router,
    extract::rejection::{JsonRejection, PathRejection},
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post, put},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Buffered events per response stream
const SSE_CHANNEL_CAPACITY: usize = 64;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<LlmGateway>,
    pub sessions: Arc<SessionStore>,
    pub handler: Arc<ChatHandler>,
    pub router: Option<Arc<RouteLayer>>,
}

/// Create the API router with all endpoints
///
/// Attachments arrive base64-encoded in JSON bodies, so the body limit
/// comes from `server.max_upload_mb` instead of axum's 2 MB default.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/v1/settings", get(get_settings_schema))
        .route("/v1/models", get(list_models))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session).delete(delete_session))
        .route("/v1/sessions/{id}/settings", put(update_settings))
        .route("/v1/sessions/{id}/messages", post(post_message))
        .route("/v1/sessions/{id}/actions/{action_id}", post(run_action))
        .route("/v1/route", post(route_query))
        .route("/v1/audio/{file}", get(get_audio))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Errors returned as `{"type": "error", "error": {"type", "message"}}`
#[derive(Debug)]
pub enum ApiError {
    Chat(ChatError),
    BadRequest(String),
    PayloadTooLarge(String),
    NotFound(String),
    Unavailable(String),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError::Chat(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(rejection.body_text())
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Chat(e) => {
                let (status, error_type) = match &e {
                    ChatError::SessionNotFound(_) | ChatError::ActionNotFound(_) => {
                        (StatusCode::NOT_FOUND, "not_found_error")
                    }
                    ChatError::InvalidSetting(_) | ChatError::InvalidAttachment(_) => {
                        (StatusCode::BAD_REQUEST, "invalid_request_error")
                    }
                    ChatError::Provider(_) => (StatusCode::BAD_GATEWAY, "api_error"),
                    ChatError::Router(_) | ChatError::Io(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, error_type, e.to_string())
            }
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "invalid_request_error", m),
            ApiError::PayloadTooLarge(m) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request_too_large", m)
            }
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found_error", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable_error", m),
        };

        if status.is_server_error() {
            error!("Request failed: {}", message);
        } else {
            debug!("Request rejected ({}): {}", status, message);
        }

        let body = json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Stream chat events to the client as they are produced
fn sse_response(rx: mpsc::Receiver<ChatEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| {
        let name = event.event_name();
        let sse_event = match Event::default().event(name).json_data(&event) {
            Ok(sse_event) => sse_event,
            Err(e) => {
                error!("Failed to serialize chat event: {}", e);
                Event::default().event("error").data(e.to_string())
            }
        };
        Ok::<_, Infallible>(sse_event)
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    response
}

/// GET / - Root endpoint
async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "message": "VT.ai multimodal chat router v0.1.0",
        "status": "running",
        "providers": state.gateway.provider_names(),
        "dynamic_routing": state.router.is_some(),
        "config": {
            "default_chat_model": state.config.models.default_chat_model,
            "default_vision_model": state.config.models.default_vision_model,
            "router_encoder": state.config.router.encoder.as_str(),
        },
        "endpoints": {
            "health": "/health",
            "settings": "/v1/settings",
            "models": "/v1/models",
            "sessions": "/v1/sessions",
            "messages": "/v1/sessions/{id}/messages",
            "actions": "/v1/sessions/{id}/actions/{action_id}",
            "route": "/v1/route",
            "audio": "/v1/audio/{file}",
        },
    }))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "providers": state.gateway.provider_names(),
        "sessions": state.sessions.len().await,
    }))
}

/// GET /v1/settings - Settings widgets
async fn get_settings_schema(State(state): State<AppState>) -> impl IntoResponse {
    Json(settings_schema(&state.config))
}

/// GET /v1/models - Selectable models and voices
async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models = &state.config.models;
    Json(json!({
        "chat_models": models.chat_models,
        "vision_models": models.vision_models,
        "tts_models": models.tts_models,
        "tts_voices": models.tts_voices,
        "defaults": {
            "chat_model": models.default_chat_model,
            "vision_model": models.default_vision_model,
            "image_gen_model": models.default_image_gen_model,
            "tts_model": models.default_tts_model,
            "tts_voice": models.default_tts_voice,
            "whisper_model": models.default_whisper_model,
        },
    }))
}

/// POST /v1/sessions - Start a chat session
async fn create_session(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.sessions.create().await;
    (
        StatusCode::CREATED,
        Json(json!({
            "session_id": session.id,
            "settings": session.settings,
            "greeting": prompt::GREETING,
        })),
    )
}

/// GET /v1/sessions/{id} - Session settings and history
async fn get_session(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = path?;
    let session = state.sessions.get(id).await?;
    Ok(Json(session).into_response())
}

/// PUT /v1/sessions/{id}/settings - Partial settings update
async fn update_settings(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ChatSettingsUpdate>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = path?;
    let Json(update) = payload?;
    let settings = state
        .sessions
        .update_settings(id, update, &state.config.models)
        .await?;
    info!("⚙️ Session {} settings updated", id);
    Ok(Json(settings).into_response())
}

/// DELETE /v1/sessions/{id} - End a session
async fn delete_session(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = path?;
    state.sessions.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/sessions/{id}/messages - Send a message, stream the response
async fn post_message(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<IncomingMessage>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = path?;
    let Json(message) = payload?;
    if message.content.trim().is_empty() && message.attachments.is_empty() {
        return Err(ApiError::BadRequest(
            "Message needs content or attachments".to_string(),
        ));
    }
    state.sessions.get(id).await?;

    info!(
        "📥 Incoming message: session={}, chars={}, attachments={}",
        id,
        message.content.chars().count(),
        message.attachments.len()
    );

    let (sink, rx) = EventSink::channel(SSE_CHANNEL_CAPACITY);
    let handler = state.handler.clone();
    tokio::spawn(async move {
        handler.on_message(id, message, &sink).await;
    });
    Ok(sse_response(rx))
}

/// POST /v1/sessions/{id}/actions/{action_id} - Trigger a message action
async fn run_action(
    State(state): State<AppState>,
    path: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path((id, action_id)) = path?;
    let action = state.sessions.take_action(id, action_id).await?;
    info!("🔊 Running action {} for session {}", action.name, id);

    let (sink, rx) = EventSink::channel(SSE_CHANNEL_CAPACITY);
    let handler = state.handler.clone();
    tokio::spawn(async move {
        handler.on_speak(id, action, &sink).await;
    });
    Ok(sse_response(rx))
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    query: String,
}

/// POST /v1/route - Classify a query without running it
async fn route_query(
    State(state): State<AppState>,
    payload: Result<Json<RouteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let router = state
        .router
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("Dynamic routing is disabled".to_string()))?;
    let choice = router
        .classify(&request.query)
        .await
        .map_err(ChatError::from)?;
    Ok(Json(json!({
        "query": request.query,
        "name": choice.name,
        "score": choice.score,
        "encoder": router.encoder_name(),
    }))
    .into_response())
}

/// Plain file names only: no separators, no parent references, no dotfiles
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn audio_content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "mp3" || ext == "mpeg" => "audio/mpeg",
        Some(ext) if ext == "wav" => "audio/wav",
        Some(ext) if ext == "ogg" => "audio/ogg",
        Some(ext) if ext == "webm" => "audio/webm",
        Some(ext) if ext == "m4a" || ext == "mp4" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// GET /v1/audio/{file} - Serve stored speech and uploaded audio
async fn get_audio(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(file) = path?;
    if !is_safe_file_name(&file) {
        warn!("Rejected audio path: {}", file);
        return Err(ApiError::BadRequest(format!("Invalid audio file name: {}", file)));
    }

    match tokio::fs::read(state.handler.audio_dir().join(&file)).await {
        Ok(bytes) => Ok((
            [(header::CONTENT_TYPE, audio_content_type(&file))],
            bytes,
        )
            .into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::NotFound(format!("Audio file not found: {}", file)))
        }
        Err(e) => Err(ApiError::Chat(ChatError::Io(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::settings::ChatSettings;
    use crate::core::gateway::testing::{MockProvider, mock_gateway};
    use crate::routing::layer::tests::hashing_layer;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state() -> (AppState, TempDir) {
        state_with_config("[openai]\napi_key = \"sk-test\"").await
    }

    async fn state_with_config(toml: &str) -> (AppState, TempDir) {
        let config = Arc::new(Config::from_toml_str(toml, |_| None).unwrap());
        let gateway = Arc::new(mock_gateway(
            Arc::new(MockProvider::new("OpenAI")),
            Arc::new(MockProvider::new("Gemini")),
        ));
        let sessions = Arc::new(SessionStore::new(ChatSettings::from_config(&config)));
        let router = Some(Arc::new(hashing_layer().await));
        let audio = tempfile::tempdir().unwrap();
        let handler = Arc::new(ChatHandler::new(
            gateway.clone(),
            sessions.clone(),
            router.clone(),
            &config,
            audio.path().to_path_buf(),
        ));
        let state = AppState {
            config,
            gateway,
            sessions,
            handler,
            router,
        };
        (state, audio)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (state, _audio) = test_state().await;
        let response = create_session(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["greeting"], prompt::GREETING);
        assert_eq!(created["settings"]["chat_model"], "gpt-4o-mini");

        let id: Uuid = serde_json::from_value(created["session_id"].clone()).unwrap();
        let response = get_session(State(state), Ok(Path(id))).await.unwrap();
        let session = body_json(response).await;
        assert_eq!(session["history"].as_array().unwrap().len(), 2);
        assert_eq!(session["history"][0]["role"], "system");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (state, _audio) = test_state().await;
        let err = get_session(State(state), Ok(Path(Uuid::new_v4())))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn test_invalid_settings_are_400() {
        let (state, _audio) = test_state().await;
        let id = state.sessions.create().await.id;
        let update = ChatSettingsUpdate {
            chat_model: Some("not-a-model".to_string()),
            ..Default::default()
        };
        let response = update_settings(State(state), Ok(Path(id)), Ok(Json(update)))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_message_streams_events() {
        let (state, _audio) = test_state().await;
        let id = state.sessions.create().await.id;
        let message = IncomingMessage {
            content: "hello how are you".to_string(),
            attachments: Vec::new(),
        };

        let response = post_message(State(state.clone()), Ok(Path(id)), Ok(Json(message)))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let body = body_text(response).await;
        assert!(body.contains("event: message_start"));
        assert!(body.contains("event: token"));
        assert!(body.contains("\"text\":\"Hello\""));
        assert!(body.contains("event: action"));
        assert!(body.trim_end().ends_with("data: {\"type\":\"done\"}"));

        assert_eq!(state.sessions.history(id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let (state, _audio) = test_state().await;
        let id = state.sessions.create().await.id;
        let message = IncomingMessage {
            content: "   ".to_string(),
            attachments: Vec::new(),
        };
        let err = post_message(State(state), Ok(Path(id)), Ok(Json(message)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_action_is_404() {
        let (state, _audio) = test_state().await;
        let id = state.sessions.create().await.id;
        let err = run_action(State(state), Ok(Path((id, Uuid::new_v4()))))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_speak_action_serves_audio() {
        let (state, _audio) = test_state().await;
        let id = state.sessions.create().await.id;
        let action_id = state
            .sessions
            .register_action(id, "speak_chat_response_action", "Read me")
            .await
            .unwrap();

        let response = run_action(State(state.clone()), Ok(Path((id, action_id))))
            .await
            .unwrap();
        let body = body_text(response).await;
        let start = body.find("/v1/audio/").unwrap();
        let file: String = body[start + "/v1/audio/".len()..]
            .chars()
            .take_while(|c| *c != '"')
            .collect();

        let response = get_audio(State(state), Ok(Path(file))).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(body_text(response).await, "tts-1:nova:Read me");
    }

    #[tokio::test]
    async fn test_audio_rejects_traversal() {
        let (state, _audio) = test_state().await;
        for name in ["../secret.mp3", ".env", "a/b.mp3", ""] {
            let err = get_audio(State(state.clone()), Ok(Path(name.to_string())))
                .await
                .unwrap_err();
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
        let err = get_audio(State(state), Ok(Path("tts-missing.mp3".to_string())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_route_query() {
        let (state, _audio) = test_state().await;
        let request = RouteRequest {
            query: "please generate an image of a dragon".to_string(),
        };
        let response = route_query(State(state), Ok(Json(request))).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["name"], "image-generation");
        assert_eq!(body["encoder"], "hashing-512");
    }

    #[tokio::test]
    async fn test_route_query_without_router() {
        let (mut state, _audio) = test_state().await;
        state.router = None;
        let request = RouteRequest {
            query: "hi".to_string(),
        };
        let err = route_query(State(state), Ok(Json(request))).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_models_and_schema() {
        let (state, _audio) = test_state().await;
        let models = body_json(list_models(State(state.clone())).await.into_response()).await;
        assert_eq!(models["defaults"]["tts_voice"], "nova");
        assert_eq!(models["tts_voices"].as_array().unwrap().len(), 6);

        let schema = body_json(get_settings_schema(State(state)).await.into_response()).await;
        assert_eq!(schema.as_array().unwrap().len(), 7);
    }

    fn photo_message(size: usize) -> Body {
        let message = json!({
            "content": "what is in this photo",
            "attachments": [{
                "name": "photo.jpg",
                "mime": "image/jpeg",
                "data": STANDARD.encode(vec![0xAB_u8; size]),
            }],
        });
        Body::from(serde_json::to_vec(&message).unwrap())
    }

    fn post_json(uri: String, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_router_accepts_large_photo() {
        let (state, _audio) = test_state().await;
        let id = state.sessions.create().await.id;
        let app = create_router(state.clone());

        let request = post_json(
            format!("/v1/sessions/{}/messages", id),
            photo_message(5 * 1024 * 1024 / 2),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("event: element"));
        assert!(body.trim_end().ends_with("data: {\"type\":\"done\"}"));
    }

    #[tokio::test]
    async fn test_router_enforces_configured_body_limit() {
        let (state, _audio) =
            state_with_config("[openai]\napi_key = \"sk-test\"\n[server]\nmax_upload_mb = 1\n").await;
        let id = state.sessions.create().await.id;
        let app = create_router(state);

        let request = post_json(
            format!("/v1/sessions/{}/messages", id),
            photo_message(5 * 1024 * 1024 / 2),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "request_too_large");
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let (state, _audio) = test_state().await;
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("tts-0b7c.mp3"));
        assert!(!is_safe_file_name("..mp3"));
        assert!(!is_safe_file_name("a\\b.mp3"));
        assert_eq!(audio_content_type("x.WAV"), "audio/wav");
        assert_eq!(audio_content_type("x"), "application/octet-stream");
    }
}
