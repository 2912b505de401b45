//! Constants for roles, routes, settings, events and model defaults
//!
//! This module defines string constants used throughout the application.

/// Message role constants
pub mod role {
    /// User role identifier
    pub const USER: &str = "user";

    /// Assistant role identifier
    pub const ASSISTANT: &str = "assistant";

    /// System role identifier
    pub const SYSTEM: &str = "system";
}

/// Semantic route names
pub mod route {
    pub const IMAGE_GENERATION: &str = "image-generation";
    pub const VISION_IMAGE_PROCESSING: &str = "vision-image-processing";
}

/// Chat settings identifiers, as exposed in the settings schema
pub mod settings {
    pub const CHAT_MODEL: &str = "settings_chat_model";
    pub const VISION_MODEL: &str = "settings_vision_model";
    pub const ENABLE_TTS_RESPONSE: &str = "settings_enable_tts_response";
    pub const TTS_MODEL: &str = "settings_tts_model";
    pub const TTS_VOICE_PRESET: &str = "settings_tts_voice_preset_model";
    pub const USE_DYNAMIC_CONVERSATION_ROUTING: &str =
        "settings_use_dynamic_conversation_routing";
    pub const TRIM_MESSAGES: &str = "settings_trimmed_messages";
}

/// Server-sent event type constants
pub mod event {
    pub const MESSAGE_START: &str = "message_start";
    pub const TOKEN: &str = "token";
    pub const ELEMENT: &str = "element";
    pub const ACTION: &str = "action";
    pub const MESSAGE_END: &str = "message_end";
    pub const ROUTE: &str = "route";
    pub const ERROR: &str = "error";
    pub const DONE: &str = "done";
}

/// Action names attached to assistant messages
pub mod action {
    pub const SPEAK: &str = "speak_chat_response_action";
    pub const SPEAK_LABEL: &str = "Speak response";
}

/// Conversation texts
pub mod prompt {
    pub const SYSTEM: &str =
        "You are a helpful assistant who tries their best to answer questions: ";

    pub const GREETING: &str = "Hello! I'm here to assist you. Please don't hesitate to ask me anything you'd like to know.";
}

/// Built-in model defaults
pub mod models {
    pub const GPT_4O: &str = "gpt-4o";
    pub const GPT_4O_MINI: &str = "gpt-4o-mini";
    pub const GEMINI_1_5_PRO: &str = "gemini/gemini-1.5-pro";
    pub const GEMINI_1_5_FLASH: &str = "gemini/gemini-1.5-flash";
    pub const DALL_E_3: &str = "dall-e-3";
    pub const TTS_1: &str = "tts-1";
    pub const TTS_1_HD: &str = "tts-1-hd";
    pub const WHISPER_1: &str = "whisper-1";
    pub const TEXT_EMBEDDING_3_SMALL: &str = "text-embedding-3-small";

    pub const DEFAULT_CHAT_MODEL: &str = GPT_4O_MINI;
    pub const DEFAULT_VISION_MODEL: &str = GPT_4O;
    pub const DEFAULT_IMAGE_GEN_MODEL: &str = DALL_E_3;
    pub const DEFAULT_TTS_MODEL: &str = TTS_1;
    pub const DEFAULT_TTS_VOICE: &str = "nova";
    pub const DEFAULT_WHISPER_MODEL: &str = WHISPER_1;

    pub const TTS_VOICES: [&str; 6] = ["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

    /// Context window used when a model is unknown
    pub const DEFAULT_CONTEXT_WINDOW: usize = 8192;
}
