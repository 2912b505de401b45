//! Conversation handling
//!
//! Sessions, per-session settings, message history and the orchestration
//! of chat, vision, image generation, transcription and speech.

pub mod events;
pub mod handler;
pub mod history;
pub mod session;
pub mod settings;
pub mod url_extractor;

use crate::core::provider::ProviderError;
use crate::routing::RouterError;
use thiserror::Error;
use uuid::Uuid;

/// Error types for conversation operations
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Action not found: {0}")]
    ActionNotFound(Uuid),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Router(#[from] RouterError),

    #[error("Failed to store audio: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Short error type name reported to users
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::SessionNotFound(_) => "SessionNotFound",
            ChatError::ActionNotFound(_) => "ActionNotFound",
            ChatError::InvalidSetting(_) => "InvalidSetting",
            ChatError::InvalidAttachment(_) => "InvalidAttachment",
            ChatError::Provider(e) => e.kind(),
            ChatError::Router(_) => "RouterError",
            ChatError::Io(_) => "IoError",
        }
    }
}
