//! Per-session chat settings and the settings schema shown to clients

use crate::chat::ChatError;
use crate::core::config::{Config, ModelConfig};
use crate::core::constants::settings as ids;
use serde::{Deserialize, Serialize};

/// Settings that steer how a session's messages are handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub chat_model: String,
    pub vision_model: String,
    pub enable_tts_response: bool,
    pub tts_model: String,
    pub tts_voice_preset: String,
    pub use_dynamic_conversation_routing: bool,
    pub trim_messages: bool,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        let models = &config.models;
        Self {
            chat_model: models.default_chat_model.clone(),
            vision_model: models.default_vision_model.clone(),
            enable_tts_response: config.settings.enable_tts_response,
            tts_model: models.default_tts_model.clone(),
            tts_voice_preset: models.default_tts_voice.clone(),
            use_dynamic_conversation_routing: config.settings.use_dynamic_conversation_routing,
            trim_messages: config.settings.trim_messages,
        }
    }

    /// Apply a partial update
    ///
    /// Every selected model or voice must be one of the offered values.
    /// Nothing changes when any field is rejected.
    pub fn apply(&mut self, update: ChatSettingsUpdate, models: &ModelConfig) -> Result<(), ChatError> {
        check_choice(update.chat_model.as_deref(), &models.chat_models, "chat model")?;
        check_choice(update.vision_model.as_deref(), &models.vision_models, "vision model")?;
        check_choice(update.tts_model.as_deref(), &models.tts_models, "TTS model")?;
        check_choice(update.tts_voice_preset.as_deref(), &models.tts_voices, "TTS voice")?;

        if let Some(v) = update.chat_model {
            self.chat_model = v;
        }
        if let Some(v) = update.vision_model {
            self.vision_model = v;
        }
        if let Some(v) = update.enable_tts_response {
            self.enable_tts_response = v;
        }
        if let Some(v) = update.tts_model {
            self.tts_model = v;
        }
        if let Some(v) = update.tts_voice_preset {
            self.tts_voice_preset = v;
        }
        if let Some(v) = update.use_dynamic_conversation_routing {
            self.use_dynamic_conversation_routing = v;
        }
        if let Some(v) = update.trim_messages {
            self.trim_messages = v;
        }
        Ok(())
    }
}

fn check_choice(value: Option<&str>, allowed: &[String], what: &str) -> Result<(), ChatError> {
    match value {
        Some(v) if !allowed.iter().any(|a| a == v) => Err(ChatError::InvalidSetting(format!(
            "{} '{}' is not one of: {}",
            what,
            v,
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// Partial settings update; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatSettingsUpdate {
    pub chat_model: Option<String>,
    pub vision_model: Option<String>,
    pub enable_tts_response: Option<bool>,
    pub tts_model: Option<String>,
    pub tts_voice_preset: Option<String>,
    pub use_dynamic_conversation_routing: Option<bool>,
    pub trim_messages: Option<bool>,
}

/// Input widget describing one setting
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SettingWidget {
    Select {
        id: &'static str,
        label: &'static str,
        description: String,
        values: Vec<String>,
        initial_value: String,
    },
    Switch {
        id: &'static str,
        label: &'static str,
        description: String,
        initial: bool,
    },
}

/// Widgets for every chat setting, initialised from configuration defaults
pub fn settings_schema(config: &Config) -> Vec<SettingWidget> {
    let models = &config.models;
    let defaults = &config.settings;
    vec![
        SettingWidget::Select {
            id: ids::CHAT_MODEL,
            label: "Chat Model",
            description: "Select the Large Language Model (LLM) you want to use for chat conversations. Different models have varying strengths and capabilities.".to_string(),
            values: models.chat_models.clone(),
            initial_value: models.default_chat_model.clone(),
        },
        SettingWidget::Select {
            id: ids::VISION_MODEL,
            label: "Vision Model",
            description: "Choose the vision model to analyze and understand images. This enables features like image description and object recognition.".to_string(),
            values: models.vision_models.clone(),
            initial_value: models.default_vision_model.clone(),
        },
        SettingWidget::Switch {
            id: ids::ENABLE_TTS_RESPONSE,
            label: "Enable TTS",
            description: format!(
                "This feature allows you to hear the chat responses spoken aloud, which can be helpful for accessibility or multitasking. Note that this action requires an OpenAI API key. Default value is {}.",
                python_bool(defaults.enable_tts_response)
            ),
            initial: defaults.enable_tts_response,
        },
        SettingWidget::Select {
            id: ids::TTS_MODEL,
            label: "TTS Model",
            description: "Select the TTS model to use for generating speech. Different models offer distinct voice styles and characteristics.".to_string(),
            values: models.tts_models.clone(),
            initial_value: models.default_tts_model.clone(),
        },
        SettingWidget::Select {
            id: ids::TTS_VOICE_PRESET,
            label: "TTS - Voice options",
            description: "Choose the specific voice preset you prefer for TTS responses. Each preset offers a unique vocal style and tone.".to_string(),
            values: models.tts_voices.clone(),
            initial_value: models.default_tts_voice.clone(),
        },
        SettingWidget::Switch {
            id: ids::USE_DYNAMIC_CONVERSATION_ROUTING,
            label: "Use dynamic conversation routing",
            description: format!(
                "This experimental feature automatically switches to specialized models based on your input. For example, if you ask to generate an image, it will use an image generation model like DALL·E 3. Note that this action requires an OpenAI API key. Default value is {}",
                python_bool(defaults.use_dynamic_conversation_routing)
            ),
            initial: defaults.use_dynamic_conversation_routing,
        },
        SettingWidget::Switch {
            id: ids::TRIM_MESSAGES,
            label: "Trimming Input Messages",
            description: "Ensure messages does not exceed a model's token limit".to_string(),
            initial: defaults.trim_messages,
        },
    ]
}

/// Capitalised boolean, as the descriptions have always shown it
fn python_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_toml_str("[openai]\napi_key = \"sk-test\"", |_| None).unwrap()
    }

    #[test]
    fn test_defaults_from_config() {
        let settings = ChatSettings::from_config(&config());
        assert_eq!(settings.chat_model, "gpt-4o-mini");
        assert_eq!(settings.vision_model, "gpt-4o");
        assert_eq!(settings.tts_voice_preset, "nova");
        assert!(settings.enable_tts_response);
        assert!(settings.use_dynamic_conversation_routing);
        assert!(settings.trim_messages);
    }

    #[test]
    fn test_partial_update() {
        let config = config();
        let mut settings = ChatSettings::from_config(&config);
        let update = ChatSettingsUpdate {
            chat_model: Some("gemini/gemini-1.5-pro".to_string()),
            enable_tts_response: Some(false),
            ..Default::default()
        };
        settings.apply(update, &config.models).unwrap();
        assert_eq!(settings.chat_model, "gemini/gemini-1.5-pro");
        assert!(!settings.enable_tts_response);
        assert_eq!(settings.vision_model, "gpt-4o");
    }

    #[test]
    fn test_rejected_update_changes_nothing() {
        let config = config();
        let mut settings = ChatSettings::from_config(&config);
        let before = settings.clone();
        let update = ChatSettingsUpdate {
            trim_messages: Some(false),
            tts_voice_preset: Some("robot".to_string()),
            ..Default::default()
        };
        let err = settings.apply(update, &config.models).unwrap_err();
        assert!(matches!(err, ChatError::InvalidSetting(ref m) if m.contains("robot")));
        assert_eq!(settings, before);
    }

    #[test]
    fn test_schema_lists_every_setting() {
        let schema = settings_schema(&config());
        assert_eq!(schema.len(), 7);

        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json[0]["type"], "Select");
        assert_eq!(json[0]["id"], "settings_chat_model");
        assert_eq!(json[0]["initial_value"], "gpt-4o-mini");
        assert_eq!(json[2]["type"], "Switch");
        assert_eq!(json[2]["initial"], true);
        assert!(
            json[2]["description"]
                .as_str()
                .unwrap()
                .ends_with("Default value is True.")
        );
        assert_eq!(json[6]["label"], "Trimming Input Messages");
    }

    #[test]
    fn test_unknown_update_field_is_rejected() {
        let result: Result<ChatSettingsUpdate, _> =
            serde_json::from_str(r#"{"chat_modle": "gpt-4o"}"#);
        assert!(result.is_err());
    }
}
