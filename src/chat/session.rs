//! In-memory session store

use crate::chat::ChatError;
use crate::chat::history::History;
use crate::chat::settings::{ChatSettings, ChatSettingsUpdate};
use crate::core::config::ModelConfig;
use crate::models::openai::ChatMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Actions kept per session; registering past this drops the oldest
pub const MAX_PENDING_ACTIONS: usize = 16;

/// An action offered on a message, waiting to be triggered
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub name: String,
    pub value: String,
}

/// One conversation
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub settings: ChatSettings,
    pub history: History,
    /// Offered actions, oldest first
    #[serde(skip)]
    pub actions: VecDeque<(Uuid, PendingAction)>,
    pub created_at: DateTime<Utc>,
}

/// Sessions keyed by id
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    defaults: ChatSettings,
}

impl SessionStore {
    pub fn new(defaults: ChatSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Start a session with the default settings and a seeded history
    pub async fn create(&self) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            settings: self.defaults.clone(),
            history: History::seeded(),
            actions: VecDeque::new(),
            created_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        info!("💬 Session {} started", session.id);
        session
    }

    /// Snapshot of a session
    pub async fn get(&self, id: Uuid) -> Result<Session, ChatError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ChatError::SessionNotFound(id))
    }

    pub async fn settings(&self, id: Uuid) -> Result<ChatSettings, ChatError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.settings.clone())
            .ok_or(ChatError::SessionNotFound(id))
    }

    pub async fn update_settings(
        &self,
        id: Uuid,
        update: ChatSettingsUpdate,
        models: &ModelConfig,
    ) -> Result<ChatSettings, ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(ChatError::SessionNotFound(id))?;
        session.settings.apply(update, models)?;
        Ok(session.settings.clone())
    }

    /// Append to the history; empty roles and contents are skipped
    pub async fn append(&self, id: Uuid, role: &str, content: &str) -> Result<(), ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(ChatError::SessionNotFound(id))?;
        session.history.push(role, content);
        Ok(())
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<ChatMessage>, ChatError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.history.messages().to_vec())
            .ok_or(ChatError::SessionNotFound(id))
    }

    /// Remember an action offered to the user and return its id
    pub async fn register_action(
        &self,
        id: Uuid,
        name: &str,
        value: &str,
    ) -> Result<Uuid, ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(ChatError::SessionNotFound(id))?;
        let action_id = Uuid::new_v4();
        session.actions.push_back((
            action_id,
            PendingAction {
                name: name.to_string(),
                value: value.to_string(),
            },
        ));
        while session.actions.len() > MAX_PENDING_ACTIONS {
            if let Some((expired, _)) = session.actions.pop_front() {
                debug!("Dropped expired action {} in session {}", expired, id);
            }
        }
        Ok(action_id)
    }

    /// Remove and return an action; each action runs at most once
    pub async fn take_action(&self, id: Uuid, action_id: Uuid) -> Result<PendingAction, ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(ChatError::SessionNotFound(id))?;
        let position = session
            .actions
            .iter()
            .position(|(candidate, _)| *candidate == action_id)
            .ok_or(ChatError::ActionNotFound(action_id))?;
        session
            .actions
            .remove(position)
            .map(|(_, action)| action)
            .ok_or(ChatError::ActionNotFound(action_id))
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), ChatError> {
        match self.sessions.write().await.remove(&id) {
            Some(_) => {
                info!("Session {} ended", id);
                Ok(())
            }
            None => Err(ChatError::SessionNotFound(id)),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    fn store() -> (SessionStore, Config) {
        let config = Config::from_toml_str("[openai]\napi_key = \"sk-test\"", |_| None).unwrap();
        (SessionStore::new(ChatSettings::from_config(&config)), config)
    }

    #[tokio::test]
    async fn test_create_seeds_history() {
        let (store, _) = store();
        let session = store.create().await;
        let history = store.history(session.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "system");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (store, _) = store();
        let id = Uuid::new_v4();
        assert!(matches!(store.get(id).await, Err(ChatError::SessionNotFound(x)) if x == id));
        assert!(store.append(id, "user", "hi").await.is_err());
        assert!(store.remove(id).await.is_err());
    }

    #[tokio::test]
    async fn test_append_skips_empty_content() {
        let (store, _) = store();
        let id = store.create().await.id;
        store.append(id, "user", "").await.unwrap();
        store.append(id, "user", "hello").await.unwrap();
        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content.text(), "hello");
    }

    #[tokio::test]
    async fn test_actions_are_one_shot() {
        let (store, _) = store();
        let id = store.create().await.id;
        let action_id = store.register_action(id, "speak", "some text").await.unwrap();

        let action = store.take_action(id, action_id).await.unwrap();
        assert_eq!(action.value, "some text");
        assert!(matches!(
            store.take_action(id, action_id).await,
            Err(ChatError::ActionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_oldest_actions_are_dropped() {
        let (store, _) = store();
        let id = store.create().await.id;
        let first = store.register_action(id, "speak", "reply 0").await.unwrap();
        let mut latest = first;
        for n in 1..=MAX_PENDING_ACTIONS {
            latest = store
                .register_action(id, "speak", &format!("reply {}", n))
                .await
                .unwrap();
        }

        assert_eq!(store.get(id).await.unwrap().actions.len(), MAX_PENDING_ACTIONS);
        assert!(matches!(
            store.take_action(id, first).await,
            Err(ChatError::ActionNotFound(_))
        ));
        let action = store.take_action(id, latest).await.unwrap();
        assert_eq!(action.value, format!("reply {}", MAX_PENDING_ACTIONS));
    }

    #[tokio::test]
    async fn test_update_settings() {
        let (store, config) = store();
        let id = store.create().await.id;
        let update = ChatSettingsUpdate {
            vision_model: Some("gemini/gemini-1.5-flash".to_string()),
            ..Default::default()
        };
        let settings = store.update_settings(id, update, &config.models).await.unwrap();
        assert_eq!(settings.vision_model, "gemini/gemini-1.5-flash");
        assert_eq!(store.settings(id).await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _) = store();
        let id = store.create().await.id;
        store.remove(id).await.unwrap();
        assert_eq!(store.len().await, 0);
    }
}
