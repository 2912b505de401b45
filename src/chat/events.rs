//! Events streamed to clients while a message is handled

use crate::core::constants::event;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Rich content attached to a message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Local attachment name, for images uploaded by the user
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        name: String,
    },
    Text {
        name: String,
        content: String,
    },
    Audio {
        url: String,
        name: String,
    },
}

/// One event of a chat response stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageStart {
        message_id: Uuid,
        author: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        content: String,
    },
    Token {
        message_id: Uuid,
        text: String,
    },
    Element {
        message_id: Uuid,
        element: Element,
    },
    Action {
        message_id: Uuid,
        action_id: Uuid,
        name: String,
        label: String,
        value: String,
    },
    MessageEnd {
        message_id: Uuid,
        content: String,
    },
    Route {
        name: Option<String>,
    },
    Error {
        message: String,
    },
    Done,
}

impl ChatEvent {
    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ChatEvent::MessageStart { .. } => event::MESSAGE_START,
            ChatEvent::Token { .. } => event::TOKEN,
            ChatEvent::Element { .. } => event::ELEMENT,
            ChatEvent::Action { .. } => event::ACTION,
            ChatEvent::MessageEnd { .. } => event::MESSAGE_END,
            ChatEvent::Route { .. } => event::ROUTE,
            ChatEvent::Error { .. } => event::ERROR,
            ChatEvent::Done => event::DONE,
        }
    }
}

/// Receiving side is the SSE response; a closed channel means the client left
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ChatEvent>) -> Self {
        Self { tx }
    }

    /// Sink and its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub async fn send(&self, event: ChatEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Client disconnected, dropping chat event");
        }
    }

    /// Start an assistant message and return its id
    pub async fn start_message(&self, author: &str, content: &str) -> Uuid {
        let message_id = Uuid::new_v4();
        self.send(ChatEvent::MessageStart {
            message_id,
            author: author.to_string(),
            content: content.to_string(),
        })
        .await;
        message_id
    }

    pub async fn element(&self, message_id: Uuid, element: Element) {
        self.send(ChatEvent::Element {
            message_id,
            element,
        })
        .await;
    }

    pub async fn end_message(&self, message_id: Uuid, content: &str) {
        self.send(ChatEvent::MessageEnd {
            message_id,
            content: content.to_string(),
        })
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = Uuid::nil();
        let json = serde_json::to_value(ChatEvent::Token {
            message_id: id,
            text: "Hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["text"], "Hi");

        let json = serde_json::to_value(ChatEvent::Element {
            message_id: id,
            element: Element::Image {
                url: Some("https://img.example/a.png".to_string()),
                path: None,
                name: "a cat".to_string(),
            },
        })
        .unwrap();
        assert_eq!(json["element"]["type"], "image");
        assert!(json["element"].get("path").is_none());

        assert_eq!(serde_json::to_value(ChatEvent::Done).unwrap()["type"], "done");
    }

    #[test]
    fn test_empty_start_content_is_omitted() {
        let json = serde_json::to_value(ChatEvent::MessageStart {
            message_id: Uuid::nil(),
            author: "gpt-4o".to_string(),
            content: String::new(),
        })
        .unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(
            ChatEvent::Route { name: None }.event_name(),
            "route"
        );
    }

    #[tokio::test]
    async fn test_sink_survives_closed_receiver() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        assert!(sink.is_closed());
        sink.send(ChatEvent::Done).await;
    }
}
