//! Event stream items and the sink nodes emit into.
//!
//! `StreamEvents` on the engine yields a finite sequence of these items for
//! one run: node boundaries, worker tool invocations, answer tokens and
//! errors. Events for a run are monotonic in run time; the stream is not
//! restartable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Tag of one stream item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeStart,
    NodeEnd,
    Token,
    ToolStart,
    ToolEnd,
    Error,
}

/// One item of the run event stream.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            name: None,
            content: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn node_start(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new(EventKind::NodeStart)
        }
    }

    pub fn node_end(name: &str, metadata: Value) -> Self {
        Self {
            name: Some(name.to_string()),
            metadata: Some(metadata),
            ..Self::new(EventKind::NodeEnd)
        }
    }

    pub fn token(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            ..Self::new(EventKind::Token)
        }
    }

    pub fn tool_start(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new(EventKind::ToolStart)
        }
    }

    pub fn tool_end(name: &str, metadata: Value) -> Self {
        Self {
            name: Some(name.to_string()),
            metadata: Some(metadata),
            ..Self::new(EventKind::ToolEnd)
        }
    }

    pub fn error(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            ..Self::new(EventKind::Error)
        }
    }
}

/// Where nodes emit events. A disabled sink drops everything; a closed
/// receiver is ignored so a departed stream consumer never stalls the run.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn attached(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::node_start("analyze");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_start");
        assert_eq!(value["name"], "analyze");
        assert!(value.get("content").is_none());
    }

    #[tokio::test]
    async fn sink_forwards_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::attached(tx);

        sink.emit(EngineEvent::node_start("analyze"));
        sink.emit(EngineEvent::token("전세"));
        sink.emit(EngineEvent::node_end("analyze", json!({"ok": true})));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::NodeStart);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Token);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::NodeEnd);
    }

    #[test]
    fn disabled_and_closed_sinks_do_not_panic() {
        EventSink::disabled().emit(EngineEvent::error("x"));

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        EventSink::attached(tx).emit(EngineEvent::error("x"));
    }
}
