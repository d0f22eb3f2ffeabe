//! Stream consumers
//!
//! The host-facing callback surface. The manager calls these from its actor
//! task; implementations must not block.

use tokio::sync::broadcast;
use tracing::trace;
use workflowdock_protocol::{
    ChatMessage, PromptRequest, ServerMessage, SessionSummary, StopInfo,
};

pub trait StreamConsumer: Send + Sync {
    /// Incremental agent text
    fn on_chunk(&self, session_id: &str, text: &str);

    /// A complete message for the transcript
    fn on_message_add(&self, message: &ChatMessage);

    /// Terminal status reached. Called at most once per session.
    fn on_stop(&self, session_id: &str, stop: &StopInfo);

    fn on_prompt(&self, prompt: &PromptRequest);

    fn on_session_started(&self, _summary: &SessionSummary) {}

    fn on_session_changed(&self, _summary: &SessionSummary) {}

    fn on_session_rekeyed(&self, _previous_id: &str, _session_id: &str) {}

    fn on_session_removed(&self, _session_id: &str) {}

    fn on_error(&self, _session_id: Option<&str>, _code: &str, _message: &str) {}
}

/// Fans every callback out to editor clients as [`ServerMessage`]s
pub struct BroadcastConsumer {
    tx: broadcast::Sender<ServerMessage>,
}

impl BroadcastConsumer {
    pub fn new(tx: broadcast::Sender<ServerMessage>) -> Self {
        Self { tx }
    }

    fn send(&self, message: ServerMessage) {
        // No receivers just means no editor is attached right now.
        if self.tx.send(message).is_err() {
            trace!(
                component = "consumer",
                event = "consumer.broadcast.no_receivers",
                "No editor clients attached"
            );
        }
    }
}

impl StreamConsumer for BroadcastConsumer {
    fn on_chunk(&self, session_id: &str, text: &str) {
        self.send(ServerMessage::Chunk {
            session_id: session_id.to_string(),
            text: text.to_string(),
        });
    }

    fn on_message_add(&self, message: &ChatMessage) {
        self.send(ServerMessage::MessageAdded {
            session_id: message.session_id.clone(),
            message: message.clone(),
        });
    }

    fn on_stop(&self, session_id: &str, stop: &StopInfo) {
        self.send(ServerMessage::Stopped {
            session_id: session_id.to_string(),
            stop: stop.clone(),
        });
    }

    fn on_prompt(&self, prompt: &PromptRequest) {
        self.send(ServerMessage::PromptRequested {
            prompt: prompt.clone(),
        });
    }

    fn on_session_started(&self, summary: &SessionSummary) {
        self.send(ServerMessage::SessionStarted {
            session: summary.clone(),
        });
    }

    fn on_session_changed(&self, summary: &SessionSummary) {
        self.send(ServerMessage::SessionChanged {
            session: summary.clone(),
        });
    }

    fn on_session_rekeyed(&self, previous_id: &str, session_id: &str) {
        self.send(ServerMessage::SessionRekeyed {
            previous_id: previous_id.to_string(),
            session_id: session_id.to_string(),
        });
    }

    fn on_session_removed(&self, session_id: &str) {
        self.send(ServerMessage::SessionRemoved {
            session_id: session_id.to_string(),
        });
    }

    fn on_error(&self, session_id: Option<&str>, code: &str, message: &str) {
        self.send(ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            session_id: session_id.map(String::from),
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use workflowdock_protocol::StopReason;

    #[test]
    fn broadcast_consumer_forwards_server_messages() {
        let (tx, mut rx) = broadcast::channel(8);
        let consumer = BroadcastConsumer::new(tx);

        consumer.on_chunk("wf-1", "hello");
        consumer.on_stop(
            "wf-1",
            &StopInfo {
                reason: StopReason::Complete,
                error: None,
            },
        );

        match rx.try_recv().expect("chunk") {
            ServerMessage::Chunk { session_id, text } => {
                assert_eq!(session_id, "wf-1");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().expect("stop"),
            ServerMessage::Stopped { .. }
        ));
    }

    #[test]
    fn broadcast_without_receivers_does_not_panic() {
        let (tx, rx) = broadcast::channel(8);
        drop(rx);
        BroadcastConsumer::new(tx).on_session_removed("wf-1");
    }
}
