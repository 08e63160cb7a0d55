//! Host events feeding the statistics engine
//!
//! The host pushes these into the ingestion channel. Entity and bot ids are
//! fully qualified (`platform:id`), matching the keys used in storage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsEvent {
    /// A bot received a message; `channel_id` is `None` for private chats
    MessageReceived {
        bot_id: String,
        #[serde(default)]
        channel_id: Option<String>,
    },
    /// A bot sent a message
    MessageSent {
        bot_id: String,
        #[serde(default)]
        channel_id: Option<String>,
    },
    CommandInvoked { command: String },
    DialogueMatched { dialogue_id: i64 },
}

impl StatsEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StatsEvent::MessageReceived { .. } => "message_received",
            StatsEvent::MessageSent { .. } => "message_sent",
            StatsEvent::CommandInvoked { .. } => "command_invoked",
            StatsEvent::DialogueMatched { .. } => "dialogue_matched",
        }
    }
}
