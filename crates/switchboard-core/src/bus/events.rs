//! Message bus event types — thin re-export of the pipeline's own
//! [`crate::model::InboundMessage`]/[`crate::model::OutboundReply`] shapes,
//! kept as a separate module (as the teacher does) so `bus::mod` can stay
//! transport-agnostic.

pub use crate::model::{InboundMessage, OutboundReply};

impl InboundMessage {
    /// A synthetic inbound message for the CLI bridge (spec §6.1's
    /// `POST /internal/cli/message`), which has no channel-assigned
    /// `chat_id`/`user_id` of its own.
    pub fn cli(chat_id: i64, user_id: i64, text: &str) -> Self {
        Self { chat_id, user_id, text: text.into(), source: "cli".into(), request_id: None, reply_reference: None }
    }
}
