//! Telegram ingress/egress transport (spec §6.2). Ingress pushes
//! `InboundMessage`s onto the bus; egress implements [`EgressTransport`] so
//! the outbox worker can deliver queued replies directly, independent of
//! whatever subscribes to live outbound replies.

use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::bus::events::InboundMessage;
use crate::gateway::utils::chunk_message;
use crate::outbox::EgressTransport;

/// Maximum Telegram message length.
const TELEGRAM_MAX_LEN: usize = 4096;

pub struct TelegramTransport {
    bot: Bot,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
}

impl TelegramTransport {
    pub fn new(token: String, bus: Arc<MessageBus>, allow_from: Vec<String>) -> Self {
        Self { bot: Bot::new(token), bus, allow_from }
    }

    /// Runs the Telegram long-polling dispatcher. Returns once the
    /// dispatcher stops (ctrl-c or fatal transport error).
    pub async fn run(self) -> Result<()> {
        info!("Telegram transport started");

        let bus = Arc::clone(&self.bus);
        let allow_from = self.allow_from.clone();
        let handler = Update::filter_message().endpoint(
            move |_bot: Bot, msg: Message, bus: Arc<MessageBus>, allow_from: Vec<String>| async move {
                let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
                let chat_id = msg.chat.id.0;

                if !allow_from.is_empty() && !allow_from.contains(&user_id.to_string()) {
                    warn!(user_id, chat_id, "rejected message from user not in allowFrom list");
                    return respond(());
                }

                if let Some(text) = msg.text() {
                    let inbound = InboundMessage {
                        chat_id,
                        user_id,
                        text: text.to_owned(),
                        source: "telegram".into(),
                        request_id: None,
                        reply_reference: None,
                    };
                    if let Err(e) = bus.inbound_sender().send(inbound).await {
                        error!("failed to send inbound message to bus: {e}");
                    }
                }
                respond(())
            },
        );

        Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![bus, allow_from])
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}

/// Plain send-only egress handle backing the durable outbox worker.
pub struct TelegramEgress {
    bot: Bot,
}

impl TelegramEgress {
    pub fn new(token: String) -> Self {
        Self { bot: Bot::new(token) }
    }
}

#[async_trait::async_trait]
impl EgressTransport for TelegramEgress {
    async fn send(&self, chat_id: i64, text: &str, _source: &str) -> Result<()> {
        for chunk in chunk_message(text, TELEGRAM_MAX_LEN) {
            self.bot.send_message(ChatId(chat_id), chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_from_matches_stringified_user_id() {
        let allow_from = vec!["123".to_string()];
        assert!(allow_from.contains(&123i64.to_string()));
        assert!(!allow_from.contains(&456i64.to_string()));
    }
}
