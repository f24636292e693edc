//! Telegram transport boundary, inbound side.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling loop
//! until the process exits. Every update is converted to a raw event and
//! published into the `ingestion` channel — no business logic lives here.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::MessageKind;
use tracing::{info, warn};

use kobzar_bus::StreamBus;
use kobzar_core::config::TelegramConfig;
use kobzar_core::types::{ChatKind, EventSource, InboundEvent, MediaKind};

/// Telegram channel adapter. Long polling — no public URL required.
pub struct TelegramAdapter {
    bot: Bot,
    bus: Arc<StreamBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, bus: Arc<StreamBus>) -> Self {
        Self {
            bot: Bot::new(&config.bot_token),
            bus,
        }
    }

    /// A bot handle for constructing the outbound sink.
    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Drive the long-polling loop. Never returns — runs for the lifetime of
    /// the process.
    pub async fn run(self) {
        info!("telegram: starting long-polling dispatcher");

        let bus = self.bus.clone();
        let handler = Update::filter_message().endpoint(handle_update);

        Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![bus])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
    }
}

/// Convert one Telegram message into a raw pipeline event and publish it.
async fn handle_update(_bot: Bot, msg: Message, bus: Arc<StreamBus>) -> ResponseResult<()> {
    // Other bots' traffic is ignored; our own replies arrive via loopback,
    // not via getUpdates.
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }

    let chat_kind = if msg.chat.is_private() {
        ChatKind::Private
    } else if msg.chat.is_group() {
        ChatKind::Group
    } else if msg.chat.is_supergroup() {
        ChatKind::Supergroup
    } else {
        // Channels and service chats are outside the observed world.
        return Ok(());
    };

    let event = InboundEvent {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0 as i64,
        source: EventSource::User,
        sender_id: from.id.0 as i64,
        sender_name: Some(from.full_name()),
        username: from.username.clone(),
        chat_kind,
        chat_title: msg.chat.title().map(str::to_string),
        text: msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or_default()
            .to_string(),
        timestamp: msg.date.timestamp() as f64,
        media: media_kind(&msg),
    };

    if let Err(e) = bus.ingestion.publish(event).await {
        warn!(chat_id = msg.chat.id.0, error = %e, "failed to publish inbound event");
    }
    Ok(())
}

fn media_kind(msg: &Message) -> Option<MediaKind> {
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };
    use teloxide::types::MediaKind as Tg;
    match &common.media_kind {
        Tg::Sticker(_) => Some(MediaKind::Sticker),
        Tg::Voice(_) => Some(MediaKind::Voice),
        Tg::Photo(_) => Some(MediaKind::Photo),
        Tg::Video(_) | Tg::VideoNote(_) => Some(MediaKind::Video),
        Tg::Document(_) => Some(MediaKind::Document),
        _ => None,
    }
}
