//! Telegram transport boundary, outbound side.
//!
//! Implements the pipeline's [`OutboundSink`]: delivers the Responder's text
//! and reports the platform message id so the loopback event carries the
//! real uid. Long replies are split at the 4096-character Telegram limit.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

use kobzar_agent::OutboundSink;

/// Telegram's hard limit is 4096 characters per message; stay a little under.
const CHUNK_MAX: usize = 4090;

pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl OutboundSink for TelegramSink {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        let chunks = split_chunks(text);
        let mut last_id: Option<i64> = None;

        for (i, chunk) in chunks.iter().enumerate() {
            match self.bot.send_message(ChatId(chat_id), chunk).await {
                Ok(sent) => last_id = Some(sent.id.0 as i64),
                Err(e) => {
                    warn!(chat_id, chunk = i, error = %e, "telegram send failed");
                    return Err(e.to_string());
                }
            }
            if i + 1 < chunks.len() {
                // Breathe between chunks so Telegram's limiter stays calm.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        last_id.ok_or_else(|| "nothing to send".to_string())
    }
}

/// Split on line boundaries, falling back to a hard cut for single lines
/// longer than the limit. UTF-8 safe: cuts land on char boundaries.
fn split_chunks(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        if !current.is_empty() && current.len() + 1 + line.len() > CHUNK_MAX {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > CHUNK_MAX {
            // A single oversized line: hard-split on char boundaries.
            let mut rest = line;
            while rest.len() > CHUNK_MAX {
                let mut cut = CHUNK_MAX;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current = rest.to_string();
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_chunks("привіт"), vec!["привіт"]);
    }

    #[test]
    fn long_text_splits_on_lines() {
        let line = "а".repeat(3000);
        let text = format!("{line}\n{line}");
        let chunks = split_chunks(&text);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn oversized_line_hard_splits_on_char_boundary() {
        // Cyrillic chars are 2 bytes; a naive byte cut would panic.
        let text = "є".repeat(5000);
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }
}
