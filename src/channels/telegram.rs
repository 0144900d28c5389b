//! Telegram transport — long-polls the Bot API for updates.
//!
//! Translates Telegram updates into [`InboundEvent`]s (`/start`, callback
//! queries, plain text) and implements [`Notifier`] over sendMessage /
//! editMessageText with inline keyboards.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use crate::channels::{ButtonAction, EventStream, Notifier, OperatorSink, OutgoingMessage};
use crate::error::ChannelError;
use crate::funnel::event::{EventPayload, InboundEvent};
use crate::store::{NewSubject, Subject};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// Verify the token against getMe before serving traffic.
    pub async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    /// Start the long-poll loop and return the inbound event stream.
    pub async fn start(&self) -> Result<EventStream, ChannelError> {
        self.health_check().await?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = self.client.clone();
        let poll_url = self.api_url("getUpdates");
        let answer_url = self.api_url("answerCallbackQuery");

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for updates...");

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message", "callback_query"]
                });

                let resp = match client.post(&poll_url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if let Some(results) = data.get("result").and_then(Value::as_array) {
                    for update in results {
                        if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                            offset = uid + 1;
                        }

                        // Button presses stay in a "loading" state until
                        // acknowledged; answer before handing the event off.
                        if let Some(callback_id) = update
                            .pointer("/callback_query/id")
                            .and_then(Value::as_str)
                        {
                            let ack = json!({ "callback_query_id": callback_id });
                            if let Err(e) = client.post(&answer_url).json(&ack).send().await {
                                tracing::debug!("answerCallbackQuery failed: {e}");
                            }
                        }

                        let Some(event) = event_from_update(update) else {
                            continue;
                        };

                        if tx.send(event).is_err() {
                            tracing::info!("Telegram listener channel closed");
                            return;
                        }
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit; the
    /// keyboard rides on the final chunk.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            let markup = if i == last { reply_markup.clone() } else { None };
            self.call_with_markdown_fallback("sendMessage", chat_id, chunk, None, markup)
                .await?;
        }
        Ok(())
    }

    /// Rewrite an existing menu message in place.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        self.call_with_markdown_fallback(
            "editMessageText",
            chat_id,
            text,
            Some(message_id),
            reply_markup,
        )
        .await
    }

    /// One API call (≤4096 chars), Markdown-first with plain-text fallback.
    async fn call_with_markdown_fallback(
        &self,
        method: &str,
        chat_id: &str,
        text: &str,
        message_id: Option<&str>,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });
        if let Some(id) = message_id {
            body["message_id"] = json!(id.parse::<i64>().unwrap_or_default());
        }
        if let Some(markup) = &reply_markup {
            body["reply_markup"] = markup.clone();
        }

        let markdown_resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            method,
            "Telegram call with Markdown failed; retrying without parse_mode"
        );

        if let Some(map) = body.as_object_mut() {
            map.remove("parse_mode");
        }
        let plain_resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "{method} failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    async fn send(&self, subject_id: &str, message: &OutgoingMessage) -> Result<(), ChannelError> {
        let markup = keyboard_markup(message);

        if let Some(message_id) = &message.edit_message_id {
            // Editing can fail when the menu content is unchanged or the
            // message is too old; degrade to a fresh message.
            match self
                .edit_message(subject_id, message_id, &message.text, markup.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(subject_id, error = %e, "Menu edit failed, sending new message");
                }
            }
        }

        self.send_message(subject_id, &message.text, markup).await
    }
}

/// Forwards registration submissions to the operator's chat.
pub struct TelegramOperatorSink {
    channel: std::sync::Arc<TelegramChannel>,
    operator_chat_id: String,
}

impl TelegramOperatorSink {
    pub fn new(channel: std::sync::Arc<TelegramChannel>, operator_chat_id: String) -> Self {
        Self {
            channel,
            operator_chat_id,
        }
    }
}

#[async_trait]
impl OperatorSink for TelegramOperatorSink {
    async fn notify_registration(
        &self,
        subject: &Subject,
        payload: &str,
    ) -> Result<(), ChannelError> {
        let username = subject
            .username
            .as_deref()
            .map(|u| format!("@{u}"))
            .unwrap_or_else(|| "no username".into());
        let text = format!(
            "🆕 *Registration submitted*\n\n\
             Name: {}\n\
             Username: {}\n\
             Id: {}\n\n\
             {}",
            subject.display_name(),
            username,
            subject.subject_id,
            payload
        );
        self.channel
            .send_message(&self.operator_chat_id, &text, None)
            .await
    }
}

// ── Update parsing ──────────────────────────────────────────────────

/// Translate one Telegram update into an inbound event, if it carries one.
fn event_from_update(update: &Value) -> Option<InboundEvent> {
    if let Some(callback) = update.get("callback_query") {
        let subject = subject_from_user(callback.get("from")?)?;
        let id = callback.get("data").and_then(Value::as_str)?.to_string();
        let menu_message_id = callback
            .pointer("/message/message_id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string());

        let mut event = InboundEvent::new(subject, EventPayload::Selection { id });
        if let Some(message_id) = menu_message_id {
            event = event.with_metadata(json!({ "menu_message_id": message_id }));
        }
        return Some(event);
    }

    let message = update.get("message")?;
    let mut subject = subject_from_user(message.get("from")?)?;
    let text = message.get("text").and_then(Value::as_str)?;

    let payload = match text.split_whitespace().next() {
        Some("/start") => EventPayload::FirstContact,
        _ => EventPayload::FreeText {
            text: text.to_string(),
        },
    };

    if payload == EventPayload::FirstContact {
        // `/start ref42` deep links carry the traffic source.
        if let Some(source) = text.split_whitespace().nth(1) {
            subject.source = source.to_string();
        }
    }

    Some(InboundEvent::new(subject, payload))
}

fn subject_from_user(user: &Value) -> Option<NewSubject> {
    let id = user.get("id").and_then(Value::as_i64)?;
    let text_field = |key: &str| {
        user.get(key)
            .and_then(Value::as_str)
            .map(String::from)
    };
    Some(NewSubject {
        subject_id: id.to_string(),
        username: text_field("username"),
        first_name: text_field("first_name"),
        last_name: text_field("last_name"),
        source: "start".into(),
    })
}

/// Build the inline-keyboard reply_markup, if the message carries buttons.
fn keyboard_markup(message: &OutgoingMessage) -> Option<Value> {
    if message.keyboard.is_empty() {
        return None;
    }
    let rows: Vec<Vec<Value>> = message
        .keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| match &button.action {
                    ButtonAction::Select(id) => json!({
                        "text": button.label,
                        "callback_data": id,
                    }),
                    ButtonAction::Url(url) => json!({
                        "text": button.label,
                        "url": url,
                    }),
                })
                .collect()
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts at the largest
/// char boundary within the limit (user-supplied text is arbitrary UTF-8,
/// so a raw byte index can land inside a multibyte character).
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }

        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Button;

    fn user_json() -> Value {
        json!({
            "id": 42,
            "username": "alice",
            "first_name": "Alice",
            "last_name": "Smith"
        })
    }

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new(SecretString::from("123:ABC"));
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn start_command_becomes_first_contact() {
        let update = json!({
            "update_id": 1,
            "message": { "from": user_json(), "chat": { "id": 42 }, "text": "/start" }
        });
        let event = event_from_update(&update).unwrap();
        assert_eq!(event.payload, EventPayload::FirstContact);
        assert_eq!(event.subject.subject_id, "42");
        assert_eq!(event.subject.first_name.as_deref(), Some("Alice"));
        assert_eq!(event.subject.source, "start");
    }

    #[test]
    fn start_deep_link_carries_source() {
        let update = json!({
            "update_id": 1,
            "message": { "from": user_json(), "chat": { "id": 42 }, "text": "/start promo_july" }
        });
        let event = event_from_update(&update).unwrap();
        assert_eq!(event.payload, EventPayload::FirstContact);
        assert_eq!(event.subject.source, "promo_july");
    }

    #[test]
    fn plain_text_becomes_free_text() {
        let update = json!({
            "update_id": 1,
            "message": { "from": user_json(), "chat": { "id": 42 }, "text": "hello there" }
        });
        let event = event_from_update(&update).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::FreeText { text: "hello there".into() }
        );
    }

    #[test]
    fn callback_query_becomes_selection_with_menu_id() {
        let update = json!({
            "update_id": 1,
            "callback_query": {
                "id": "cb1",
                "from": user_json(),
                "data": "show_benefits",
                "message": { "message_id": 77 }
            }
        });
        let event = event_from_update(&update).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Selection { id: "show_benefits".into() }
        );
        assert_eq!(event.menu_message_id(), Some("77"));
    }

    #[test]
    fn non_text_update_is_ignored() {
        let update = json!({
            "update_id": 1,
            "message": { "from": user_json(), "chat": { "id": 42 }, "sticker": {} }
        });
        assert!(event_from_update(&update).is_none());
    }

    #[test]
    fn keyboard_markup_maps_button_kinds() {
        let message = OutgoingMessage::new("hi").with_keyboard(vec![vec![
            Button::select("Go", "go"),
            Button::url("Site", "https://example.com"),
        ]]);
        let markup = keyboard_markup(&message).unwrap();
        let row = &markup["inline_keyboard"][0];
        assert_eq!(row[0]["callback_data"], "go");
        assert_eq!(row[1]["url"], "https://example.com");
    }

    #[test]
    fn no_keyboard_means_no_markup() {
        assert!(keyboard_markup(&OutgoingMessage::new("hi")).is_none());
    }

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_never_cuts_inside_a_character() {
        // Two-byte characters put the raw byte limit mid-character.
        let msg = format!("a{}", "й".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 4096);
        }
        assert_eq!(chunks.concat(), msg);
    }
}
