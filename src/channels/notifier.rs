//! Outbound delivery capability and message types.
//!
//! The core never retries a failed send beyond the reminder scheduler's
//! natural next-sweep retry; transports are expected to bring their own
//! backoff and rate limits.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::funnel::event::InboundEvent;

/// Stream of inbound events produced by a transport.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// One button on an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

/// What pressing a button does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    /// Emits a menu-selection event with this id.
    Select(String),
    /// Opens an external link.
    Url(String),
}

impl Button {
    pub fn select(label: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Select(id.into()),
        }
    }

    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Url(url.into()),
        }
    }
}

/// An outbound message: text, optional inline keyboard, and an optional
/// menu message to edit in place instead of sending a new message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    /// Keyboard rows; empty means no keyboard.
    pub keyboard: Vec<Vec<Button>>,
    /// Transport-native id of an existing message to edit.
    pub edit_message_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_keyboard(mut self, rows: Vec<Vec<Button>>) -> Self {
        self.keyboard = rows;
        self
    }

    pub fn as_edit_of(mut self, message_id: impl Into<String>) -> Self {
        self.edit_message_id = Some(message_id.into());
        self
    }
}

/// Best-effort delivery of a message to a subject.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject_id: &str, message: &OutgoingMessage) -> Result<(), ChannelError>;
}
