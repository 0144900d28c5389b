//! Channel abstraction for message I/O.

pub mod notifier;
pub mod operator;
pub mod telegram;

pub use notifier::{Button, ButtonAction, EventStream, Notifier, OutgoingMessage};
pub use operator::OperatorSink;
pub use telegram::{TelegramChannel, TelegramOperatorSink};
