//! Funnel bot — conversational sales funnel with durable reminders.

pub mod channels;
pub mod config;
pub mod content;
pub mod error;
pub mod funnel;
pub mod reminder;
pub mod store;
