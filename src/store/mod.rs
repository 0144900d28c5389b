//! Persistence layer.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AwaitingInput, ConversationState, DueReminder, NewSubject, Reminder, ReminderKind, Store,
    Subject, SubjectStatus,
};
