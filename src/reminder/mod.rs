//! Durable delayed reminders.

pub mod scheduler;

pub use scheduler::{spawn_sweep_task, ReminderScheduler, SweepStats};
