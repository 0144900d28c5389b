//! Persistence gateway — the single async interface the funnel machine and
//! the reminder scheduler talk to.
//!
//! Every operation is atomic with respect to concurrent callers touching the
//! same subject: uniqueness and the sent-flag monotonicity are enforced at
//! the storage layer, not by read-then-write at call sites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::funnel::step::FunnelStep;

/// Lifecycle status of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    New,
    Lead,
    WaitingVerification,
    Customer,
    Rejected,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Lead => "lead",
            Self::WaitingVerification => "waiting_verification",
            Self::Customer => "customer",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "lead" => Ok(Self::Lead),
            "waiting_verification" => Ok(Self::WaitingVerification),
            "customer" => Ok(Self::Customer),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown subject status '{other}'")),
        }
    }
}

/// A tracked end-user.
#[derive(Debug, Clone)]
pub struct Subject {
    pub subject_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: SubjectStatus,
    pub registration_payload: Option<String>,
    /// Where the subject entered the funnel from.
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Subject {
    /// Name used when addressing the subject in messages.
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or("friend")
    }
}

/// Display attributes for upserting a subject.
#[derive(Debug, Clone, Default)]
pub struct NewSubject {
    pub subject_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub source: String,
}

impl NewSubject {
    /// Name used when addressing the subject in messages.
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or("friend")
    }
}

/// The kind of free-text input a subject may be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingInput {
    RegistrationPayload,
}

impl AwaitingInput {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistrationPayload => "registration_payload",
        }
    }
}

impl std::str::FromStr for AwaitingInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration_payload" => Ok(Self::RegistrationPayload),
            other => Err(format!("unknown awaiting-input kind '{other}'")),
        }
    }
}

/// Durable per-subject conversation position. Zero or one per subject,
/// overwritten in place — never accumulated as history.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub subject_id: String,
    pub step: FunnelStep,
    pub awaiting: Option<AwaitingInput>,
    pub updated_at: DateTime<Utc>,
}

/// A follow-up nudge, eligible to fire at most once per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    FirstNudge,
    SecondNudge,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstNudge => "first_nudge",
            Self::SecondNudge => "second_nudge",
        }
    }
}

impl std::fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReminderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_nudge" => Ok(Self::FirstNudge),
            "second_nudge" => Ok(Self::SecondNudge),
            other => Err(format!("unknown reminder kind '{other}'")),
        }
    }
}

/// A persisted reminder record. Append-only; `sent` is monotone false→true.
#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: Uuid,
    pub subject_id: String,
    pub kind: ReminderKind,
    pub fire_at: DateTime<Utc>,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A due, unsent reminder joined with the owning subject's display name.
#[derive(Debug, Clone)]
pub struct DueReminder {
    pub id: Uuid,
    pub subject_id: String,
    pub kind: ReminderKind,
    pub fire_at: DateTime<Utc>,
    pub display_name: String,
}

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a subject, or refresh display attributes if the identity
    /// already exists. Returns `true` if the record was newly created.
    /// Never resets status or registration payload.
    async fn upsert_subject(&self, new: &NewSubject) -> Result<bool, DatabaseError>;

    /// Look up a subject by identity.
    async fn get_subject(&self, subject_id: &str) -> Result<Option<Subject>, DatabaseError>;

    /// Record the registration payload and move the subject to
    /// `waiting_verification` in one atomic update.
    async fn save_registration(
        &self,
        subject_id: &str,
        payload: &str,
    ) -> Result<(), DatabaseError>;

    /// Create the conversation-state row if absent. Returns `true` if it was
    /// created — the authoritative "first-ever funnel entry" signal.
    async fn ensure_conversation_state(
        &self,
        subject_id: &str,
        initial: FunnelStep,
    ) -> Result<bool, DatabaseError>;

    /// Fetch the subject's conversation state, if any.
    async fn get_conversation_state(
        &self,
        subject_id: &str,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    /// Overwrite the subject's conversation state in place.
    async fn set_conversation_state(
        &self,
        subject_id: &str,
        step: FunnelStep,
        awaiting: Option<AwaitingInput>,
    ) -> Result<(), DatabaseError>;

    /// Insert a reminder unless one already exists for (subject, kind).
    /// Returns `true` if inserted. Backed by a unique constraint, never a
    /// read-then-write.
    async fn insert_reminder_if_absent(
        &self,
        subject_id: &str,
        kind: ReminderKind,
        fire_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// All unsent reminders with `fire_at <= now` whose subject is still in
    /// status `new`, ordered by `fire_at` ascending.
    async fn list_due_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueReminder>, DatabaseError>;

    /// Atomically flip `sent` false→true. Returns `false` if the record was
    /// already marked (e.g. by a concurrent process instance).
    async fn mark_reminder_sent(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// All reminders for a subject, oldest first. Audit/read path.
    async fn list_reminders(&self, subject_id: &str) -> Result<Vec<Reminder>, DatabaseError>;

    /// Append an interaction record. Observability only — callers treat
    /// failures as non-fatal.
    async fn log_interaction(
        &self,
        subject_id: &str,
        action: &str,
        details: Option<&str>,
    ) -> Result<(), DatabaseError>;
}
