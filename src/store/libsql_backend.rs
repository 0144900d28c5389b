//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. All dedup-sensitive writes
//! (`upsert_subject`, `insert_reminder_if_absent`, `mark_reminder_sent`,
//! `ensure_conversation_state`) are single SQL statements whose affected-row
//! count is the authoritative answer, so concurrent process instances cannot
//! double-apply them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::funnel::step::FunnelStep;
use crate::store::migrations;
use crate::store::traits::{
    AwaitingInput, ConversationState, DueReminder, NewSubject, Reminder, ReminderKind, Store,
    Subject, SubjectStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, with or without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const SUBJECT_COLUMNS: &str =
    "subject_id, username, first_name, last_name, status, registration_payload, source, created_at";

fn row_to_subject(row: &libsql::Row) -> Result<Subject, libsql::Error> {
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(7)?;

    Ok(Subject {
        subject_id: row.get(0)?,
        username: row.get(1).ok(),
        first_name: row.get(2).ok(),
        last_name: row.get(3).ok(),
        status: status_str.parse().unwrap_or(SubjectStatus::New),
        registration_payload: row.get(5).ok(),
        source: row.get(6)?,
        created_at: parse_datetime(&created_str),
    })
}

const REMINDER_COLUMNS: &str = "id, subject_id, kind, fire_at, sent, sent_at, created_at";

fn row_to_reminder(row: &libsql::Row) -> Result<Reminder, libsql::Error> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(2)?;
    let fire_str: String = row.get(3)?;
    let sent: i64 = row.get(4)?;
    let sent_at_str: Option<String> = row.get(5).ok();
    let created_str: String = row.get(6)?;

    Ok(Reminder {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        subject_id: row.get(1)?,
        kind: kind_str.parse().unwrap_or(ReminderKind::FirstNudge),
        fire_at: parse_datetime(&fire_str),
        sent: sent != 0,
        sent_at: parse_optional_datetime(&sent_at_str),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn upsert_subject(&self, new: &NewSubject) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        // INSERT OR IGNORE is the atomic existence check; a zero row count
        // means the identity was already known.
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO subjects
                    (id, subject_id, username, first_name, last_name, status, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'new', ?6, ?7, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    new.subject_id.clone(),
                    opt_text(new.username.as_deref()),
                    opt_text(new.first_name.as_deref()),
                    opt_text(new.last_name.as_deref()),
                    new.source.clone(),
                    now.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_subject insert: {e}")))?;

        if inserted > 0 {
            debug!(subject_id = %new.subject_id, "Subject created");
            return Ok(true);
        }

        // Existing subject: refresh display attributes only. Status and
        // registration payload are never touched here.
        conn.execute(
            "UPDATE subjects SET username = ?1, first_name = ?2, last_name = ?3, updated_at = ?4
             WHERE subject_id = ?5",
            params![
                opt_text(new.username.as_deref()),
                opt_text(new.first_name.as_deref()),
                opt_text(new.last_name.as_deref()),
                now,
                new.subject_id.clone(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_subject refresh: {e}")))?;

        Ok(false)
    }

    async fn get_subject(&self, subject_id: &str) -> Result<Option<Subject>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE subject_id = ?1"),
                params![subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subject: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let subject = row_to_subject(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_subject row parse: {e}")))?;
                Ok(Some(subject))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_subject: {e}"))),
        }
    }

    async fn save_registration(
        &self,
        subject_id: &str,
        payload: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE subjects
                 SET registration_payload = ?1, status = 'waiting_verification', updated_at = ?2
                 WHERE subject_id = ?3",
                params![payload, now, subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_registration: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "subject".into(),
                id: subject_id.into(),
            });
        }
        debug!(subject_id, "Registration payload saved");
        Ok(())
    }

    async fn ensure_conversation_state(
        &self,
        subject_id: &str,
        initial: FunnelStep,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO conversation_state (subject_id, funnel_step, awaiting_input, updated_at)
                 VALUES (?1, ?2, NULL, ?3)",
                params![subject_id, initial.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_conversation_state: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_conversation_state(
        &self,
        subject_id: &str,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT subject_id, funnel_step, awaiting_input, updated_at
                 FROM conversation_state WHERE subject_id = ?1",
                params![subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let step_str: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("state row parse: {e}")))?;
                let awaiting_str: Option<String> = row.get(2).ok();
                let updated_str: String = row
                    .get(3)
                    .map_err(|e| DatabaseError::Query(format!("state row parse: {e}")))?;

                Ok(Some(ConversationState {
                    subject_id: row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("state row parse: {e}")))?,
                    step: step_str.parse().unwrap_or_default(),
                    awaiting: awaiting_str.and_then(|s| s.parse::<AwaitingInput>().ok()),
                    updated_at: parse_datetime(&updated_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation_state: {e}"))),
        }
    }

    async fn set_conversation_state(
        &self,
        subject_id: &str,
        step: FunnelStep,
        awaiting: Option<AwaitingInput>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO conversation_state (subject_id, funnel_step, awaiting_input, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (subject_id) DO UPDATE SET
                    funnel_step = excluded.funnel_step,
                    awaiting_input = excluded.awaiting_input,
                    updated_at = excluded.updated_at",
                params![
                    subject_id,
                    step.as_str(),
                    opt_text(awaiting.map(|a| a.as_str())),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_state: {e}")))?;

        debug!(subject_id, step = %step, "Conversation state updated");
        Ok(())
    }

    async fn insert_reminder_if_absent(
        &self,
        subject_id: &str,
        kind: ReminderKind,
        fire_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO reminders (id, subject_id, kind, fire_at, sent, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    subject_id,
                    kind.as_str(),
                    fire_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_reminder_if_absent: {e}")))?;

        if inserted > 0 {
            debug!(subject_id, kind = %kind, fire_at = %fire_at, "Reminder scheduled");
        }
        Ok(inserted > 0)
    }

    async fn list_due_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueReminder>, DatabaseError> {
        // Subjects who are past status 'new' (e.g. already submitted their
        // registration) are not nudged; their rows stay unsent as audit.
        let mut rows = self
            .conn()
            .query(
                "SELECT r.id, r.subject_id, r.kind, r.fire_at,
                        COALESCE(s.first_name, s.username, 'friend')
                 FROM reminders r
                 JOIN subjects s ON s.subject_id = r.subject_id
                 WHERE r.sent = 0 AND r.fire_at <= ?1 AND s.status = 'new'
                 ORDER BY r.fire_at ASC",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_reminders: {e}")))?;

        let mut due = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            // A row whose id cannot round-trip can never be marked sent, so
            // it must not be handed to the sweep.
            let Ok(id) = Uuid::parse_str(&id_str) else {
                tracing::warn!(id = %id_str, "Skipping reminder row with malformed id");
                continue;
            };
            let kind_str: String = row.get(2).unwrap_or_default();
            let Ok(kind) = kind_str.parse::<ReminderKind>() else {
                tracing::warn!(kind = %kind_str, "Skipping reminder row with unknown kind");
                continue;
            };
            let fire_str: String = row.get(3).unwrap_or_default();
            due.push(DueReminder {
                id,
                subject_id: row.get(1).unwrap_or_default(),
                kind,
                fire_at: parse_datetime(&fire_str),
                display_name: row.get(4).unwrap_or_else(|_| "friend".to_string()),
            });
        }
        Ok(due)
    }

    async fn mark_reminder_sent(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        // Check-and-set: the WHERE sent = 0 guard makes the transition
        // exactly-once even with concurrent process instances.
        let affected = self
            .conn()
            .execute(
                "UPDATE reminders SET sent = 1, sent_at = ?1 WHERE id = ?2 AND sent = 0",
                params![now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_reminder_sent: {e}")))?;
        Ok(affected > 0)
    }

    async fn list_reminders(&self, subject_id: &str) -> Result<Vec<Reminder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REMINDER_COLUMNS} FROM reminders WHERE subject_id = ?1 ORDER BY fire_at ASC"
                ),
                params![subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_reminders: {e}")))?;

        let mut reminders = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_reminder(&row) {
                Ok(r) => reminders.push(r),
                Err(e) => tracing::warn!("Skipping reminder row: {e}"),
            }
        }
        Ok(reminders)
    }

    async fn log_interaction(
        &self,
        subject_id: &str,
        action: &str,
        details: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO interactions (id, subject_id, action, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    subject_id,
                    action,
                    opt_text(details),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_interaction: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subject(id: &str, first_name: &str) -> NewSubject {
        NewSubject {
            subject_id: id.to_string(),
            username: None,
            first_name: Some(first_name.to_string()),
            last_name: None,
            source: "start".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_subject_is_idempotent() {
        let store = LibSqlBackend::new_memory().await.unwrap();

        assert!(store.upsert_subject(&subject("u1", "Alice")).await.unwrap());
        assert!(!store.upsert_subject(&subject("u1", "Alicia")).await.unwrap());

        let s = store.get_subject("u1").await.unwrap().unwrap();
        assert_eq!(s.first_name.as_deref(), Some("Alicia"));
        assert_eq!(s.status, SubjectStatus::New);
    }

    #[tokio::test]
    async fn upsert_never_resets_registration() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();
        store.save_registration("u1", "Alice / 12345 / 500").await.unwrap();

        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();

        let s = store.get_subject("u1").await.unwrap().unwrap();
        assert_eq!(s.registration_payload.as_deref(), Some("Alice / 12345 / 500"));
        assert_eq!(s.status, SubjectStatus::WaitingVerification);
    }

    #[tokio::test]
    async fn save_registration_unknown_subject_is_not_found() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let err = store.save_registration("ghost", "data").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn conversation_state_created_once() {
        let store = LibSqlBackend::new_memory().await.unwrap();

        assert!(
            store
                .ensure_conversation_state("u1", FunnelStep::Start)
                .await
                .unwrap()
        );
        assert!(
            !store
                .ensure_conversation_state("u1", FunnelStep::Start)
                .await
                .unwrap()
        );

        let state = store.get_conversation_state("u1").await.unwrap().unwrap();
        assert_eq!(state.step, FunnelStep::Start);
        assert!(state.awaiting.is_none());
    }

    #[tokio::test]
    async fn conversation_state_overwritten_in_place() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store
            .ensure_conversation_state("u1", FunnelStep::Start)
            .await
            .unwrap();

        store
            .set_conversation_state(
                "u1",
                FunnelStep::AwaitingRegistrationData,
                Some(AwaitingInput::RegistrationPayload),
            )
            .await
            .unwrap();

        let state = store.get_conversation_state("u1").await.unwrap().unwrap();
        assert_eq!(state.step, FunnelStep::AwaitingRegistrationData);
        assert_eq!(state.awaiting, Some(AwaitingInput::RegistrationPayload));

        store
            .set_conversation_state("u1", FunnelStep::Done, None)
            .await
            .unwrap();
        let state = store.get_conversation_state("u1").await.unwrap().unwrap();
        assert_eq!(state.step, FunnelStep::Done);
        assert!(state.awaiting.is_none());
    }

    #[tokio::test]
    async fn reminder_insert_if_absent_dedups() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();
        let t = Utc::now() + Duration::hours(30);

        assert!(
            store
                .insert_reminder_if_absent("u1", ReminderKind::FirstNudge, t)
                .await
                .unwrap()
        );
        assert!(
            !store
                .insert_reminder_if_absent("u1", ReminderKind::FirstNudge, t + Duration::hours(1))
                .await
                .unwrap()
        );

        let reminders = store.list_reminders("u1").await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].kind, ReminderKind::FirstNudge);
        assert!(!reminders[0].sent);
    }

    #[tokio::test]
    async fn due_reminders_respect_fire_at_and_order() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();

        let t0 = Utc::now();
        store
            .insert_reminder_if_absent("u1", ReminderKind::SecondNudge, t0 + Duration::hours(72))
            .await
            .unwrap();
        store
            .insert_reminder_if_absent("u1", ReminderKind::FirstNudge, t0 + Duration::hours(30))
            .await
            .unwrap();

        // Before either fire time: nothing due.
        assert!(store.list_due_reminders(t0).await.unwrap().is_empty());

        // Past the first but not the second.
        let due = store
            .list_due_reminders(t0 + Duration::hours(31))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, ReminderKind::FirstNudge);
        assert_eq!(due[0].display_name, "Alice");

        // Past both: fire_at ascending.
        let due = store
            .list_due_reminders(t0 + Duration::hours(100))
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].kind, ReminderKind::FirstNudge);
        assert_eq!(due[1].kind, ReminderKind::SecondNudge);
    }

    #[tokio::test]
    async fn due_reminders_skip_registered_subjects() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();
        let t0 = Utc::now();
        store
            .insert_reminder_if_absent("u1", ReminderKind::FirstNudge, t0)
            .await
            .unwrap();

        store.save_registration("u1", "payload").await.unwrap();

        let due = store
            .list_due_reminders(t0 + Duration::hours(1))
            .await
            .unwrap();
        assert!(due.is_empty());

        // The record is retained, unsent, as audit.
        let reminders = store.list_reminders("u1").await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert!(!reminders[0].sent);
    }

    #[tokio::test]
    async fn mark_sent_is_exactly_once() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();
        let t0 = Utc::now();
        store
            .insert_reminder_if_absent("u1", ReminderKind::FirstNudge, t0)
            .await
            .unwrap();
        let id = store.list_reminders("u1").await.unwrap()[0].id;

        assert!(store.mark_reminder_sent(id, t0).await.unwrap());
        // Second writer loses the check-and-set.
        assert!(!store.mark_reminder_sent(id, t0).await.unwrap());

        let r = &store.list_reminders("u1").await.unwrap()[0];
        assert!(r.sent);
        assert!(r.sent_at.is_some());
    }

    #[tokio::test]
    async fn due_reminders_skip_malformed_ids() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();
        let t0 = Utc::now();

        // A corrupt row has no usable identity for mark_reminder_sent and
        // would otherwise be re-delivered on every sweep.
        store
            .conn()
            .execute(
                "INSERT INTO reminders (id, subject_id, kind, fire_at, sent, created_at)
                 VALUES ('not-a-uuid', 'u1', 'first_nudge', ?1, 0, ?1)",
                params![(t0 - Duration::hours(1)).to_rfc3339()],
            )
            .await
            .unwrap();
        store
            .insert_reminder_if_absent("u1", ReminderKind::SecondNudge, t0 - Duration::minutes(5))
            .await
            .unwrap();

        let due = store.list_due_reminders(t0).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, ReminderKind::SecondNudge);
    }

    #[tokio::test]
    async fn interactions_append() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_subject(&subject("u1", "Alice")).await.unwrap();
        store.log_interaction("u1", "start", None).await.unwrap();
        store
            .log_interaction("u1", "free_text", Some("hello"))
            .await
            .unwrap();
    }
}
