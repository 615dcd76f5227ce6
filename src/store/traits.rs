//! Unified `Database` trait — single async interface for all persistence.
//!
//! Three logical stores share one backend: client profiles, the message log
//! and reminders. Each method is one atomic write or read; nothing here spans
//! a transaction across stores.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::DatabaseError;
use crate::intake::model::{ClientProfile, MessageLogEntry, ProfileUpdate, ReminderRecord};

/// Backend-agnostic database trait covering profiles, the message log and reminders.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Profiles ────────────────────────────────────────────────────

    /// Look up a client profile by external id.
    async fn get_profile(&self, user_id: &str) -> Result<Option<ClientProfile>, DatabaseError>;

    /// Create the profile if absent, otherwise merge the supplied fields.
    ///
    /// Unsupplied (`None`) fields keep their stored value. Concurrent writers
    /// resolve last-writer-wins per field.
    async fn upsert_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), DatabaseError>;

    /// Overwrite the stored step of an existing profile.
    async fn set_step(&self, user_id: &str, step: u32) -> Result<(), DatabaseError>;

    // ── Message log ─────────────────────────────────────────────────

    /// Append one entry. Returns the row id.
    async fn append_message(&self, entry: &MessageLogEntry) -> Result<i64, DatabaseError>;

    /// Entries for a user, most recent first, up to `limit`.
    async fn history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError>;

    /// Inbound entries only, most recent first, up to `limit`.
    async fn inbound_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError>;

    // ── Reminders ───────────────────────────────────────────────────

    /// Record a reminder. Returns the row id.
    async fn create_reminder(
        &self,
        user_id: &str,
        target_date: NaiveDate,
        weeks: u32,
    ) -> Result<i64, DatabaseError>;

    /// All reminders for a user, oldest first.
    async fn reminders_for(&self, user_id: &str) -> Result<Vec<ReminderRecord>, DatabaseError>;

    // ── Administration ──────────────────────────────────────────────

    /// Empty all three stores. Used for test isolation only.
    async fn reset_all(&self) -> Result<(), DatabaseError>;
}
