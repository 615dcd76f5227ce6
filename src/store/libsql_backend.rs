//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::intake::model::{
    ClientProfile, Direction, MessageLogEntry, PLACEHOLDER_NAME, ProfileUpdate, ReminderRecord,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use;
/// every statement executes atomically on its own.
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

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
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

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_log(
        &self,
        sql: &str,
        user_id: &str,
        limit: usize,
        op: &str,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![user_id, limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut entries = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_log_entry(&row) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => tracing::warn!("Skipping message_log row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(entries)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp, so text ordering equals time ordering.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<u32>` to libsql Value.
fn opt_int(n: Option<u32>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(i64::from(n)),
        None => libsql::Value::Null,
    }
}

fn to_step(raw: i64) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

/// Read the id from an `INSERT ... RETURNING id` statement.
///
/// `last_insert_rowid()` is per connection, and the connection is shared
/// between tasks.
async fn returned_id(rows: &mut libsql::Rows, op: &str) -> Result<i64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}"))),
        Ok(None) => Err(DatabaseError::Query(format!("{op}: no id returned"))),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

/// Map a libsql Row to a ClientProfile.
///
/// Column order matches CLIENT_COLUMNS.
fn row_to_profile(row: &libsql::Row) -> Result<ClientProfile, libsql::Error> {
    let step: i64 = row.get(5)?;
    Ok(ClientProfile {
        user_id: row.get(0)?,
        name: row
            .get::<String>(1)
            .unwrap_or_else(|_| PLACEHOLDER_NAME.to_string()),
        pet_type: row.get(2).ok(),
        pet_name: row.get(3).ok(),
        preferences: row.get(4).ok(),
        step: to_step(step),
    })
}

/// Map a libsql Row to a MessageLogEntry.
///
/// Column order matches LOG_COLUMNS.
fn row_to_log_entry(row: &libsql::Row) -> Result<MessageLogEntry, DatabaseError> {
    let user_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let ts: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let text: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let direction: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let service: String = row.get(4).unwrap_or_default();
    let step: i64 = row.get(5).unwrap_or(0);

    Ok(MessageLogEntry {
        user_id,
        timestamp: parse_datetime(&ts),
        text,
        direction: direction
            .parse::<Direction>()
            .map_err(DatabaseError::Serialization)?,
        service,
        step: to_step(step),
    })
}

/// Map a libsql Row to a ReminderRecord.
fn row_to_reminder(row: &libsql::Row) -> Result<ReminderRecord, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let user_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let date: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let weeks: i64 = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;

    Ok(ReminderRecord {
        id,
        user_id,
        target_date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| DatabaseError::Serialization(format!("fecha_recordatorio {date}: {e}")))?,
        weeks: to_step(weeks),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const CLIENT_COLUMNS: &str = "whatsapp, nombre, mascota_tipo, mascota_nombre, preferencias, step";

const LOG_COLUMNS: &str =
    "telefono_cliente, fecha_mensaje, mensaje, message_direction, servicio, step";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: &str) -> Result<Option<ClientProfile>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE whatsapp = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let profile = row_to_profile(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(profile))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_profile: {e}"))),
        }
    }

    async fn upsert_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = format_timestamp(&Utc::now());
        conn.execute(
            "INSERT INTO clients (whatsapp, nombre, mascota_tipo, mascota_nombre, preferencias,
                step, created_at, updated_at)
             VALUES (?1, COALESCE(?2, ?7), ?3, ?4, ?5, COALESCE(?6, 0), ?8, ?8)
             ON CONFLICT (whatsapp) DO UPDATE SET
                nombre = COALESCE(?2, nombre),
                mascota_tipo = COALESCE(?3, mascota_tipo),
                mascota_nombre = COALESCE(?4, mascota_nombre),
                preferencias = COALESCE(?5, preferencias),
                step = COALESCE(?6, step),
                updated_at = ?8",
            params![
                user_id,
                opt_text(update.name.as_deref()),
                opt_text(update.pet_type.as_deref()),
                opt_text(update.pet_name.as_deref()),
                opt_text(update.preferences.as_deref()),
                opt_int(update.step),
                PLACEHOLDER_NAME,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_profile: {e}")))?;

        debug!(user_id = user_id, update = ?update, "Client profile upserted");
        Ok(())
    }

    async fn set_step(&self, user_id: &str, step: u32) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = format_timestamp(&Utc::now());
        let changed = conn
            .execute(
                "UPDATE clients SET step = ?1, updated_at = ?2 WHERE whatsapp = ?3",
                params![i64::from(step), now, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_step: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "client".to_string(),
                id: user_id.to_string(),
            });
        }
        debug!(user_id = user_id, step = step, "Client step updated");
        Ok(())
    }

    // ── Message log ─────────────────────────────────────────────────

    async fn append_message(&self, entry: &MessageLogEntry) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO message_log (telefono_cliente, fecha_mensaje, mensaje,
                    message_direction, servicio, step)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 RETURNING id",
                params![
                    entry.user_id.as_str(),
                    format_timestamp(&entry.timestamp),
                    entry.text.as_str(),
                    entry.direction.as_str(),
                    entry.service.as_str(),
                    i64::from(entry.step),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;

        let id = returned_id(&mut rows, "append_message").await?;
        debug!(
            id = id,
            user_id = %entry.user_id,
            direction = %entry.direction,
            step = entry.step,
            "Message logged"
        );
        Ok(id)
    }

    async fn history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        self.query_log(
            &format!(
                "SELECT {LOG_COLUMNS} FROM message_log WHERE telefono_cliente = ?1
                 ORDER BY fecha_mensaje DESC, id DESC LIMIT ?2"
            ),
            user_id,
            limit,
            "history",
        )
        .await
    }

    async fn inbound_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        self.query_log(
            &format!(
                "SELECT {LOG_COLUMNS} FROM message_log
                 WHERE telefono_cliente = ?1 AND message_direction = 'inbound'
                 ORDER BY fecha_mensaje DESC, id DESC LIMIT ?2"
            ),
            user_id,
            limit,
            "inbound_history",
        )
        .await
    }

    // ── Reminders ───────────────────────────────────────────────────

    async fn create_reminder(
        &self,
        user_id: &str,
        target_date: NaiveDate,
        weeks: u32,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO reminders (usuario, fecha_recordatorio, numero_semanas)
                 VALUES (?1, ?2, ?3)
                 RETURNING id",
                params![
                    user_id,
                    target_date.format("%Y-%m-%d").to_string(),
                    i64::from(weeks)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_reminder: {e}")))?;

        let id = returned_id(&mut rows, "create_reminder").await?;
        info!(id = id, user_id = user_id, %target_date, weeks = weeks, "Reminder saved");
        Ok(id)
    }

    async fn reminders_for(&self, user_id: &str) -> Result<Vec<ReminderRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, usuario, fecha_recordatorio, numero_semanas FROM reminders
                 WHERE usuario = ?1 ORDER BY id ASC",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reminders_for: {e}")))?;

        let mut reminders = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => reminders.push(row_to_reminder(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("reminders_for: {e}"))),
            }
        }
        Ok(reminders)
    }

    // ── Administration ──────────────────────────────────────────────

    async fn reset_all(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(
                "DELETE FROM message_log;
                 DELETE FROM reminders;
                 DELETE FROM clients;",
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_all: {e}")))?;

        info!("All intake tables truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 15, h, m, s).unwrap()
    }

    // ── Profile tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn get_profile_not_found() {
        let db = test_db().await;
        assert!(db.get_profile("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_creates_with_placeholder() {
        let db = test_db().await;
        db.upsert_profile("5491112345678", &ProfileUpdate::default())
            .await
            .unwrap();

        let profile = db.get_profile("5491112345678").await.unwrap().unwrap();
        assert_eq!(profile, ClientProfile::new("5491112345678"));
    }

    #[tokio::test]
    async fn upsert_without_name_uses_placeholder() {
        let db = test_db().await;
        let update = ProfileUpdate {
            pet_name: Some("Michi".into()),
            ..Default::default()
        };
        db.upsert_profile("a", &update).await.unwrap();

        let profile = db.get_profile("a").await.unwrap().unwrap();
        assert_eq!(profile.name, PLACEHOLDER_NAME);
        assert_eq!(profile.pet_name.as_deref(), Some("Michi"));
        assert_eq!(profile.step, 0);
    }

    #[tokio::test]
    async fn upsert_merges_only_supplied_fields() {
        let db = test_db().await;
        db.upsert_profile("a", &ProfileUpdate::default())
            .await
            .unwrap();
        db.upsert_profile(
            "a",
            &ProfileUpdate {
                pet_name: Some("Firulais".into()),
                preferences: Some("Royal Canin".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.upsert_profile(
            "a",
            &ProfileUpdate {
                pet_type: Some("Golden Retriever".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let profile = db.get_profile("a").await.unwrap().unwrap();
        assert_eq!(profile.pet_name.as_deref(), Some("Firulais"));
        assert_eq!(profile.preferences.as_deref(), Some("Royal Canin"));
        assert_eq!(profile.pet_type.as_deref(), Some("Golden Retriever"));
        assert_eq!(profile.name, PLACEHOLDER_NAME);
    }

    #[tokio::test]
    async fn upsert_is_one_row_per_user() {
        let db = test_db().await;
        for _ in 0..3 {
            db.upsert_profile("a", &ProfileUpdate::default())
                .await
                .unwrap();
        }
        let mut rows = db
            .conn()
            .query("SELECT COUNT(*) FROM clients", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn empty_upsert_leaves_existing_profile_alone() {
        let db = test_db().await;
        let update = ProfileUpdate {
            name: Some("Ana".into()),
            step: Some(4),
            ..Default::default()
        };
        db.upsert_profile("a", &update).await.unwrap();
        db.upsert_profile("a", &ProfileUpdate::default())
            .await
            .unwrap();

        let profile = db.get_profile("a").await.unwrap().unwrap();
        assert_eq!(profile.name, "Ana");
        assert_eq!(profile.step, 4);
    }

    #[tokio::test]
    async fn set_step_updates_existing() {
        let db = test_db().await;
        db.upsert_profile("a", &ProfileUpdate::default())
            .await
            .unwrap();
        db.set_step("a", 3).await.unwrap();
        assert_eq!(db.get_profile("a").await.unwrap().unwrap().step, 3);
    }

    #[tokio::test]
    async fn set_step_unknown_user_is_not_found() {
        let db = test_db().await;
        let err = db.set_step("ghost", 2).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Message log tests ───────────────────────────────────────────

    #[tokio::test]
    async fn history_is_most_recent_first() {
        let db = test_db().await;
        db.append_message(&MessageLogEntry::inbound("a", "Hola", at(10, 0, 0), "SRR", 0))
            .await
            .unwrap();
        db.append_message(&MessageLogEntry::outbound("a", "¡Hola!", at(10, 0, 1), "SRR", 1))
            .await
            .unwrap();
        db.append_message(&MessageLogEntry::inbound("a", "Sí", at(10, 5, 0), "SRR", 1))
            .await
            .unwrap();
        db.append_message(&MessageLogEntry::inbound("b", "otro", at(11, 0, 0), "SRR", 0))
            .await
            .unwrap();

        let history = db.history("a", 10).await.unwrap();
        let texts: Vec<&str> = history.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Sí", "¡Hola!", "Hola"]);
        assert_eq!(history[1].direction, Direction::Outbound);
        assert_eq!(history[1].step, 1);
        assert_eq!(history[2].timestamp, at(10, 0, 0));

        let limited = db.history("a", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn history_ties_break_by_insertion_order() {
        let db = test_db().await;
        let ts = at(9, 0, 0);
        db.append_message(&MessageLogEntry::inbound("a", "first", ts, "SRR", 0))
            .await
            .unwrap();
        db.append_message(&MessageLogEntry::outbound("a", "second", ts, "SRR", 1))
            .await
            .unwrap();

        let history = db.history("a", 10).await.unwrap();
        assert_eq!(history[0].text, "second");
        assert_eq!(history[1].text, "first");
    }

    #[tokio::test]
    async fn inbound_history_filters_direction() {
        let db = test_db().await;
        db.append_message(&MessageLogEntry::inbound("a", "Hola", at(10, 0, 0), "SRR", 0))
            .await
            .unwrap();
        db.append_message(&MessageLogEntry::outbound("a", "¡Hola!", at(10, 0, 1), "SRR", 1))
            .await
            .unwrap();

        let inbound = db.inbound_history("a", 5).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn append_returns_increasing_ids() {
        let db = test_db().await;
        let entry = MessageLogEntry::inbound("a", "x", at(8, 0, 0), "SRR", 0);
        let first = db.append_message(&entry).await.unwrap();
        let second = db.append_message(&entry).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_recorded() {
        let db = Arc::new(test_db().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                let entry = MessageLogEntry::inbound(
                    "a",
                    &format!("msg {i}"),
                    at(12, 0, 0) + Duration::seconds(i),
                    "SRR",
                    0,
                );
                db.append_message(&entry).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(db.history("a", 100).await.unwrap().len(), 20);
    }

    // ── Reminder tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn reminders_are_not_deduplicated() {
        let db = test_db().await;
        let date = NaiveDate::from_ymd_opt(2025, 5, 17).unwrap();
        db.create_reminder("a", date, 8).await.unwrap();
        db.create_reminder("a", date, 8).await.unwrap();
        db.create_reminder("b", date, 2).await.unwrap();

        let reminders = db.reminders_for("a").await.unwrap();
        assert_eq!(reminders.len(), 2);
        assert_eq!(reminders[0].target_date, date);
        assert_eq!(reminders[0].weeks, 8);
        assert_eq!(reminders[0].user_id, "a");
    }

    // ── Administration ──────────────────────────────────────────────

    #[tokio::test]
    async fn reset_all_empties_every_store_and_is_repeatable() {
        let db = test_db().await;
        db.upsert_profile("a", &ProfileUpdate::default())
            .await
            .unwrap();
        db.append_message(&MessageLogEntry::inbound("a", "Hola", at(10, 0, 0), "SRR", 0))
            .await
            .unwrap();
        db.create_reminder("a", NaiveDate::from_ymd_opt(2025, 5, 17).unwrap(), 8)
            .await
            .unwrap();

        db.reset_all().await.unwrap();
        db.reset_all().await.unwrap();

        assert!(db.get_profile("a").await.unwrap().is_none());
        assert!(db.history("a", 10).await.unwrap().is_empty());
        assert!(db.reminders_for("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("petbot.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        db.upsert_profile("a", &ProfileUpdate::default())
            .await
            .unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = format_timestamp(&at(1, 2, 3));
        let b = format_timestamp(&(at(1, 2, 3) + Duration::milliseconds(500)));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&a), at(1, 2, 3));
    }
}
