//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Idempotency keys are
//! enforced with UNIQUE constraints and `ON CONFLICT DO NOTHING` inserts.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::funnel::model::{
    AssignmentHistoryEntry, FunnelStage, Priority, Request, RequestFilter, RequestStats,
    RequestUpdate,
};
use crate::pipeline::types::{
    AttachmentRecord, ExtractedData, ForwardingAttempt, ForwardingStats, ForwardingStatus,
    InboundMessage, MessageFilter, MessageStats, MessageStatus,
};
use crate::store::migrations;
use crate::store::traits::Database;

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

        let backend = Self::from_database(db).await?;
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
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text ordering is time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
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

fn opt_int(n: Option<u64>) -> libsql::Value {
    match n.and_then(|n| i64::try_from(n).ok()) {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Collect every parseable row, skipping (and logging) malformed ones.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: fn(&libsql::Row) -> Result<T, libsql::Error>,
    what: &str,
) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(item) => items.push(item),
            Err(e) => warn!("Skipping {what} row: {e}"),
        }
    }
    items
}

/// Read the first row, if any.
async fn first_row<T>(
    mut rows: libsql::Rows,
    map: fn(&libsql::Row) -> Result<T, libsql::Error>,
    op: &str,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => map(&row)
            .map(Some)
            .map_err(|e| DatabaseError::Query(format!("{op}: row parse: {e}"))),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

/// Read `(label, count)` pairs from a GROUP BY query.
async fn collect_counts(mut rows: libsql::Rows) -> Vec<(String, i64)> {
    let mut counts = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        if let (Ok(label), Ok(count)) = (row.get::<String>(0), row.get::<i64>(1)) {
            counts.push((label, count));
        }
    }
    counts
}

/// Map a libsql Row to an InboundMessage.
///
/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<InboundMessage, libsql::Error> {
    let recipients_json: String = row.get(5)?;
    let received_str: String = row.get(9)?;
    let status_str: String = row.get(10)?;
    let created_str: String = row.get(13)?;
    let updated_str: String = row.get(14)?;

    Ok(InboundMessage {
        id: row.get(0)?,
        external_id: row.get(1)?,
        account: row.get(2)?,
        sender_address: row.get(3)?,
        sender_name: row.get(4).ok(),
        recipients: serde_json::from_str(&recipients_json).unwrap_or_default(),
        subject: row.get(6).ok(),
        body_text: row.get(7)?,
        body_html: row.get(8).ok(),
        received_at: parse_datetime(&received_str),
        status: MessageStatus::parse(&status_str).unwrap_or(MessageStatus::Pending),
        in_reply_to: row.get(11).ok(),
        references: row.get(12).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_attachment(row: &libsql::Row) -> Result<AttachmentRecord, libsql::Error> {
    let size: i64 = row.get(4)?;
    let created_str: String = row.get(6)?;
    Ok(AttachmentRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        filename: row.get(2)?,
        content_type: row.get(3)?,
        size: u64::try_from(size).unwrap_or(0),
        path: row.get(5)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_extracted(row: &libsql::Row) -> Result<ExtractedData, libsql::Error> {
    let specs_json: String = row.get(4)?;
    let created_str: String = row.get(7)?;
    Ok(ExtractedData {
        id: row.get(0)?,
        message_id: row.get(1)?,
        product_name: row.get(2).ok(),
        quantity: row
            .get::<i64>(3)
            .ok()
            .and_then(|q| u64::try_from(q).ok()),
        specifications: serde_json::from_str::<BTreeMap<String, String>>(&specs_json)
            .unwrap_or_default(),
        confidence: row.get(5)?,
        raw: row.get(6)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<ForwardingAttempt, libsql::Error> {
    let status_str: String = row.get(3)?;
    let attempted_str: String = row.get(6)?;
    Ok(ForwardingAttempt {
        id: row.get(0)?,
        message_id: row.get(1)?,
        recipient: row.get(2)?,
        status: ForwardingStatus::parse(&status_str),
        transport_message_id: row.get(4).ok(),
        error: row.get(5).ok(),
        attempted_at: parse_datetime(&attempted_str),
    })
}

/// Map a libsql Row to a Request.
///
/// Column order matches REQUEST_COLUMNS.
fn row_to_request(row: &libsql::Row) -> Result<Request, libsql::Error> {
    let stage_str: String = row.get(9)?;
    let priority_str: String = row.get(10)?;
    let created_str: String = row.get(14)?;
    let updated_str: String = row.get(15)?;

    Ok(Request {
        id: row.get(0)?,
        code: row.get(1)?,
        message_id: row.get(2).ok(),
        customer_email: row.get(3)?,
        customer_name: row.get(4).ok(),
        subject: row.get(5).ok(),
        requirements: row.get(6)?,
        original_content: row.get(7)?,
        source: row.get(8)?,
        funnel_stage: stage_str.parse().unwrap_or(FunnelStage::New),
        priority: priority_str.parse().unwrap_or(Priority::Low),
        assigned_user_id: row.get(11).ok(),
        email_message_id: row.get(12).ok(),
        email_references: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_assignment(row: &libsql::Row) -> Result<AssignmentHistoryEntry, libsql::Error> {
    let created_str: String = row.get(6)?;
    Ok(AssignmentHistoryEntry {
        id: row.get(0)?,
        request_id: row.get(1)?,
        assigned_from: row.get(2).ok(),
        assigned_to: row.get(3)?,
        assigned_by: row.get(4)?,
        notes: row.get(5).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, external_id, account, sender_address, sender_name, recipients, subject, body_text, body_html, received_at, status, in_reply_to, message_references, created_at, updated_at";

const ATTACHMENT_COLUMNS: &str = "id, message_id, filename, content_type, size, path, created_at";

const EXTRACTED_COLUMNS: &str =
    "id, message_id, product_name, quantity, specifications, confidence, raw, created_at";

const FORWARDING_COLUMNS: &str =
    "id, message_id, recipient, status, transport_message_id, error, attempted_at";

const REQUEST_COLUMNS: &str = "id, code, message_id, customer_email, customer_name, subject, requirements, original_content, source, funnel_stage, priority, assigned_user_id, email_message_id, email_references, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str =
    "id, request_id, assigned_from, assigned_to, assigned_by, notes, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &InboundMessage) -> Result<bool, DatabaseError> {
        let recipients = to_json(&message.recipients)?;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO messages (id, external_id, account, sender_address, sender_name,
                    recipients, subject, body_text, body_html, received_at, status,
                    in_reply_to, message_references, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    message.id.as_str(),
                    message.external_id.as_str(),
                    message.account.as_str(),
                    message.sender_address.as_str(),
                    opt_text(message.sender_name.as_deref()),
                    recipients,
                    opt_text(message.subject.as_deref()),
                    message.body_text.as_str(),
                    opt_text(message.body_html.as_deref()),
                    ts(&message.received_at),
                    message.status.as_str(),
                    opt_text(message.in_reply_to.as_deref()),
                    opt_text(message.references.as_deref()),
                    ts(&message.created_at),
                    ts(&message.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(
            id = %message.id,
            external_id = %message.external_id,
            inserted = inserted > 0,
            "Message insert"
        );
        Ok(inserted > 0)
    }

    async fn get_message(&self, id: &str) -> Result<Option<InboundMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;
        first_row(rows, row_to_message, "get_message").await
    }

    async fn find_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<InboundMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_message_by_external_id: {e}")))?;
        first_row(rows, row_to_message, "find_message_by_external_id").await
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_message_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        debug!(id = id, status = status.as_str(), "Message status updated");
        Ok(())
    }

    async fn list_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<InboundMessage>, DatabaseError> {
        let mut conditions = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(account) = &filter.account {
            values.push(libsql::Value::Text(account.clone()));
            conditions.push(format!("account = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", values.len()));
        }
        if let Some(start) = &filter.start_date {
            values.push(libsql::Value::Text(ts(start)));
            conditions.push(format!("received_at >= ?{}", values.len()));
        }
        if let Some(end) = &filter.end_date {
            values.push(libsql::Value::Text(ts(end)));
            conditions.push(format!("received_at <= ?{}", values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(100) as i64;
        values.push(libsql::Value::Integer(limit));
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages {where_clause} ORDER BY received_at DESC LIMIT ?{}",
            values.len()
        );

        let rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;
        Ok(collect_rows(rows, row_to_message, "message").await)
    }

    async fn message_stats(&self) -> Result<MessageStats, DatabaseError> {
        let conn = self.conn();
        let status_rows = conn
            .query("SELECT status, COUNT(*) FROM messages GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("message_stats: {e}")))?;
        let account_rows = conn
            .query("SELECT account, COUNT(*) FROM messages GROUP BY account", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("message_stats: {e}")))?;

        let mut stats = MessageStats::default();
        for (status, count) in collect_counts(status_rows).await {
            stats.total += count;
            match MessageStatus::parse(&status) {
                Some(MessageStatus::Pending) => stats.pending += count,
                Some(MessageStatus::Processed) => stats.processed += count,
                None => {}
            }
        }
        stats.by_account = collect_counts(account_rows).await.into_iter().collect::<HashMap<_, _>>();
        Ok(stats)
    }

    // ── Attachments ─────────────────────────────────────────────────

    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO attachments ({ATTACHMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    attachment.id.as_str(),
                    attachment.message_id.as_str(),
                    attachment.filename.as_str(),
                    attachment.content_type.as_str(),
                    i64::try_from(attachment.size).unwrap_or(i64::MAX),
                    attachment.path.as_str(),
                    ts(&attachment.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_attachment: {e}")))?;
        Ok(())
    }

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1 ORDER BY created_at ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attachments: {e}")))?;
        Ok(collect_rows(rows, row_to_attachment, "attachment").await)
    }

    // ── Extracted data ──────────────────────────────────────────────

    async fn insert_extracted_data(&self, data: &ExtractedData) -> Result<bool, DatabaseError> {
        let specs = to_json(&data.specifications)?;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO extracted_data ({EXTRACTED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(message_id) DO NOTHING"
                ),
                params![
                    data.id.as_str(),
                    data.message_id.as_str(),
                    opt_text(data.product_name.as_deref()),
                    opt_int(data.quantity),
                    specs,
                    data.confidence,
                    data.raw.as_str(),
                    ts(&data.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_extracted_data: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_extracted_data(
        &self,
        message_id: &str,
    ) -> Result<Option<ExtractedData>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {EXTRACTED_COLUMNS} FROM extracted_data WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_extracted_data: {e}")))?;
        first_row(rows, row_to_extracted, "get_extracted_data").await
    }

    // ── Forwarding ──────────────────────────────────────────────────

    async fn has_successful_forward(
        &self,
        message_id: &str,
        recipient: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM forwarding_attempts
                 WHERE message_id = ?1 AND recipient = ?2 AND status = 'success'",
                params![message_id, recipient],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_successful_forward: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("has_successful_forward: {e}"))),
        }
    }

    async fn record_forwarding_attempt(
        &self,
        attempt: &ForwardingAttempt,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO forwarding_attempts ({FORWARDING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    attempt.id.as_str(),
                    attempt.message_id.as_str(),
                    attempt.recipient.as_str(),
                    attempt.status.as_str(),
                    opt_text(attempt.transport_message_id.as_deref()),
                    opt_text(attempt.error.as_deref()),
                    ts(&attempt.attempted_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_forwarding_attempt: {e}")))?;
        Ok(())
    }

    async fn list_forwarding_attempts(
        &self,
        message_id: &str,
    ) -> Result<Vec<ForwardingAttempt>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FORWARDING_COLUMNS} FROM forwarding_attempts WHERE message_id = ?1 ORDER BY attempted_at ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_forwarding_attempts: {e}")))?;
        Ok(collect_rows(rows, row_to_attempt, "forwarding attempt").await)
    }

    async fn forwarding_stats(&self) -> Result<ForwardingStats, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM forwarding_attempts GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("forwarding_stats: {e}")))?;

        let (mut successful, mut failed) = (0, 0);
        for (status, count) in collect_counts(rows).await {
            match ForwardingStatus::parse(&status) {
                ForwardingStatus::Success => successful += count,
                ForwardingStatus::Failed => failed += count,
            }
        }
        Ok(ForwardingStats::new(successful, failed))
    }

    // ── Requests ────────────────────────────────────────────────────

    async fn next_sequence(&self, name: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO sequences (name, value) VALUES (?1, 1)
                 ON CONFLICT(name) DO UPDATE SET value = value + 1
                 RETURNING value",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("next_sequence: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("next_sequence: row parse: {e}"))),
            Ok(None) => Err(DatabaseError::Query(format!(
                "next_sequence: no value returned for '{name}'"
            ))),
            Err(e) => Err(DatabaseError::Query(format!("next_sequence: {e}"))),
        }
    }

    async fn insert_request(&self, request: &Request) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO requests ({REQUEST_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                     ON CONFLICT(message_id) DO NOTHING"
                ),
                params![
                    request.id.as_str(),
                    request.code.as_str(),
                    opt_text(request.message_id.as_deref()),
                    request.customer_email.as_str(),
                    opt_text(request.customer_name.as_deref()),
                    opt_text(request.subject.as_deref()),
                    request.requirements.as_str(),
                    request.original_content.as_str(),
                    request.source.as_str(),
                    request.funnel_stage.as_str(),
                    request.priority.as_str(),
                    opt_text(request.assigned_user_id.as_deref()),
                    opt_text(request.email_message_id.as_deref()),
                    opt_text(request.email_references.as_deref()),
                    ts(&request.created_at),
                    ts(&request.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_request: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_request: {e}")))?;
        first_row(rows, row_to_request, "get_request").await
    }

    async fn find_request_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<Request>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_request_by_message_id: {e}")))?;
        first_row(rows, row_to_request, "find_request_by_message_id").await
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, DatabaseError> {
        let mut conditions = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(stage) = filter.funnel_stage {
            values.push(libsql::Value::Text(stage.as_str().to_string()));
            conditions.push(format!("funnel_stage = ?{}", values.len()));
        }
        if let Some(assignee) = &filter.assigned_user_id {
            values.push(libsql::Value::Text(assignee.clone()));
            conditions.push(format!("assigned_user_id = ?{}", values.len()));
        }
        if let Some(priority) = filter.priority {
            values.push(libsql::Value::Text(priority.as_str().to_string()));
            conditions.push(format!("priority = ?{}", values.len()));
        }
        if let Some(email) = &filter.customer_email {
            values.push(libsql::Value::Text(format!("%{email}%")));
            conditions.push(format!("customer_email LIKE ?{}", values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        values.push(libsql::Value::Integer(filter.limit() as i64));
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests {where_clause} ORDER BY created_at DESC, code DESC LIMIT ?{}",
            values.len()
        );

        let rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("list_requests: {e}")))?;
        Ok(collect_rows(rows, row_to_request, "request").await)
    }

    async fn update_request_stage(
        &self,
        id: &str,
        stage: FunnelStage,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE requests SET funnel_stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![stage.as_str(), ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_request_stage: {e}")))?;
        Ok(updated > 0)
    }

    async fn assign_request(&self, id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE requests SET assigned_user_id = ?1, funnel_stage = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![user_id, FunnelStage::Assigned.as_str(), ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("assign_request: {e}")))?;
        Ok(updated > 0)
    }

    async fn update_request_fields(
        &self,
        id: &str,
        update: &RequestUpdate,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE requests SET
                    requirements = COALESCE(?1, requirements),
                    priority = COALESCE(?2, priority),
                    funnel_stage = COALESCE(?3, funnel_stage),
                    updated_at = ?4
                 WHERE id = ?5",
                params![
                    opt_text(update.requirements.as_deref()),
                    opt_text(update.priority.map(|p| p.as_str())),
                    opt_text(update.funnel_stage.map(|s| s.as_str())),
                    ts(&Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_request_fields: {e}")))?;
        Ok(updated > 0)
    }

    async fn request_stats(&self) -> Result<RequestStats, DatabaseError> {
        let conn = self.conn();
        let stage_rows = conn
            .query("SELECT funnel_stage, COUNT(*) FROM requests GROUP BY funnel_stage", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("request_stats: {e}")))?;
        let priority_rows = conn
            .query("SELECT priority, COUNT(*) FROM requests GROUP BY priority", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("request_stats: {e}")))?;

        let by_stage = collect_counts(stage_rows).await.into_iter().collect();
        let by_priority = collect_counts(priority_rows).await.into_iter().collect();
        Ok(RequestStats::from_counts(by_stage, by_priority))
    }

    // ── Assignment history ──────────────────────────────────────────

    async fn insert_assignment(
        &self,
        entry: &AssignmentHistoryEntry,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO assignment_history ({ASSIGNMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    entry.id.as_str(),
                    entry.request_id.as_str(),
                    opt_text(entry.assigned_from.as_deref()),
                    entry.assigned_to.as_str(),
                    entry.assigned_by.as_str(),
                    opt_text(entry.notes.as_deref()),
                    ts(&entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_assignment: {e}")))?;
        Ok(())
    }

    async fn list_assignments(
        &self,
        request_id: &str,
    ) -> Result<Vec<AssignmentHistoryEntry>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM assignment_history WHERE request_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![request_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_assignments: {e}")))?;
        Ok(collect_rows(rows, row_to_assignment, "assignment").await)
    }
}
