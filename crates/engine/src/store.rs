use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

use dupcheck_core::{
    CheckKind, CheckSession, CheckStore, ComparisonMode, DocumentId, DocumentSource, DupError,
    DuplicateGroup, ErrorLog, GroupMember, GroupWrite, NewSession, SessionId, SessionStatus,
    UsageEntry, UsageLedger,
};

use crate::text::plain_text;

const LAST_ALERT_KEY: &str = "budget_last_alert_date";
pub const MIN_USAGE_RETENTION_DAYS: i64 = 30;

/// SQLite-backed documents, checks, groups, usage ledger, settings and error log.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct DocumentInsert {
    pub id: DocumentId,
    pub title: Option<String>,
    pub body: Option<String>,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub id: i64,
    pub document_id: Option<DocumentId>,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePeriod {
    Day,
    Month,
    Year,
}

impl UsagePeriod {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "day" | "daily" => Some(UsagePeriod::Day),
            "month" | "monthly" => Some(UsagePeriod::Month),
            "year" | "yearly" => Some(UsagePeriod::Year),
            _ => None,
        }
    }

    /// Length of the `YYYY-MM-DD` prefix that identifies a period.
    fn key_len(&self) -> i64 {
        match self {
            UsagePeriod::Day => 10,
            UsagePeriod::Month => 7,
            UsagePeriod::Year => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub period: String,
    pub tokens: u64,
    pub cost: f64,
}

struct SessionRow {
    id: i64,
    threshold: f64,
    mode: String,
    kind: String,
    document_ids: String,
    cursor: i64,
    status: String,
    documents_checked: i64,
    groups_found: i64,
    batch_ref: Option<String>,
    created_at: String,
}

const SESSION_COLUMNS: &str = "id, threshold, mode, kind, document_ids, cursor, status, \
    documents_checked, groups_found, batch_ref, created_at";

impl SessionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            threshold: row.get(1)?,
            mode: row.get(2)?,
            kind: row.get(3)?,
            document_ids: row.get(4)?,
            cursor: row.get(5)?,
            status: row.get(6)?,
            documents_checked: row.get(7)?,
            groups_found: row.get(8)?,
            batch_ref: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_session(self) -> dupcheck_core::Result<CheckSession> {
        let corrupt = |what: &str| DupError::Persistence(format!("check {} has invalid {what}", self.id));
        let mode = ComparisonMode::from_str(&self.mode).ok_or_else(|| corrupt("mode"))?;
        let status = SessionStatus::from_str(&self.status).ok_or_else(|| corrupt("status"))?;
        let kind = CheckKind::from_str(&self.kind).ok_or_else(|| corrupt("kind"))?;
        let document_ids: Vec<DocumentId> =
            serde_json::from_str(&self.document_ids).map_err(|_| corrupt("document list"))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|_| corrupt("timestamp"))?
            .with_timezone(&Utc);
        Ok(CheckSession {
            id: self.id,
            threshold: self.threshold as f32,
            mode,
            document_ids,
            cursor: self.cursor.max(0) as usize,
            status,
            documents_checked: self.documents_checked.max(0) as usize,
            groups_found: self.groups_found.max(0) as usize,
            external_batch_ref: self.batch_ref,
            kind,
            created_at,
        })
    }
}

fn persistence(err: rusqlite::Error) -> DupError {
    DupError::persistence(err)
}

fn decode_vector(blob: &[u8]) -> dupcheck_core::Result<Vec<f32>> {
    if blob.len() % std::mem::size_of::<f32>() != 0 {
        return Err(DupError::Persistence(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            blob.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec::<u8, f32>(blob))
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                title TEXT,
                body TEXT,
                vector BLOB,
                dims INTEGER,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                threshold REAL NOT NULL,
                mode TEXT NOT NULL,
                kind TEXT NOT NULL,
                document_ids TEXT NOT NULL,
                cursor INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                documents_checked INTEGER NOT NULL DEFAULT 0,
                groups_found INTEGER NOT NULL DEFAULT 0,
                batch_ref TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS dup_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                check_id INTEGER NOT NULL,
                reference_cursor INTEGER NOT NULL,
                reference_id TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(check_id, reference_cursor),
                FOREIGN KEY(check_id) REFERENCES checks(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS dup_group_members (
                group_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                document_id TEXT NOT NULL,
                score REAL NOT NULL,
                PRIMARY KEY(group_id, position),
                FOREIGN KEY(group_id) REFERENCES dup_groups(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT,
                tokens INTEGER NOT NULL,
                cost REAL NOT NULL,
                operation TEXT NOT NULL,
                batch_ref TEXT,
                token_kind TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS usage_daily (
                day TEXT PRIMARY KEY,
                tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS error_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_groups_check ON dup_groups(check_id);
            CREATE INDEX IF NOT EXISTS idx_usage_recorded ON usage_log(recorded_at);
            "#,
        )?;
        Ok(())
    }

    /// Inserts or replaces a document. Replacing keeps its position in the check order.
    pub fn import_document(&self, doc: &DocumentInsert) -> Result<()> {
        let conn = self.conn.lock();
        let blob = doc
            .vector
            .as_ref()
            .map(|v| bytemuck::cast_slice::<f32, u8>(v).to_vec());
        let dims = doc.vector.as_ref().map(|v| v.len() as i64);
        conn.execute(
            r#"
            INSERT INTO documents (id, title, body, vector, dims) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                vector = excluded.vector,
                dims = excluded.dims,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![doc.id.as_str(), doc.title, doc.body, blob, dims],
        )?;
        Ok(())
    }

    pub fn document_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE vector IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Most recent checks first.
    pub fn recent_sessions(&self, limit: usize, offset: usize) -> Result<Vec<CheckSession>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM checks ORDER BY id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], SessionRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter()
            .map(|row| row.into_session().map_err(anyhow::Error::from))
            .collect()
    }

    /// Deletes a finished check with its groups. Returns false for unknown ids.
    pub fn delete_session(&self, id: SessionId) -> dupcheck_core::Result<bool> {
        let Some(session) = self.session(id)? else {
            return Ok(false);
        };
        if session.status == SessionStatus::Processing {
            return Err(DupError::invalid(format!(
                "check {id} is still processing; cancel it before deleting"
            )));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(persistence)?;
        tx.execute(
            "DELETE FROM dup_group_members WHERE group_id IN (SELECT id FROM dup_groups WHERE check_id = ?1)",
            params![id],
        )
        .map_err(persistence)?;
        tx.execute("DELETE FROM dup_groups WHERE check_id = ?1", params![id])
            .map_err(persistence)?;
        tx.execute("DELETE FROM checks WHERE id = ?1", params![id])
            .map_err(persistence)?;
        tx.commit().map_err(persistence)?;
        Ok(true)
    }

    pub fn usage_statistics(&self, period: UsagePeriod, limit: usize) -> Result<Vec<UsageSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT substr(day, 1, ?1) AS period, SUM(tokens), SUM(cost)
            FROM usage_daily
            GROUP BY period
            ORDER BY period DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![period.key_len(), limit as i64], |row| {
                Ok(UsageSummary {
                    period: row.get(0)?,
                    tokens: row.get::<_, i64>(1)?.max(0) as u64,
                    cost: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drops detailed ledger rows older than `days` (at least 30). Daily totals are kept,
    /// so monthly spend is unaffected.
    pub fn cleanup_usage(&self, days: i64) -> Result<usize> {
        self.cleanup_usage_before(Utc::now(), days)
    }

    pub fn cleanup_usage_before(&self, now: DateTime<Utc>, days: i64) -> Result<usize> {
        let days = days.max(MIN_USAGE_RETENTION_DAYS);
        let cutoff = Duration::try_days(days)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| DupError::invalid(format!("retention of {days} days is out of range")))?
            .to_rfc3339();
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM usage_log WHERE recorded_at < ?1", params![cutoff])?;
        Ok(removed)
    }

    pub fn usage_entry_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn error_log(&self, limit: usize, offset: usize) -> Result<Vec<ErrorEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, document_id, message, created_at FROM error_log ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                Ok(ErrorEntry {
                    id: row.get(0)?,
                    document_id: row.get::<_, Option<String>>(1)?.map(DocumentId::from),
                    message: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn clear_errors(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM error_log", [])?)
    }

    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn read_group_members(conn: &Connection, group_id: i64) -> rusqlite::Result<Vec<GroupMember>> {
        let mut stmt = conn.prepare(
            "SELECT document_id, score FROM dup_group_members WHERE group_id = ?1 ORDER BY position",
        )?;
        let members = stmt
            .query_map([group_id], |row| {
                Ok(GroupMember {
                    document_id: DocumentId::from(row.get::<_, String>(0)?),
                    score: row.get::<_, f64>(1)? as f32,
                })
            })?
            .collect();
        members
    }
}

impl DocumentSource for SqliteStore {
    fn document_ids(&self) -> dupcheck_core::Result<Vec<DocumentId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM documents WHERE vector IS NOT NULL ORDER BY seq")
            .map_err(persistence)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(persistence)?
            .map(|id| id.map(DocumentId::from))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence)?;
        Ok(ids)
    }

    fn vector(&self, id: &DocumentId) -> dupcheck_core::Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT vector FROM documents WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence)?;
        match blob.flatten() {
            Some(bytes) => decode_vector(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn text(&self, id: &DocumentId) -> dupcheck_core::Result<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT title, body FROM documents WHERE id = ?1",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(persistence)?;
        let Some((title, body)) = row else {
            return Ok(None);
        };
        let body = body.map(|b| plain_text(&b)).unwrap_or_default();
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(match title.filter(|t| !t.trim().is_empty()) {
            Some(title) => format!("{}\n\n{}", title.trim(), body),
            None => body,
        }))
    }
}

impl CheckStore for SqliteStore {
    fn create_session(&self, new: &NewSession) -> dupcheck_core::Result<CheckSession> {
        let ids = serde_json::to_string(&new.document_ids)
            .map_err(|err| DupError::persistence(err))?;
        let now = Utc::now();
        let stamp = now.to_rfc3339();
        let id = {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO checks (threshold, mode, kind, document_ids, status, batch_ref, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
                params![
                    new.threshold as f64,
                    new.mode.as_str(),
                    new.kind.as_str(),
                    ids,
                    SessionStatus::Processing.as_str(),
                    new.external_batch_ref,
                    stamp
                ],
            )
            .map_err(persistence)?;
            conn.last_insert_rowid()
        };
        self.session(id)?
            .ok_or_else(|| DupError::Persistence(format!("check {id} vanished after insert")))
    }

    fn session(&self, id: SessionId) -> dupcheck_core::Result<Option<CheckSession>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM checks WHERE id = ?1"),
                [id],
                SessionRow::read,
            )
            .optional()
            .map_err(persistence)?
        };
        row.map(SessionRow::into_session).transpose()
    }

    fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        documents_checked: Option<usize>,
        groups_found: Option<usize>,
    ) -> dupcheck_core::Result<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                r#"
                UPDATE checks SET
                    status = ?2,
                    documents_checked = COALESCE(?3, documents_checked),
                    groups_found = COALESCE(?4, groups_found),
                    updated_at = ?5
                WHERE id = ?1
                "#,
                params![
                    id,
                    status.as_str(),
                    documents_checked.map(|v| v as i64),
                    groups_found.map(|v| v as i64),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(persistence)?;
        if changed == 0 {
            return Err(DupError::SessionNotFound(id));
        }
        Ok(())
    }

    fn save_progress(
        &self,
        id: SessionId,
        cursor: usize,
        documents_checked: usize,
        groups_found: usize,
    ) -> dupcheck_core::Result<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE checks SET cursor = ?2, documents_checked = ?3, groups_found = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    id,
                    cursor as i64,
                    documents_checked as i64,
                    groups_found as i64,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(persistence)?;
        if changed == 0 {
            return Err(DupError::SessionNotFound(id));
        }
        Ok(())
    }

    fn create_group(
        &self,
        session_id: SessionId,
        reference_cursor: usize,
        members: &[GroupMember],
    ) -> dupcheck_core::Result<GroupWrite> {
        let reference = members
            .first()
            .ok_or_else(|| DupError::invalid("a group needs at least its reference document"))?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(persistence)?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM dup_groups WHERE check_id = ?1 AND reference_cursor = ?2",
                params![session_id, reference_cursor as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence)?;
        if let Some(group_id) = existing {
            return Ok(GroupWrite {
                group_id,
                inserted: false,
            });
        }
        tx.execute(
            "INSERT INTO dup_groups (check_id, reference_cursor, reference_id) VALUES (?1, ?2, ?3)",
            params![session_id, reference_cursor as i64, reference.document_id.as_str()],
        )
        .map_err(persistence)?;
        let group_id = tx.last_insert_rowid();
        for (position, member) in members.iter().enumerate() {
            tx.execute(
                "INSERT INTO dup_group_members (group_id, position, document_id, score) VALUES (?1, ?2, ?3, ?4)",
                params![
                    group_id,
                    position as i64,
                    member.document_id.as_str(),
                    member.score as f64
                ],
            )
            .map_err(persistence)?;
        }
        tx.commit().map_err(persistence)?;
        Ok(GroupWrite {
            group_id,
            inserted: true,
        })
    }

    fn groups(&self, session_id: SessionId) -> dupcheck_core::Result<Vec<DuplicateGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, reference_cursor FROM dup_groups WHERE check_id = ?1 ORDER BY id")
            .map_err(persistence)?;
        let heads = stmt
            .query_map([session_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(persistence)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence)?;
        let mut groups = Vec::with_capacity(heads.len());
        for (group_id, cursor) in heads {
            let members = Self::read_group_members(&conn, group_id).map_err(persistence)?;
            groups.push(DuplicateGroup {
                session_id,
                group_id,
                reference_cursor: cursor.max(0) as usize,
                members,
            });
        }
        Ok(groups)
    }
}

impl ErrorLog for SqliteStore {
    fn log_error(&self, document: Option<&DocumentId>, message: &str) -> dupcheck_core::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO error_log (document_id, message, created_at) VALUES (?1, ?2, ?3)",
            params![document.map(|d| d.as_str()), message, Utc::now().to_rfc3339()],
        )
        .map_err(persistence)?;
        Ok(())
    }
}

impl UsageLedger for SqliteStore {
    fn month_cost(&self, year: i32, month: u32) -> dupcheck_core::Result<f64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(cost), 0.0) FROM usage_daily WHERE substr(day, 1, 7) = ?1",
            [format!("{year:04}-{month:02}")],
            |row| row.get(0),
        )
        .map_err(persistence)
    }

    fn record_usage(&self, entry: &UsageEntry) -> dupcheck_core::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(persistence)?;
        tx.execute(
            r#"
            INSERT INTO usage_log (document_id, tokens, cost, operation, batch_ref, token_kind, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.document_id.as_ref().map(|d| d.as_str()),
                entry.tokens as i64,
                entry.cost,
                entry.operation,
                entry.batch_ref,
                entry.token_kind.as_str(),
                entry.recorded_at.to_rfc3339()
            ],
        )
        .map_err(persistence)?;
        tx.execute(
            r#"
            INSERT INTO usage_daily (day, tokens, cost) VALUES (?1, ?2, ?3)
            ON CONFLICT(day) DO UPDATE SET
                tokens = tokens + excluded.tokens,
                cost = cost + excluded.cost
            "#,
            params![
                entry.recorded_at.date_naive().to_string(),
                entry.tokens as i64,
                entry.cost
            ],
        )
        .map_err(persistence)?;
        tx.commit().map_err(persistence)
    }

    fn last_alert_date(&self) -> dupcheck_core::Result<Option<NaiveDate>> {
        let value = self
            .setting(LAST_ALERT_KEY)
            .map_err(anyhow_persistence)?;
        Ok(value.and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok()))
    }

    fn set_last_alert_date(&self, date: NaiveDate) -> dupcheck_core::Result<()> {
        self.set_setting(LAST_ALERT_KEY, &date.format("%Y-%m-%d").to_string())
            .map_err(anyhow_persistence)
    }
}

impl SqliteStore {
    /// Reads a check that must exist.
    pub fn require_session(&self, id: SessionId) -> dupcheck_core::Result<CheckSession> {
        self.session(id)?.ok_or(DupError::SessionNotFound(id))
    }
}

fn anyhow_persistence(err: anyhow::Error) -> DupError {
    match err.downcast::<DupError>() {
        Ok(dup) => dup,
        Err(other) => DupError::Persistence(format!("{other:#}")),
    }
}
