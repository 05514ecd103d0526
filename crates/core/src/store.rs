use chrono::NaiveDate;

use crate::error::Result;
use crate::model::{
    CheckSession, DocumentId, DuplicateGroup, GroupMember, GroupWrite, NewSession, SessionId,
    SessionStatus, UsageEntry,
};

/// Read-only access to the embedded corpus.
pub trait DocumentSource {
    /// Ids in a stable order; a check indexes into this list with its cursor.
    fn document_ids(&self) -> Result<Vec<DocumentId>>;
    fn vector(&self, id: &DocumentId) -> Result<Option<Vec<f32>>>;
    /// Plain text handed to the judge. Documents without text are never judged.
    fn text(&self, id: &DocumentId) -> Result<Option<String>>;
}

pub trait CheckStore {
    fn create_session(&self, new: &NewSession) -> Result<CheckSession>;
    fn session(&self, id: SessionId) -> Result<Option<CheckSession>>;
    fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        documents_checked: Option<usize>,
        groups_found: Option<usize>,
    ) -> Result<()>;
    fn save_progress(
        &self,
        id: SessionId,
        cursor: usize,
        documents_checked: usize,
        groups_found: usize,
    ) -> Result<()>;
    /// Writes are keyed by `(session, reference_cursor)`: repeating a write returns the
    /// existing group with `inserted == false`.
    fn create_group(
        &self,
        session_id: SessionId,
        reference_cursor: usize,
        members: &[GroupMember],
    ) -> Result<GroupWrite>;
    fn groups(&self, session_id: SessionId) -> Result<Vec<DuplicateGroup>>;
}

pub trait ErrorLog {
    fn log_error(&self, document: Option<&DocumentId>, message: &str) -> Result<()>;
}

pub trait UsageLedger {
    fn month_cost(&self, year: i32, month: u32) -> Result<f64>;
    fn record_usage(&self, entry: &UsageEntry) -> Result<()>;
    fn last_alert_date(&self) -> Result<Option<NaiveDate>>;
    fn set_last_alert_date(&self, date: NaiveDate) -> Result<()>;
}
