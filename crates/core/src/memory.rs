//! In-process implementations of the store traits, used by tests and dry runs.

use chrono::{Datelike, NaiveDate, Utc};
use parking_lot::Mutex;

use crate::error::{DupError, Result};
use crate::model::{
    CheckSession, DocumentId, DuplicateGroup, GroupMember, GroupWrite, NewSession, SessionId,
    SessionStatus, UsageEntry,
};
use crate::store::{CheckStore, DocumentSource, ErrorLog, UsageLedger};

#[derive(Debug, Clone)]
struct StoredDocument {
    id: DocumentId,
    vector: Option<Vec<f32>>,
    text: Option<String>,
}

#[derive(Default)]
pub struct MemoryDocuments {
    docs: Mutex<Vec<StoredDocument>>,
}

impl MemoryDocuments {
    /// Inserts or replaces a document while keeping its original position.
    pub fn insert(&self, id: impl Into<DocumentId>, vector: Vec<f32>, text: Option<&str>) {
        self.put(id.into(), Some(vector), text.map(str::to_string));
    }

    /// A document that has not been embedded yet.
    pub fn insert_unembedded(&self, id: impl Into<DocumentId>, text: Option<&str>) {
        self.put(id.into(), None, text.map(str::to_string));
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, id: DocumentId, vector: Option<Vec<f32>>, text: Option<String>) {
        let mut docs = self.docs.lock();
        let doc = StoredDocument { id, vector, text };
        match docs.iter_mut().find(|existing| existing.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
    }

    fn find<T>(&self, id: &DocumentId, f: impl FnOnce(&StoredDocument) -> Option<T>) -> Option<T> {
        self.docs.lock().iter().find(|doc| &doc.id == id).and_then(f)
    }
}

impl DocumentSource for MemoryDocuments {
    fn document_ids(&self) -> Result<Vec<DocumentId>> {
        Ok(self
            .docs
            .lock()
            .iter()
            .filter(|doc| doc.vector.is_some())
            .map(|doc| doc.id.clone())
            .collect())
    }

    fn vector(&self, id: &DocumentId) -> Result<Option<Vec<f32>>> {
        Ok(self.find(id, |doc| doc.vector.clone()))
    }

    fn text(&self, id: &DocumentId) -> Result<Option<String>> {
        Ok(self.find(id, |doc| doc.text.clone()))
    }
}

#[derive(Default)]
struct CheckState {
    sessions: Vec<CheckSession>,
    groups: Vec<DuplicateGroup>,
    errors: Vec<(Option<DocumentId>, String)>,
    next_group: i64,
}

/// Session, group and error storage behind one lock.
///
/// `fail_writes` makes every mutating call return a persistence error, which lets tests
/// observe that nothing advances when a write is lost.
#[derive(Default)]
pub struct MemoryCheckStore {
    state: Mutex<CheckState>,
    fail_writes: Mutex<bool>,
}

impl MemoryCheckStore {
    pub fn error_log(&self) -> Vec<(Option<DocumentId>, String)> {
        self.state.lock().errors.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(DupError::Persistence("store is read-only".to_string()));
        }
        Ok(())
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut CheckSession) -> T,
    ) -> Result<T> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let session = state
            .sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or(DupError::SessionNotFound(id))?;
        Ok(f(session))
    }
}

impl CheckStore for MemoryCheckStore {
    fn create_session(&self, new: &NewSession) -> Result<CheckSession> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let session = CheckSession {
            id: state.sessions.len() as SessionId + 1,
            threshold: new.threshold,
            mode: new.mode,
            document_ids: new.document_ids.clone(),
            cursor: 0,
            status: SessionStatus::Processing,
            documents_checked: 0,
            groups_found: 0,
            external_batch_ref: new.external_batch_ref.clone(),
            kind: new.kind,
            created_at: Utc::now(),
        };
        state.sessions.push(session.clone());
        Ok(session)
    }

    fn session(&self, id: SessionId) -> Result<Option<CheckSession>> {
        Ok(self
            .state
            .lock()
            .sessions
            .iter()
            .find(|session| session.id == id)
            .cloned())
    }

    fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        documents_checked: Option<usize>,
        groups_found: Option<usize>,
    ) -> Result<()> {
        self.with_session(id, |session| {
            session.status = status;
            if let Some(checked) = documents_checked {
                session.documents_checked = checked;
            }
            if let Some(groups) = groups_found {
                session.groups_found = groups;
            }
        })
    }

    fn save_progress(
        &self,
        id: SessionId,
        cursor: usize,
        documents_checked: usize,
        groups_found: usize,
    ) -> Result<()> {
        self.with_session(id, |session| {
            session.cursor = cursor;
            session.documents_checked = documents_checked;
            session.groups_found = groups_found;
        })
    }

    fn create_group(
        &self,
        session_id: SessionId,
        reference_cursor: usize,
        members: &[GroupMember],
    ) -> Result<GroupWrite> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if let Some(existing) = state
            .groups
            .iter()
            .find(|g| g.session_id == session_id && g.reference_cursor == reference_cursor)
        {
            return Ok(GroupWrite {
                group_id: existing.group_id,
                inserted: false,
            });
        }
        state.next_group += 1;
        let group_id = state.next_group;
        state.groups.push(DuplicateGroup {
            session_id,
            group_id,
            reference_cursor,
            members: members.to_vec(),
        });
        Ok(GroupWrite {
            group_id,
            inserted: true,
        })
    }

    fn groups(&self, session_id: SessionId) -> Result<Vec<DuplicateGroup>> {
        Ok(self
            .state
            .lock()
            .groups
            .iter()
            .filter(|g| g.session_id == session_id)
            .cloned()
            .collect())
    }
}

impl ErrorLog for MemoryCheckStore {
    fn log_error(&self, document: Option<&DocumentId>, message: &str) -> Result<()> {
        self.state
            .lock()
            .errors
            .push((document.cloned(), message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<UsageEntry>>,
    last_alert: Mutex<Option<NaiveDate>>,
}

impl MemoryLedger {
    pub fn push(&self, entry: UsageEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<UsageEntry> {
        self.entries.lock().clone()
    }
}

impl UsageLedger for MemoryLedger {
    fn month_cost(&self, year: i32, month: u32) -> Result<f64> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.recorded_at.year() == year && e.recorded_at.month() == month)
            .map(|e| e.cost)
            .sum())
    }

    fn record_usage(&self, entry: &UsageEntry) -> Result<()> {
        self.push(entry.clone());
        Ok(())
    }

    fn last_alert_date(&self) -> Result<Option<NaiveDate>> {
        Ok(*self.last_alert.lock())
    }

    fn set_last_alert_date(&self, date: NaiveDate) -> Result<()> {
        *self.last_alert.lock() = Some(date);
        Ok(())
    }
}
