use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DupError, Result};
use crate::model::{
    CheckKind, CheckSession, ComparisonMode, DocumentId, NewSession, SessionId, SessionStatus,
};
use crate::store::{CheckStore, DocumentSource};

pub const MIN_THRESHOLD: f32 = 0.5;
pub const MAX_THRESHOLD: f32 = 1.0;
pub const MIN_DOCUMENTS: usize = 2;

pub fn validate_threshold(threshold: f32) -> Result<()> {
    if (MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) {
        Ok(())
    } else {
        Err(DupError::invalid(format!(
            "threshold must be between {MIN_THRESHOLD} and {MAX_THRESHOLD}, got {threshold}"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub threshold: f32,
    pub mode: ComparisonMode,
    /// Restricts the check to these documents, in this order.
    #[serde(default)]
    pub document_ids: Option<Vec<DocumentId>>,
}

/// Validates the request and persists a new session at cursor 0.
pub fn start_check(
    documents: &dyn DocumentSource,
    store: &dyn CheckStore,
    request: &StartRequest,
    external_batch_ref: Option<String>,
) -> Result<CheckSession> {
    validate_threshold(request.threshold)?;
    let (document_ids, kind) = match &request.document_ids {
        None => (documents.document_ids()?, CheckKind::Full),
        Some(ids) => {
            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id) {
                    return Err(DupError::invalid(format!("document {id} is listed twice")));
                }
                if documents.vector(id)?.is_none() {
                    return Err(DupError::invalid(format!(
                        "document {id} does not exist or has no embedding"
                    )));
                }
            }
            (ids.clone(), CheckKind::Secondary)
        }
    };
    if document_ids.len() < MIN_DOCUMENTS {
        return Err(DupError::invalid(format!(
            "at least {MIN_DOCUMENTS} embedded documents are required, found {}",
            document_ids.len()
        )));
    }
    let session = store.create_session(&NewSession {
        threshold: request.threshold,
        mode: request.mode,
        document_ids,
        external_batch_ref,
        kind,
    })?;
    info!(
        session = session.id,
        documents = session.total(),
        threshold = session.threshold,
        mode = %session.mode,
        kind = session.kind.as_str(),
        "duplicate check started"
    );
    Ok(session)
}

/// Reference to the check an operator context is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCheck {
    pub session_id: SessionId,
    pub batch_ref: Option<String>,
}

impl From<&CheckSession> for ActiveCheck {
    fn from(session: &CheckSession) -> Self {
        Self {
            session_id: session.id,
            batch_ref: session.external_batch_ref.clone(),
        }
    }
}

/// Cancels outstanding asynchronous judge work.
pub trait BatchCanceller {
    /// `Ok(false)` when the provider had nothing to cancel.
    fn cancel_batch(&self, batch_ref: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub batch_cancelled: bool,
}

/// Marks the active check cancelled and clears the slot.
///
/// Sessions that already finished keep their status. The slot is left untouched when the
/// status write fails so the cancel can be retried.
pub fn cancel_check(
    store: &dyn CheckStore,
    canceller: Option<&dyn BatchCanceller>,
    active: &mut Option<ActiveCheck>,
) -> Result<CancelOutcome> {
    let current = active.clone().ok_or(DupError::NoActiveCheck)?;
    let Some(session) = store.session(current.session_id)? else {
        warn!(session = current.session_id, "active check no longer exists; clearing it");
        *active = None;
        return Err(DupError::SessionNotFound(current.session_id));
    };
    let status = if session.status == SessionStatus::Processing {
        store.update_session_status(session.id, SessionStatus::Cancelled, None, None)?;
        SessionStatus::Cancelled
    } else {
        session.status
    };

    let mut batch_cancelled = false;
    if let (Some(canceller), Some(batch_ref)) = (canceller, current.batch_ref.as_deref()) {
        match canceller.cancel_batch(batch_ref) {
            Ok(cancelled) => batch_cancelled = cancelled,
            Err(err) => warn!(batch = batch_ref, error = %err, "failed to cancel judge batch"),
        }
    }
    *active = None;
    info!(session = session.id, status = %status, batch_cancelled, "duplicate check cancelled");
    Ok(CancelOutcome {
        session_id: session.id,
        status,
        batch_cancelled,
    })
}
