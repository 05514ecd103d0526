use serde::Serialize;
use tracing::{debug, info};

use crate::comparator::Comparator;
use crate::error::{DupError, Result};
use crate::model::{
    progress_percent, CheckSession, Document, GroupId, GroupMember, SessionId, SessionStatus,
};
use crate::store::{CheckStore, DocumentSource};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub session_id: SessionId,
    pub done: bool,
    pub cursor: usize,
    pub total: usize,
    pub progress_percent: f32,
    pub message: String,
    pub matches: usize,
    pub group_id: Option<GroupId>,
    pub judge_calls: usize,
    pub judge_fallbacks: usize,
    pub documents_checked: usize,
    pub groups_found: usize,
}

impl StepReport {
    /// Current progress of `session` without running a step.
    pub fn snapshot(session: &CheckSession, message: impl Into<String>) -> Self {
        let total = session.total();
        StepReport {
            session_id: session.id,
            done: session.status == SessionStatus::Completed,
            cursor: session.cursor,
            total,
            progress_percent: progress_percent(session.cursor, total),
            message: message.into(),
            matches: 0,
            group_id: None,
            judge_calls: 0,
            judge_fallbacks: 0,
            documents_checked: session.documents_checked,
            groups_found: session.groups_found,
        }
    }
}

/// Advances a check session one reference document at a time.
pub struct Driver<'a> {
    documents: &'a dyn DocumentSource,
    store: &'a dyn CheckStore,
    comparator: Comparator<'a>,
}

#[derive(Default)]
struct StepTally {
    matches: Vec<GroupMember>,
    judge_calls: usize,
    judge_fallbacks: usize,
}

impl<'a> Driver<'a> {
    pub fn new(
        documents: &'a dyn DocumentSource,
        store: &'a dyn CheckStore,
        comparator: Comparator<'a>,
    ) -> Self {
        Self {
            documents,
            store,
            comparator,
        }
    }

    /// Runs one step. `session` is only updated once every write for the step succeeded,
    /// so an error leaves it at the cursor that has to be retried.
    pub fn step(&self, session: &mut CheckSession) -> Result<StepReport> {
        let stored = self
            .store
            .session(session.id)?
            .ok_or(DupError::SessionNotFound(session.id))?;
        if stored.status.is_terminal() {
            return Err(DupError::SessionClosed {
                id: session.id,
                status: stored.status,
            });
        }

        let total = session.total();
        let index = session.cursor;
        if index >= total {
            self.store.update_session_status(
                session.id,
                SessionStatus::Completed,
                Some(session.documents_checked),
                Some(session.groups_found),
            )?;
            session.status = SessionStatus::Completed;
            info!(session = session.id, groups = session.groups_found, "duplicate check completed");
            return Ok(self.report(session, StepTally::default(), None, true));
        }

        let reference_id = session.document_ids[index].clone();
        let tally = match self.documents.vector(&reference_id)? {
            Some(vector) => self.compare_forward(
                session,
                &Document {
                    id: reference_id.clone(),
                    vector,
                },
            )?,
            None => {
                debug!(session = session.id, document = %reference_id, "no embedding; skipping");
                StepTally::default()
            }
        };

        let mut groups_found = session.groups_found;
        let group_id = if tally.matches.is_empty() {
            None
        } else {
            let mut members = Vec::with_capacity(tally.matches.len() + 1);
            members.push(GroupMember {
                document_id: reference_id.clone(),
                score: 1.0,
            });
            members.extend(tally.matches.iter().cloned());
            let write = self.store.create_group(session.id, index, &members)?;
            if !write.inserted {
                info!(
                    session = session.id,
                    cursor = index,
                    group = write.group_id,
                    "group for this cursor already stored; reusing it"
                );
            }
            // The session row has not counted this group yet, whether or not it was
            // written by an earlier attempt.
            groups_found += 1;
            Some(write.group_id)
        };

        let next = index + 1;
        // The step that processes the last document completes the check; callers need
        // no extra step at cursor == len.
        let done = next >= total;
        self.store
            .save_progress(session.id, next, next, groups_found)?;
        if done {
            self.store.update_session_status(
                session.id,
                SessionStatus::Completed,
                Some(next),
                Some(groups_found),
            )?;
        }

        session.cursor = next;
        session.documents_checked = next;
        session.groups_found = groups_found;
        if done {
            session.status = SessionStatus::Completed;
            info!(session = session.id, groups = groups_found, "duplicate check completed");
        } else {
            debug!(
                session = session.id,
                document = %reference_id,
                matches = tally.matches.len(),
                "step finished"
            );
        }
        Ok(self.report(session, tally, group_id, done))
    }

    fn compare_forward(&self, session: &CheckSession, reference: &Document) -> Result<StepTally> {
        let mut tally = StepTally::default();
        for candidate_id in &session.document_ids[session.cursor + 1..] {
            if candidate_id == &reference.id {
                continue;
            }
            let Some(vector) = self.documents.vector(candidate_id)? else {
                continue;
            };
            let candidate = Document {
                id: candidate_id.clone(),
                vector,
            };
            let comparison =
                self.comparator
                    .compare(reference, &candidate, session.mode, session.threshold);
            if comparison.used_judge {
                tally.judge_calls += 1;
            }
            if comparison
                .fallback
                .as_ref()
                .is_some_and(|reason| reason.is_reported())
            {
                tally.judge_fallbacks += 1;
            }
            if comparison.is_match(session.threshold) {
                tally.matches.push(GroupMember {
                    document_id: candidate.id,
                    score: comparison.score,
                });
            }
        }
        Ok(tally)
    }

    fn report(
        &self,
        session: &CheckSession,
        tally: StepTally,
        group_id: Option<GroupId>,
        done: bool,
    ) -> StepReport {
        let total = session.total();
        let message = if done {
            format!(
                "Check complete: {} duplicate group(s) found in {} document(s)",
                session.groups_found, total
            )
        } else {
            format!(
                "Checked {}/{} documents, {} match(es) for the last one",
                session.cursor,
                total,
                tally.matches.len()
            )
        };
        StepReport {
            session_id: session.id,
            done,
            cursor: session.cursor,
            total,
            progress_percent: progress_percent(session.cursor, total),
            message,
            matches: tally.matches.len(),
            group_id,
            judge_calls: tally.judge_calls,
            judge_fallbacks: tally.judge_fallbacks,
            documents_checked: session.documents_checked,
            groups_found: session.groups_found,
        }
    }
}
