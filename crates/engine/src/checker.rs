use anyhow::Result;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use dupcheck_core::{
    cancel_check, start_check, ActiveCheck, AlertSink, BatchCanceller, BudgetGuard, BudgetSettings,
    CancelOutcome, CheckKind, CheckSession, CheckStore, Comparator, ComparisonMode, DocumentId,
    DupError, DuplicateGroup, Driver, Judge, SessionId, StartRequest, StepReport, TracingAlerts,
    UsageLedger,
};
use dupcheck_llm::LlmClient;

use crate::config::DupcheckConfig;
use crate::judge::{JudgeOptions, LlmJudge};
use crate::store::{DocumentInsert, ErrorEntry, SqliteStore, UsagePeriod, UsageSummary};

pub const CSV_HEADER: &str = "Period,Tokens Used,Estimated Cost (USD)";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartCheck {
    pub threshold: Option<f32>,
    pub mode: Option<ComparisonMode>,
    pub document_ids: Option<Vec<DocumentId>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedCheck {
    pub session_id: SessionId,
    pub external_batch_ref: Option<String>,
    pub document_ids: Vec<DocumentId>,
    pub threshold: f32,
    pub mode: ComparisonMode,
    pub kind: CheckKind,
}

/// One call of the step protocol. Only `session_id` is required; the other fields are
/// checked against the stored session when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepRequest {
    pub session_id: SessionId,
    pub cursor: Option<usize>,
    pub document_ids: Option<Vec<DocumentId>>,
    pub threshold: Option<f32>,
    pub mode: Option<ComparisonMode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResults {
    pub session: CheckSession,
    pub groups: Vec<DuplicateGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub rows: Vec<UsageSummary>,
    pub current_month_cost: f64,
    pub budget: BudgetSettings,
}

/// Entry point shared by the HTTP service and the CLI.
pub struct DuplicateChecker {
    store: SqliteStore,
    config: DupcheckConfig,
    judge: Option<LlmJudge>,
    alerts: Box<dyn AlertSink + Send + Sync>,
    active: Mutex<Option<ActiveCheck>>,
}

impl DuplicateChecker {
    pub fn open(config: DupcheckConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database)?;
        let judge = build_judge(&config);
        Ok(Self::new(store, config, judge))
    }

    pub fn new(store: SqliteStore, config: DupcheckConfig, judge: Option<LlmJudge>) -> Self {
        Self {
            store,
            config,
            judge,
            alerts: Box::new(TracingAlerts),
            active: Mutex::new(None),
        }
    }

    pub fn with_alerts(mut self, alerts: Box<dyn AlertSink + Send + Sync>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &DupcheckConfig {
        &self.config
    }

    pub fn has_judge(&self) -> bool {
        self.judge.is_some()
    }

    pub fn active(&self) -> Option<ActiveCheck> {
        self.active.lock().clone()
    }

    pub fn import(&self, doc: &DocumentInsert) -> Result<()> {
        self.store.import_document(doc)
    }

    pub fn start(&self, request: &StartCheck) -> dupcheck_core::Result<StartedCheck> {
        let start = StartRequest {
            threshold: request
                .threshold
                .unwrap_or(self.config.check.default_threshold),
            mode: request.mode.unwrap_or(self.config.check.default_mode),
            document_ids: request.document_ids.clone(),
        };
        if start.mode.uses_judge() && self.judge.is_none() {
            warn!(mode = %start.mode, "no judge configured; comparisons will use vector similarity");
        }
        let prefix = if start.document_ids.is_some() {
            "secondary_check"
        } else {
            "dup_check"
        };
        let session = start_check(&self.store, &self.store, &start, Some(batch_ref(prefix)))?;
        let mut active = self.active.lock();
        if let Some(previous) = active.as_ref() {
            info!(previous = previous.session_id, next = session.id, "replacing active check");
        }
        *active = Some(ActiveCheck::from(&session));
        Ok(StartedCheck {
            session_id: session.id,
            external_batch_ref: session.external_batch_ref.clone(),
            document_ids: session.document_ids.clone(),
            threshold: session.threshold,
            mode: session.mode,
            kind: session.kind,
        })
    }

    /// Makes a stored, still processing check the active one, e.g. after a restart.
    pub fn attach(&self, id: SessionId) -> dupcheck_core::Result<ActiveCheck> {
        let session = self.store.require_session(id)?;
        if session.status.is_terminal() {
            return Err(DupError::SessionClosed {
                id,
                status: session.status,
            });
        }
        let check = ActiveCheck::from(&session);
        *self.active.lock() = Some(check.clone());
        Ok(check)
    }

    pub fn step(&self, request: &StepRequest) -> dupcheck_core::Result<StepReport> {
        let mut session = self.store.require_session(request.session_id)?;
        if session.status.is_terminal() {
            return Err(DupError::SessionClosed {
                id: session.id,
                status: session.status,
            });
        }
        reconcile(&session, request)?;
        if let Some(cursor) = request.cursor {
            if cursor < session.cursor {
                info!(
                    session = session.id,
                    cursor,
                    stored = session.cursor,
                    "step already committed"
                );
                let message = format!(
                    "cursor {cursor} was already processed; continue from {}",
                    session.cursor
                );
                return Ok(StepReport::snapshot(&session, message));
            }
        }

        let guard = BudgetGuard::new(
            self.config.budget,
            &self.store,
            self.alerts.as_ref(),
            &self.store,
        );
        let judge = self.judge.as_ref().map(|j| j as &dyn Judge);
        let comparator = Comparator::new(&self.store, guard, &self.store, &self.store)
            .with_judge(judge)
            .with_pre_screen_reduction(self.config.check.hybrid_threshold_reduction)
            .with_batch_ref(session.external_batch_ref.clone());
        let driver = Driver::new(&self.store, &self.store, comparator);
        let report = driver.step(&mut session)?;

        if report.done {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|a| a.session_id == session.id) {
                *active = None;
            }
        }
        Ok(report)
    }

    pub fn cancel(&self) -> dupcheck_core::Result<CancelOutcome> {
        let mut active = self.active.lock();
        cancel_check(&self.store, self.canceller(), &mut *active)
    }

    /// Cancels a processing check by id. Only clears the active slot when it holds `id`.
    pub fn cancel_session(&self, id: SessionId) -> dupcheck_core::Result<CancelOutcome> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| a.session_id == id) {
            return cancel_check(&self.store, self.canceller(), &mut *active);
        }
        let session = self.store.require_session(id)?;
        if session.status.is_terminal() {
            return Err(DupError::SessionClosed {
                id,
                status: session.status,
            });
        }
        let mut detached = Some(ActiveCheck::from(&session));
        cancel_check(&self.store, self.canceller(), &mut detached)
    }

    fn canceller(&self) -> Option<&dyn BatchCanceller> {
        if self.config.judge.use_batch_api {
            self.judge.as_ref().map(|j| j as &dyn BatchCanceller)
        } else {
            None
        }
    }

    /// The check with its groups; members after the reference are ordered by score.
    pub fn results(&self, id: SessionId) -> dupcheck_core::Result<CheckResults> {
        let session = self.store.require_session(id)?;
        let mut groups = self.store.groups(id)?;
        for group in &mut groups {
            if group.members.len() > 2 {
                group.members[1..].sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }
        Ok(CheckResults { session, groups })
    }

    pub fn recent(&self, limit: usize, offset: usize) -> Result<Vec<CheckSession>> {
        self.store.recent_sessions(limit, offset)
    }

    pub fn delete(&self, id: SessionId) -> dupcheck_core::Result<bool> {
        let deleted = self.store.delete_session(id)?;
        if deleted {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|a| a.session_id == id) {
                *active = None;
            }
        }
        Ok(deleted)
    }

    pub fn usage(&self, period: UsagePeriod, limit: usize) -> Result<UsageReport> {
        let today = Utc::now().date_naive();
        Ok(UsageReport {
            rows: self.store.usage_statistics(period, limit)?,
            current_month_cost: self.store.month_cost(today.year(), today.month())?,
            budget: self.config.budget,
        })
    }

    pub fn export_usage_csv(&self, period: UsagePeriod, limit: usize) -> Result<String> {
        let rows = self.store.usage_statistics(period, limit)?;
        Ok(usage_csv(&rows))
    }

    pub fn cleanup_usage(&self, days: i64) -> Result<usize> {
        let removed = self.store.cleanup_usage(days)?;
        info!(removed, days, "removed old usage entries");
        Ok(removed)
    }

    pub fn errors(&self, limit: usize, offset: usize) -> Result<Vec<ErrorEntry>> {
        self.store.error_log(limit, offset)
    }

    pub fn clear_errors(&self) -> Result<usize> {
        self.store.clear_errors()
    }
}

fn reconcile(session: &CheckSession, request: &StepRequest) -> dupcheck_core::Result<()> {
    if let Some(cursor) = request.cursor {
        if cursor > session.cursor {
            return Err(DupError::invalid(format!(
                "cursor {cursor} is ahead of stored progress {}",
                session.cursor
            )));
        }
    }
    if let Some(ids) = &request.document_ids {
        if ids != &session.document_ids {
            return Err(DupError::invalid(
                "document list does not match the one this check was started with",
            ));
        }
    }
    if let Some(threshold) = request.threshold {
        if (threshold - session.threshold).abs() > 1e-6 {
            return Err(DupError::invalid(format!(
                "threshold {threshold} does not match the check's threshold {}",
                session.threshold
            )));
        }
    }
    if let Some(mode) = request.mode {
        if mode != session.mode {
            return Err(DupError::invalid(format!(
                "mode {mode} does not match the check's mode {}",
                session.mode
            )));
        }
    }
    Ok(())
}

fn batch_ref(prefix: &str) -> String {
    format!("{prefix}_{}", hex::encode(rand::random::<[u8; 8]>()))
}

pub fn usage_csv(rows: &[UsageSummary]) -> String {
    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    for row in rows {
        csv.push_str(&format!("{},{},{:.6}\n", row.period, row.tokens, row.cost));
    }
    csv
}

/// Builds the judge from configuration. A provider without credentials leaves the
/// checker on vector similarity only.
pub fn build_judge(config: &DupcheckConfig) -> Option<LlmJudge> {
    let provider = match config.judge.provider() {
        Ok(provider) => provider,
        Err(err) => {
            warn!(error = %err, "judge disabled");
            return None;
        }
    };
    let client = match LlmClient::with_timeout(
        provider,
        config.judge.model.clone(),
        Duration::from_secs(config.judge.timeout_secs),
    ) {
        Ok(client) => client.with_max_retries(config.judge.max_retries),
        Err(err) => {
            warn!(provider = provider.as_str(), error = %err, "judge disabled");
            return None;
        }
    };
    let options = JudgeOptions {
        max_tokens_per_text: config.judge.max_tokens_per_text,
        rate: config.pricing.rate_for(provider, &config.judge.model),
        batched: config.judge.use_batch_api,
    };
    Some(LlmJudge::new(client, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupcheck_core::{BudgetAlert, SessionStatus, TokenKind, UsageEntry};
    use std::sync::Arc;

    fn config_in(dir: &tempfile::TempDir) -> DupcheckConfig {
        DupcheckConfig {
            database: dir.path().join("dupcheck.sqlite"),
            ..DupcheckConfig::default()
        }
    }

    fn checker_with(
        dir: &tempfile::TempDir,
        docs: &[(&str, Vec<f32>, &str)],
        judge: Option<LlmJudge>,
    ) -> DuplicateChecker {
        let config = config_in(dir);
        let store = SqliteStore::open(&config.database).unwrap();
        for (id, vector, body) in docs {
            store
                .import_document(&DocumentInsert {
                    id: (*id).into(),
                    title: None,
                    body: Some(body.to_string()),
                    vector: Some(vector.clone()),
                })
                .unwrap();
        }
        DuplicateChecker::new(store, config, judge)
    }

    fn local_judge() -> LlmJudge {
        let client = LlmClient::new(dupcheck_llm::LlmProvider::Local, "local").unwrap();
        LlmJudge::new(
            client,
            JudgeOptions {
                max_tokens_per_text: 2000,
                rate: crate::pricing::PricingRate::GPT_4O_MINI,
                batched: false,
            },
        )
    }

    fn corpus() -> Vec<(&'static str, Vec<f32>, &'static str)> {
        vec![
            ("1", vec![1.0, 0.0], "the quick brown fox"),
            ("2", vec![1.0, 0.0], "the quick brown fox"),
            ("3", vec![0.0, 1.0], "an unrelated story"),
        ]
    }

    fn vector_start() -> StartCheck {
        StartCheck {
            threshold: Some(0.9),
            mode: Some(ComparisonMode::VectorOnly),
            document_ids: None,
        }
    }

    fn step_at(session_id: SessionId, cursor: usize) -> StepRequest {
        StepRequest {
            session_id,
            cursor: Some(cursor),
            ..StepRequest::default()
        }
    }

    #[test]
    fn check_runs_to_completion_through_steps() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let started = checker.start(&vector_start()).unwrap();
        assert!(started
            .external_batch_ref
            .as_deref()
            .unwrap()
            .starts_with("dup_check_"));
        assert_eq!(checker.active().unwrap().session_id, started.session_id);

        let mut cursor = 0;
        loop {
            let report = checker.step(&step_at(started.session_id, cursor)).unwrap();
            cursor = report.cursor;
            if report.done {
                break;
            }
        }
        assert_eq!(cursor, 3);
        assert!(checker.active().is_none());

        let results = checker.results(started.session_id).unwrap();
        assert_eq!(results.session.status, SessionStatus::Completed);
        assert_eq!(results.groups.len(), 1);
        let ids: Vec<&str> = results.groups[0]
            .members
            .iter()
            .map(|m| m.document_id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        let err = checker.step(&step_at(started.session_id, 3)).unwrap_err();
        assert!(matches!(err, DupError::SessionClosed { .. }));
    }

    #[test]
    fn stale_cursor_is_answered_without_work() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let started = checker.start(&vector_start()).unwrap();
        let first = checker.step(&step_at(started.session_id, 0)).unwrap();
        assert_eq!(first.cursor, 1);

        let retry = checker.step(&step_at(started.session_id, 0)).unwrap();
        assert_eq!(retry.cursor, 1);
        assert_eq!(retry.matches, 0);
        assert_eq!(checker.store().groups(started.session_id).unwrap().len(), 1);

        let ahead = checker.step(&step_at(started.session_id, 2)).unwrap_err();
        assert!(matches!(ahead, DupError::InvalidInput(_)));
    }

    #[test]
    fn mismatched_parameters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let started = checker.start(&vector_start()).unwrap();
        let wrong_threshold = StepRequest {
            threshold: Some(0.8),
            ..step_at(started.session_id, 0)
        };
        assert!(checker.step(&wrong_threshold).is_err());
        let wrong_list = StepRequest {
            document_ids: Some(vec!["2".into(), "1".into(), "3".into()]),
            ..step_at(started.session_id, 0)
        };
        assert!(checker.step(&wrong_list).is_err());
        let matching = StepRequest {
            document_ids: Some(started.document_ids.clone()),
            threshold: Some(0.9),
            mode: Some(ComparisonMode::VectorOnly),
            ..step_at(started.session_id, 0)
        };
        assert_eq!(checker.step(&matching).unwrap().cursor, 1);
    }

    #[test]
    fn cancel_stops_the_active_check() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        assert!(matches!(checker.cancel(), Err(DupError::NoActiveCheck)));

        let started = checker.start(&vector_start()).unwrap();
        checker.step(&step_at(started.session_id, 0)).unwrap();
        let outcome = checker.cancel().unwrap();
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert!(!outcome.batch_cancelled);
        assert!(checker.active().is_none());

        let err = checker.step(&step_at(started.session_id, 1)).unwrap_err();
        assert_eq!(err.retry_hint(), dupcheck_core::RetryHint::Terminal);
        let stored = checker.store().require_session(started.session_id).unwrap();
        assert_eq!(stored.cursor, 1);
        assert!(checker.delete(started.session_id).unwrap());
    }

    #[test]
    fn attached_check_can_be_cancelled_from_a_fresh_checker() {
        let dir = tempfile::tempdir().unwrap();
        let first = checker_with(&dir, &corpus(), None);
        let started = first.start(&vector_start()).unwrap();
        drop(first);

        let config = config_in(&dir);
        let second = DuplicateChecker::new(SqliteStore::open(&config.database).unwrap(), config, None);
        assert!(second.active().is_none());
        second.attach(started.session_id).unwrap();
        let outcome = second.cancel().unwrap();
        assert_eq!(outcome.session_id, started.session_id);
        assert!(matches!(
            second.attach(started.session_id),
            Err(DupError::SessionClosed { .. })
        ));
    }

    #[test]
    fn replaced_check_is_cancelled_by_id_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let first = checker.start(&vector_start()).unwrap();
        let second = checker.start(&vector_start()).unwrap();

        let outcome = checker.cancel().unwrap();
        assert_eq!(outcome.session_id, second.session_id);
        assert!(matches!(checker.cancel(), Err(DupError::NoActiveCheck)));
        assert!(matches!(
            checker.delete(first.session_id),
            Err(DupError::InvalidInput(_))
        ));

        let outcome = checker.cancel_session(first.session_id).unwrap();
        assert_eq!(outcome.session_id, first.session_id);
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert!(matches!(
            checker.cancel_session(first.session_id),
            Err(DupError::SessionClosed { .. })
        ));
        assert!(checker.delete(first.session_id).unwrap());
        assert!(checker.delete(second.session_id).unwrap());
    }

    #[test]
    fn cancelling_another_check_keeps_the_active_one() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let first = checker.start(&vector_start()).unwrap();
        let second = checker.start(&vector_start()).unwrap();

        checker.cancel_session(first.session_id).unwrap();
        assert_eq!(
            checker.active().map(|a| a.session_id),
            Some(second.session_id)
        );
        let report = checker.step(&step_at(second.session_id, 0)).unwrap();
        assert_eq!(report.cursor, 1);

        checker.cancel_session(second.session_id).unwrap();
        assert!(checker.active().is_none());
    }

    #[test]
    fn configured_retries_reach_the_judge_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.judge.provider = "local".into();
        config.judge.max_retries = 7;
        let judge = build_judge(&config).unwrap();
        assert_eq!(judge.client().max_retries(), 7);

        config.judge.provider = "nonesuch".into();
        assert!(build_judge(&config).is_none());
    }

    #[test]
    fn processing_check_cannot_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let started = checker.start(&vector_start()).unwrap();
        assert!(matches!(
            checker.delete(started.session_id),
            Err(DupError::InvalidInput(_))
        ));
    }

    #[test]
    fn defaults_fill_missing_start_fields() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), None);
        let started = checker.start(&StartCheck::default()).unwrap();
        assert_eq!(started.threshold, 0.7);
        assert_eq!(started.mode, ComparisonMode::VectorOnly);
        assert_eq!(started.kind, CheckKind::Full);

        let subset = checker
            .start(&StartCheck {
                document_ids: Some(vec!["3".into(), "1".into()]),
                ..StartCheck::default()
            })
            .unwrap();
        assert_eq!(subset.kind, CheckKind::Secondary);
        assert!(subset
            .external_batch_ref
            .as_deref()
            .unwrap()
            .starts_with("secondary_check_"));
        assert_eq!(checker.active().unwrap().session_id, subset.session_id);
    }

    #[test]
    fn judge_mode_uses_local_judge_and_records_usage() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker_with(&dir, &corpus(), Some(local_judge()));
        let started = checker
            .start(&StartCheck {
                threshold: Some(0.9),
                mode: Some(ComparisonMode::JudgeOnly),
                document_ids: None,
            })
            .unwrap();
        let report = checker.step(&step_at(started.session_id, 0)).unwrap();
        assert_eq!(report.judge_calls, 2);
        assert_eq!(report.matches, 1);
        // the local provider reports no tokens, so the ledger holds zero-cost rows
        assert_eq!(checker.store().usage_entry_count().unwrap(), 4);
        assert_eq!(checker.usage(UsagePeriod::Month, 12).unwrap().current_month_cost, 0.0);
    }

    #[derive(Default)]
    struct CountingAlerts(Arc<Mutex<Vec<BudgetAlert>>>);

    impl AlertSink for CountingAlerts {
        fn budget_alert(&self, alert: &BudgetAlert) {
            self.0.lock().push(alert.clone());
        }
    }

    #[test]
    fn exhausted_budget_falls_back_to_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut checker = checker_with(&dir, &corpus(), Some(local_judge()));
        checker.config.budget = BudgetSettings {
            monthly_limit: 1.0,
            enforce: true,
            alerts_enabled: true,
            alert_threshold_percent: 80.0,
        };
        let sent = Arc::new(Mutex::new(Vec::new()));
        let checker = checker.with_alerts(Box::new(CountingAlerts(sent.clone())));
        checker
            .store()
            .record_usage(&UsageEntry {
                document_id: None,
                tokens: 1,
                cost: 1.0,
                operation: "judge_compare".into(),
                batch_ref: None,
                token_kind: TokenKind::Output,
                recorded_at: Utc::now(),
            })
            .unwrap();
        let started = checker
            .start(&StartCheck {
                threshold: Some(0.9),
                mode: Some(ComparisonMode::JudgeOnly),
                document_ids: None,
            })
            .unwrap();
        let report = checker.step(&step_at(started.session_id, 0)).unwrap();
        assert_eq!(report.judge_calls, 0);
        assert_eq!(report.judge_fallbacks, 2);
        // vector scores still match the identical pair
        assert_eq!(report.matches, 1);
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(checker.errors(10, 0).unwrap().len(), 2);
    }

    #[test]
    fn usage_csv_has_header_and_rows() {
        let rows = vec![UsageSummary {
            period: "2025-03".into(),
            tokens: 1500,
            cost: 0.000225,
        }];
        assert_eq!(
            usage_csv(&rows),
            "Period,Tokens Used,Estimated Cost (USD)\n2025-03,1500,0.000225\n"
        );
    }
}
