use chrono::Utc;
use tracing::{debug, warn};

use crate::budget::BudgetGuard;
use crate::error::Result;
use crate::model::{ComparisonMode, Document, DocumentId, TokenKind, UsageEntry};
use crate::similarity::cosine_similarity;
use crate::store::{DocumentSource, ErrorLog, UsageLedger};

pub const DEFAULT_PRE_SCREEN_REDUCTION: f32 = 0.25;
pub const MIN_PRE_SCREEN_THRESHOLD: f32 = 0.4;
pub const JUDGE_OPERATION: &str = "judge_compare";

/// Natural-language similarity judge for a pair of document texts.
pub trait Judge {
    /// Expected spend of one call, used by the budget guard before the call is made.
    fn estimate_cost(&self, left: &str, right: &str) -> f64;
    fn judge(&self, left: &str, right: &str) -> Result<JudgeVerdict>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f32,
    pub usage: JudgeUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JudgeUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    /// Billed through the discounted asynchronous batch channel.
    pub batched: bool,
}

impl JudgeUsage {
    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    JudgeUnavailable,
    TextUnavailable,
    BudgetExceeded,
    JudgeFailed(String),
}

impl FallbackReason {
    /// Fallbacks that are recorded against the reference document.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            FallbackReason::BudgetExceeded | FallbackReason::JudgeFailed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub score: f32,
    pub used_judge: bool,
    pub vector_score: f32,
    pub fallback: Option<FallbackReason>,
}

impl Comparison {
    fn vector(vector_score: f32) -> Self {
        Self {
            score: vector_score,
            used_judge: false,
            vector_score,
            fallback: None,
        }
    }

    fn fallback(vector_score: f32, reason: FallbackReason) -> Self {
        Self {
            score: vector_score,
            used_judge: false,
            vector_score,
            fallback: Some(reason),
        }
    }

    pub fn is_match(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

pub fn pre_screen_threshold(threshold: f32, reduction: f32) -> f32 {
    (threshold - reduction).max(MIN_PRE_SCREEN_THRESHOLD)
}

pub struct Comparator<'a> {
    judge: Option<&'a dyn Judge>,
    texts: &'a dyn DocumentSource,
    budget: BudgetGuard<'a>,
    ledger: &'a dyn UsageLedger,
    log: &'a dyn ErrorLog,
    pre_screen_reduction: f32,
    batch_ref: Option<String>,
}

impl<'a> Comparator<'a> {
    pub fn new(
        texts: &'a dyn DocumentSource,
        budget: BudgetGuard<'a>,
        ledger: &'a dyn UsageLedger,
        log: &'a dyn ErrorLog,
    ) -> Self {
        Self {
            judge: None,
            texts,
            budget,
            ledger,
            log,
            pre_screen_reduction: DEFAULT_PRE_SCREEN_REDUCTION,
            batch_ref: None,
        }
    }

    pub fn with_judge(mut self, judge: Option<&'a dyn Judge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_pre_screen_reduction(mut self, reduction: f32) -> Self {
        self.pre_screen_reduction = reduction;
        self
    }

    pub fn with_batch_ref(mut self, batch_ref: Option<String>) -> Self {
        self.batch_ref = batch_ref;
        self
    }

    pub fn compare(
        &self,
        reference: &Document,
        candidate: &Document,
        mode: ComparisonMode,
        threshold: f32,
    ) -> Comparison {
        let vector_score = cosine_similarity(&reference.vector, &candidate.vector).clamp(0.0, 1.0);
        match mode {
            ComparisonMode::VectorOnly => Comparison::vector(vector_score),
            ComparisonMode::Hybrid => {
                if vector_score >= pre_screen_threshold(threshold, self.pre_screen_reduction) {
                    self.escalate(&reference.id, &candidate.id, vector_score)
                } else {
                    Comparison::vector(vector_score)
                }
            }
            ComparisonMode::JudgeOnly => self.escalate(&reference.id, &candidate.id, vector_score),
        }
    }

    fn escalate(
        &self,
        reference: &DocumentId,
        candidate: &DocumentId,
        vector_score: f32,
    ) -> Comparison {
        let Some(judge) = self.judge else {
            debug!(%reference, %candidate, "no judge configured; using vector similarity");
            return Comparison::fallback(vector_score, FallbackReason::JudgeUnavailable);
        };
        let (Some(left), Some(right)) = (self.load_text(reference), self.load_text(candidate))
        else {
            debug!(%reference, %candidate, "document text unavailable; using vector similarity");
            return Comparison::fallback(vector_score, FallbackReason::TextUnavailable);
        };
        let estimate = judge.estimate_cost(&left, &right);
        if !self.budget.allow(estimate, Some(reference)) {
            return Comparison::fallback(vector_score, FallbackReason::BudgetExceeded);
        }
        let verdict = judge.judge(&left, &right).and_then(|verdict| {
            if verdict.score.is_finite() {
                Ok(verdict)
            } else {
                Err(crate::DupError::Judge(format!(
                    "non-finite similarity score {}",
                    verdict.score
                )))
            }
        });
        match verdict {
            Ok(verdict) => {
                self.record_usage(reference, &verdict.usage);
                Comparison {
                    score: verdict.score.clamp(0.0, 1.0),
                    used_judge: true,
                    vector_score,
                    fallback: None,
                }
            }
            Err(err) => {
                let message = format!(
                    "judge comparison with {candidate} failed, using vector similarity: {err}"
                );
                warn!(%reference, "{message}");
                if let Err(log_err) = self.log.log_error(Some(reference), &message) {
                    warn!(error = %log_err, "failed to record judge failure");
                }
                Comparison::fallback(vector_score, FallbackReason::JudgeFailed(err.to_string()))
            }
        }
    }

    fn load_text(&self, id: &DocumentId) -> Option<String> {
        match self.texts.text(id) {
            Ok(Some(text)) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(err) => {
                warn!(document = %id, error = %err, "failed to load document text");
                None
            }
        }
    }

    fn record_usage(&self, reference: &DocumentId, usage: &JudgeUsage) {
        let (input_kind, output_kind) = if usage.batched {
            (TokenKind::BatchInput, TokenKind::BatchOutput)
        } else {
            (TokenKind::Input, TokenKind::Output)
        };
        let batch_ref = if usage.batched {
            self.batch_ref.clone()
        } else {
            None
        };
        let now = Utc::now();
        let entries = [
            (usage.input_tokens, usage.input_cost, input_kind),
            (usage.output_tokens, usage.output_cost, output_kind),
        ];
        for (tokens, cost, token_kind) in entries {
            let entry = UsageEntry {
                document_id: Some(reference.clone()),
                tokens: tokens as u64,
                cost,
                operation: JUDGE_OPERATION.to_string(),
                batch_ref: batch_ref.clone(),
                token_kind,
                recorded_at: now,
            };
            if let Err(err) = self.ledger.record_usage(&entry) {
                warn!(error = %err, "failed to record judge usage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetSettings, TracingAlerts};
    use crate::memory::{MemoryCheckStore, MemoryDocuments, MemoryLedger};
    use crate::DupError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubJudge {
        score: std::result::Result<f32, String>,
        calls: AtomicUsize,
        cost: f64,
    }

    impl StubJudge {
        fn scoring(score: f32) -> Self {
            Self {
                score: Ok(score),
                calls: AtomicUsize::new(0),
                cost: 0.001,
            }
        }

        fn failing(msg: &str) -> Self {
            Self {
                score: Err(msg.to_string()),
                calls: AtomicUsize::new(0),
                cost: 0.001,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Judge for StubJudge {
        fn estimate_cost(&self, _left: &str, _right: &str) -> f64 {
            self.cost
        }

        fn judge(&self, _left: &str, _right: &str) -> Result<JudgeVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.score {
                Ok(score) => Ok(JudgeVerdict {
                    score: *score,
                    usage: JudgeUsage {
                        input_tokens: 1200,
                        output_tokens: 80,
                        input_cost: 0.00018,
                        output_cost: 0.000048,
                        batched: false,
                    },
                }),
                Err(msg) => Err(DupError::Judge(msg.clone())),
            }
        }
    }

    struct Fixture {
        docs: MemoryDocuments,
        ledger: MemoryLedger,
        store: MemoryCheckStore,
    }

    impl Fixture {
        fn new() -> Self {
            let docs = MemoryDocuments::default();
            docs.insert("a", vec![1.0, 0.0], Some("first article"));
            // cos(a, b) = 0.7, cos(a, c) = 0.6
            docs.insert("b", vec![0.7, 0.714_142_8], Some("second article"));
            docs.insert("c", vec![0.6, 0.8], Some("third article"));
            docs.insert("mute", vec![1.0, 0.0], None);
            Self {
                docs,
                ledger: MemoryLedger::default(),
                store: MemoryCheckStore::default(),
            }
        }

        fn comparator<'a>(&'a self, judge: &'a dyn Judge, settings: BudgetSettings) -> Comparator<'a> {
            let guard = BudgetGuard::new(settings, &self.ledger, &TracingAlerts, &self.store);
            Comparator::new(&self.docs, guard, &self.ledger, &self.store).with_judge(Some(judge))
        }

        fn doc(&self, id: &str) -> Document {
            let id = DocumentId::from(id);
            let vector = self.docs.vector(&id).unwrap().unwrap();
            Document { id, vector }
        }
    }

    #[test]
    fn vector_only_never_calls_judge() {
        let fx = Fixture::new();
        let judge = StubJudge::scoring(0.99);
        let cmp = fx.comparator(&judge, BudgetSettings::default());
        let result = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::VectorOnly, 0.9);
        assert_eq!(judge.calls(), 0);
        assert!(!result.used_judge);
        assert!((result.score - 0.7).abs() < 1e-4);
    }

    #[test]
    fn hybrid_escalates_only_above_pre_screen() {
        let fx = Fixture::new();
        let judge = StubJudge::scoring(0.95);
        let cmp = fx.comparator(&judge, BudgetSettings::default());
        // threshold 0.9 - 0.25 = 0.65: b (0.70) escalates, c (0.60) does not
        let above = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::Hybrid, 0.9);
        assert_eq!(judge.calls(), 1);
        assert!(above.used_judge);
        assert_eq!(above.score, 0.95);
        let below = cmp.compare(&fx.doc("a"), &fx.doc("c"), ComparisonMode::Hybrid, 0.9);
        assert_eq!(judge.calls(), 1);
        assert!(!below.used_judge);
        assert!((below.score - 0.6).abs() < 1e-4);
    }

    #[test]
    fn hybrid_escalates_when_cosine_equals_pre_screen() {
        let fx = Fixture::new();
        let judge = StubJudge::scoring(0.95);
        let cmp = fx
            .comparator(&judge, BudgetSettings::default())
            .with_pre_screen_reduction(0.0);
        let cosine = cosine_similarity(&fx.doc("a").vector, &fx.doc("b").vector);
        assert_eq!(pre_screen_threshold(cosine, 0.0), cosine);

        let at = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::Hybrid, cosine);
        assert_eq!(judge.calls(), 1);
        assert!(at.used_judge);

        let just_above = f32::from_bits(cosine.to_bits() + 1);
        let below = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::Hybrid, just_above);
        assert_eq!(judge.calls(), 1);
        assert!(!below.used_judge);
    }

    #[test]
    fn hybrid_pre_screen_never_drops_below_floor() {
        assert_eq!(pre_screen_threshold(0.5, 0.25), MIN_PRE_SCREEN_THRESHOLD);
        assert!((pre_screen_threshold(0.9, 0.25) - 0.65).abs() < 1e-6);
        let fx = Fixture::new();
        let judge = StubJudge::scoring(0.5);
        let cmp = fx.comparator(&judge, BudgetSettings::default()).with_pre_screen_reduction(0.5);
        // floor 0.4 still admits c (0.60)
        cmp.compare(&fx.doc("a"), &fx.doc("c"), ComparisonMode::Hybrid, 0.6);
        assert_eq!(judge.calls(), 1);
    }

    #[test]
    fn judge_failure_falls_back_to_vector_score() {
        let fx = Fixture::new();
        let judge = StubJudge::failing("rate limited");
        let cmp = fx.comparator(&judge, BudgetSettings::default());
        let result = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::JudgeOnly, 0.9);
        assert_eq!(judge.calls(), 1);
        assert!(!result.used_judge);
        assert!((result.score - 0.7).abs() < 1e-4);
        assert!(matches!(result.fallback, Some(FallbackReason::JudgeFailed(ref msg)) if msg.contains("rate limited")));
        let errors = fx.store.error_log();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, Some(DocumentId::from("a")));
        assert!(fx.ledger.entries().is_empty());
    }

    #[test]
    fn successful_judge_call_is_recorded_in_ledger() {
        let fx = Fixture::new();
        let judge = StubJudge::scoring(0.42);
        let cmp = fx.comparator(&judge, BudgetSettings::default());
        cmp.compare(&fx.doc("a"), &fx.doc("c"), ComparisonMode::JudgeOnly, 0.9);
        let entries = fx.ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].token_kind, TokenKind::Input);
        assert_eq!(entries[0].tokens, 1200);
        assert_eq!(entries[1].token_kind, TokenKind::Output);
        assert_eq!(entries[1].document_id, Some(DocumentId::from("a")));
    }

    #[test]
    fn blocked_budget_skips_the_judge() {
        let fx = Fixture::new();
        fx.ledger.push(UsageEntry {
            document_id: None,
            tokens: 10,
            cost: 99.9995,
            operation: JUDGE_OPERATION.to_string(),
            batch_ref: None,
            token_kind: TokenKind::Input,
            recorded_at: Utc::now(),
        });
        let judge = StubJudge::scoring(0.99);
        let settings = BudgetSettings {
            monthly_limit: 100.0,
            enforce: true,
            ..BudgetSettings::default()
        };
        let cmp = fx.comparator(&judge, settings);
        let result = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::JudgeOnly, 0.9);
        assert_eq!(judge.calls(), 0);
        assert_eq!(result.fallback, Some(FallbackReason::BudgetExceeded));
        assert!(!result.is_match(0.9));
    }

    #[test]
    fn missing_text_or_judge_uses_vector_score() {
        let fx = Fixture::new();
        let judge = StubJudge::scoring(0.99);
        let cmp = fx.comparator(&judge, BudgetSettings::default());
        let result = cmp.compare(&fx.doc("mute"), &fx.doc("b"), ComparisonMode::JudgeOnly, 0.9);
        assert_eq!(judge.calls(), 0);
        assert_eq!(result.fallback, Some(FallbackReason::TextUnavailable));

        let guard = BudgetGuard::new(BudgetSettings::default(), &fx.ledger, &TracingAlerts, &fx.store);
        let bare = Comparator::new(&fx.docs, guard, &fx.ledger, &fx.store);
        let result = bare.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::JudgeOnly, 0.9);
        assert_eq!(result.fallback, Some(FallbackReason::JudgeUnavailable));
        assert!(fx.store.error_log().is_empty());
    }

    #[test]
    fn judge_scores_are_clamped() {
        let fx = Fixture::new();
        let judge = StubJudge::scoring(1.7);
        let cmp = fx.comparator(&judge, BudgetSettings::default());
        let result = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::JudgeOnly, 0.9);
        assert_eq!(result.score, 1.0);
        let nan = StubJudge::scoring(f32::NAN);
        let cmp = fx.comparator(&nan, BudgetSettings::default());
        let result = cmp.compare(&fx.doc("a"), &fx.doc("b"), ComparisonMode::JudgeOnly, 0.9);
        assert!(!result.used_judge);
        assert!(matches!(result.fallback, Some(FallbackReason::JudgeFailed(_))));
    }
}
