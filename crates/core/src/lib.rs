mod budget;
mod comparator;
mod driver;
mod error;
pub mod memory;
mod model;
mod session;
mod similarity;
mod store;

pub use budget::{AlertSink, BudgetAlert, BudgetGuard, BudgetSettings, TracingAlerts};
pub use comparator::{
    pre_screen_threshold, Comparator, Comparison, FallbackReason, Judge, JudgeUsage,
    JudgeVerdict, DEFAULT_PRE_SCREEN_REDUCTION, JUDGE_OPERATION, MIN_PRE_SCREEN_THRESHOLD,
};
pub use driver::{Driver, StepReport};
pub use error::{DupError, Result, RetryHint};
pub use model::{
    progress_percent, CheckKind, CheckSession, ComparisonMode, Document, DocumentId,
    DuplicateGroup, GroupId, GroupMember, GroupWrite, NewSession, SessionId, SessionStatus,
    TokenKind, UsageEntry,
};
pub use session::{
    cancel_check, start_check, validate_threshold, ActiveCheck, BatchCanceller, CancelOutcome,
    StartRequest, MAX_THRESHOLD, MIN_DOCUMENTS, MIN_THRESHOLD,
};
pub use similarity::cosine_similarity;
pub use store::{CheckStore, DocumentSource, ErrorLog, UsageLedger};
