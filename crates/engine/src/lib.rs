pub mod checker;
pub mod config;
pub mod judge;
pub mod pricing;
pub mod store;
pub mod text;

pub use checker::{
    build_judge, usage_csv, CheckResults, DuplicateChecker, StartCheck, StartedCheck,
    StepRequest, UsageReport, CSV_HEADER,
};
pub use config::{CheckConfig, DupcheckConfig, JudgeConfig};
pub use judge::{JudgeOptions, LlmJudge};
pub use pricing::{PricingConfig, PricingRate};
pub use store::{DocumentInsert, ErrorEntry, SqliteStore, UsagePeriod, UsageSummary};
