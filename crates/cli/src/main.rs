use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dupcheck_core::{ComparisonMode, DocumentId, DupError, RetryHint, SessionId, StepReport};
use dupcheck_engine::{
    DocumentInsert, DupcheckConfig, DuplicateChecker, StartCheck, StepRequest, UsagePeriod,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const MAX_STEP_RETRIES: usize = 3;
const RETRY_DELAY_MS: u64 = 500;

#[derive(Parser, Debug)]
#[command(name = "dupcheck", version = VERSION, about = "Near-duplicate detection over embedded documents")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load documents and their vectors from a JSONL file.
    Import { input: PathBuf },
    /// Start a check (or resume one) and step it to completion.
    Check {
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long, value_parser = parse_mode)]
        mode: Option<ComparisonMode>,
        /// Restrict the check to these documents, in order.
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
        #[arg(long, conflicts_with_all = ["threshold", "mode", "ids"])]
        resume: Option<SessionId>,
        #[arg(long, action = ArgAction::SetTrue)]
        quiet: bool,
    },
    /// Print a check with its duplicate groups as JSON.
    Show { id: SessionId },
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Cancel a processing check, whether or not it is the active one.
    Cancel { id: SessionId },
    Delete { id: SessionId },
    Usage {
        #[arg(long, default_value = "month")]
        period: String,
        #[arg(long, default_value_t = 12)]
        limit: usize,
        #[arg(long, action = ArgAction::SetTrue)]
        csv: bool,
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
    },
    /// Remove detailed usage entries older than the given number of days (minimum 30).
    Cleanup {
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
    Errors {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, action = ArgAction::SetTrue)]
        clear: bool,
    },
}

#[derive(Debug, Deserialize)]
struct ImportRow {
    id: DocumentId,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl From<ImportRow> for DocumentInsert {
    fn from(row: ImportRow) -> Self {
        DocumentInsert {
            id: row.id,
            title: row.title,
            body: row.body.or(row.text),
            vector: row.vector,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(DupcheckConfig::default_path);
    let mut config = DupcheckConfig::load(&config_path)?;
    if let Some(db) = cli.db.clone() {
        config.database = db;
    }
    let checker = DuplicateChecker::open(config)
        .with_context(|| format!("failed to open database from {}", config_path.display()))?;

    match cli.command {
        Commands::Import { input } => {
            let rows = read_import_rows(&input)?;
            let total = rows.len();
            let mut without_vector = 0;
            for row in rows {
                if row.vector.is_none() {
                    without_vector += 1;
                }
                checker.import(&row.into())?;
            }
            println!(
                "imported {total} documents from {} ({without_vector} without vectors, {} embedded in store)",
                input.display(),
                checker.store().document_count()?
            );
        }
        Commands::Check {
            threshold,
            mode,
            ids,
            resume,
            quiet,
        } => {
            let session_id = match resume {
                Some(id) => {
                    checker.attach(id)?;
                    info!(session = id, "resuming check");
                    id
                }
                None => {
                    let started = checker.start(&StartCheck {
                        threshold,
                        mode,
                        document_ids: ids.map(|ids| ids.into_iter().map(DocumentId::from).collect()),
                    })?;
                    if !quiet {
                        println!(
                            "check {} started over {} documents (threshold {}, mode {})",
                            started.session_id,
                            started.document_ids.len(),
                            started.threshold,
                            started.mode
                        );
                    }
                    started.session_id
                }
            };
            let last = run_to_completion(&checker, session_id, quiet)?;
            println!(
                "check {} finished: {} documents checked, {} groups",
                session_id, last.documents_checked, last.groups_found
            );
        }
        Commands::Show { id } => {
            let results = checker.results(id)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::History { limit, offset } => {
            let sessions = checker.recent(limit, offset)?;
            if sessions.is_empty() {
                println!("no checks recorded");
            }
            for s in sessions {
                println!(
                    "#{:<5} {:<10} {:<9} {:<6} threshold {:.2} {:>5.1}% ({}/{}) groups {} {}",
                    s.id,
                    s.status,
                    s.kind.as_str(),
                    s.mode,
                    s.threshold,
                    s.progress_percent(),
                    s.cursor,
                    s.total(),
                    s.groups_found,
                    s.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Cancel { id } => {
            let outcome = checker.cancel_session(id)?;
            println!(
                "check {} is {}{}",
                outcome.session_id,
                outcome.status,
                if outcome.batch_cancelled {
                    " (judge batch cancelled)"
                } else {
                    ""
                }
            );
        }
        Commands::Delete { id } => {
            if !checker.delete(id)? {
                bail!("check {id} not found");
            }
            println!("check {id} deleted");
        }
        Commands::Usage {
            period,
            limit,
            csv,
            out,
        } => {
            let period = UsagePeriod::from_str(&period)
                .ok_or_else(|| anyhow!("unknown period {period}; use day, month or year"))?;
            if csv {
                let rendered = checker.export_usage_csv(period, limit)?;
                match out {
                    Some(path) => {
                        fs::write(&path, rendered)
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        println!("usage written to {}", path.display());
                    }
                    None => print!("{rendered}"),
                }
            } else {
                let report = checker.usage(period, limit)?;
                for row in &report.rows {
                    println!("{:<10} {:>12} tokens  ${:.4}", row.period, row.tokens, row.cost);
                }
                if report.budget.monthly_limit > 0.0 {
                    println!(
                        "this month: ${:.4} of ${:.2}{}",
                        report.current_month_cost,
                        report.budget.monthly_limit,
                        if report.budget.enforce { " (enforced)" } else { "" }
                    );
                } else {
                    println!("this month: ${:.4} (no budget set)", report.current_month_cost);
                }
            }
        }
        Commands::Cleanup { days } => {
            let removed = checker.cleanup_usage(days)?;
            println!("removed {removed} usage entries older than {} days", days.max(30));
        }
        Commands::Errors {
            limit,
            offset,
            clear,
        } => {
            if clear {
                let removed = checker.clear_errors()?;
                println!("cleared {removed} error log entries");
            } else {
                for entry in checker.errors(limit, offset)? {
                    let doc = entry
                        .document_id
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{} [{}] {}", entry.created_at, doc, entry.message);
                }
            }
        }
    }
    Ok(())
}

/// Steps a check until it is done, retrying steps whose failure is transient.
fn run_to_completion(
    checker: &DuplicateChecker,
    session_id: SessionId,
    quiet: bool,
) -> Result<StepReport> {
    let mut retries = 0;
    loop {
        let request = StepRequest {
            session_id,
            ..StepRequest::default()
        };
        match checker.step(&request) {
            Ok(report) => {
                retries = 0;
                if !quiet {
                    println!(
                        "[{:>5.1}%] {}/{} {}",
                        report.progress_percent, report.cursor, report.total, report.message
                    );
                }
                if report.done {
                    return Ok(report);
                }
            }
            Err(err) => {
                if !should_retry(&err, retries) {
                    return Err(anyhow!(err).context(format!("check {session_id} stopped")));
                }
                retries += 1;
                warn!(session = session_id, attempt = retries, error = %err, "step failed; retrying");
                sleep(Duration::from_millis(RETRY_DELAY_MS * retries as u64));
            }
        }
    }
}

fn should_retry(err: &DupError, retries: usize) -> bool {
    err.retry_hint() == RetryHint::Transient && retries < MAX_STEP_RETRIES
}

fn read_import_rows(path: &Path) -> Result<Vec<ImportRow>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
    );
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: ImportRow = serde_json::from_str(line)
            .with_context(|| format!("invalid document row {} in {}", idx + 1, path.display()))?;
        if row.vector.as_ref().is_some_and(|v| v.is_empty()) {
            bail!("document {} on row {} has an empty vector", row.id, idx + 1);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn parse_mode(value: &str) -> Result<ComparisonMode, String> {
    ComparisonMode::from_str(value)
        .ok_or_else(|| format!("unknown mode {value}; use vector, hybrid or gpt"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
