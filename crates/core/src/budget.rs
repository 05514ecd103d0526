use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::DocumentId;
use crate::store::{ErrorLog, UsageLedger};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetSettings {
    /// Monthly spend limit in USD; zero or less disables the guard.
    #[serde(default)]
    pub monthly_limit: f64,
    #[serde(default)]
    pub enforce: bool,
    #[serde(default)]
    pub alerts_enabled: bool,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold_percent: f64,
}

fn default_alert_threshold() -> f64 {
    80.0
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            monthly_limit: 0.0,
            enforce: false,
            alerts_enabled: false,
            alert_threshold_percent: default_alert_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetAlert {
    pub date: NaiveDate,
    pub current_cost: f64,
    pub monthly_limit: f64,
    pub usage_percent: f64,
}

pub trait AlertSink {
    fn budget_alert(&self, alert: &BudgetAlert);
}

pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn budget_alert(&self, alert: &BudgetAlert) {
        warn!(
            current_cost = alert.current_cost,
            monthly_limit = alert.monthly_limit,
            usage_percent = alert.usage_percent,
            "judge spend crossed the budget alert threshold"
        );
    }
}

pub struct BudgetGuard<'a> {
    settings: BudgetSettings,
    ledger: &'a dyn UsageLedger,
    alerts: &'a dyn AlertSink,
    log: &'a dyn ErrorLog,
}

impl<'a> BudgetGuard<'a> {
    pub fn new(
        settings: BudgetSettings,
        ledger: &'a dyn UsageLedger,
        alerts: &'a dyn AlertSink,
        log: &'a dyn ErrorLog,
    ) -> Self {
        Self {
            settings,
            ledger,
            alerts,
            log,
        }
    }

    pub fn settings(&self) -> &BudgetSettings {
        &self.settings
    }

    pub fn allow(&self, estimated_cost: f64, document: Option<&DocumentId>) -> bool {
        self.allow_on(estimated_cost, document, Utc::now().date_naive())
    }

    pub fn allow_on(
        &self,
        estimated_cost: f64,
        document: Option<&DocumentId>,
        today: NaiveDate,
    ) -> bool {
        if !self.settings.enforce || self.settings.monthly_limit <= 0.0 {
            return true;
        }
        let current = match self.ledger.month_cost(today.year(), today.month()) {
            Ok(cost) => cost,
            Err(err) => {
                warn!(error = %err, "could not read monthly spend; allowing judge call");
                return true;
            }
        };
        if current + estimated_cost <= self.settings.monthly_limit {
            return true;
        }
        let message = format!(
            "judge call skipped: monthly budget of ${:.2} would be exceeded (spent ${:.4}, estimated ${:.4})",
            self.settings.monthly_limit, current, estimated_cost
        );
        warn!(document = ?document.map(|d| d.as_str()), "{message}");
        if let Err(err) = self.log.log_error(document, &message) {
            warn!(error = %err, "failed to record budget block");
        }
        if self.settings.alerts_enabled {
            self.maybe_alert(current, today);
        }
        false
    }

    fn maybe_alert(&self, current_cost: f64, today: NaiveDate) {
        match self.ledger.last_alert_date() {
            Ok(Some(last)) if last == today => return,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "could not read last budget alert date");
                return;
            }
        }
        let usage_percent = current_cost / self.settings.monthly_limit * 100.0;
        if usage_percent < self.settings.alert_threshold_percent {
            return;
        }
        self.alerts.budget_alert(&BudgetAlert {
            date: today,
            current_cost,
            monthly_limit: self.settings.monthly_limit,
            usage_percent,
        });
        if let Err(err) = self.ledger.set_last_alert_date(today) {
            warn!(error = %err, "failed to persist budget alert date");
        }
    }
}
