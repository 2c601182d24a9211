//! Daily call budget for metered providers.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetConfig {
    /// Calls allowed per UTC day.
    pub daily_limit: u32,
    /// Calls held back from automatic use.
    pub reserve: u32,
    /// `status().is_warning` once remaining calls drop to this.
    pub warning_threshold: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: 25,
            reserve: 1,
            warning_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetStatus {
    pub used: u32,
    pub remaining: u32,
    pub is_warning: bool,
    pub is_exhausted: bool,
}

#[derive(Debug)]
struct BudgetCounter {
    date_key: NaiveDate,
    count: u32,
}

/// Process-local counter of calls made today (UTC).
#[derive(Debug)]
pub struct DailyBudget {
    config: BudgetConfig,
    counter: Mutex<BudgetCounter>,
}

impl DailyBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            counter: Mutex::new(BudgetCounter {
                date_key: Utc::now().date_naive(),
                count: 0,
            }),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Consume one call if the budget allows it. A denied call consumes
    /// nothing.
    pub fn check_and_consume(&self) -> bool {
        self.check_and_consume_at(Utc::now())
    }

    pub fn check_and_consume_at(&self, now: DateTime<Utc>) -> bool {
        let mut counter = self.counter();
        self.roll_over(&mut counter, now);

        let usable = self.config.daily_limit.saturating_sub(self.config.reserve);
        if counter.count >= usable {
            warn!(
                "Daily budget exhausted ({} of {} used, {} reserved)",
                counter.count, self.config.daily_limit, self.config.reserve
            );
            return false;
        }

        counter.count += 1;
        true
    }

    pub fn status(&self) -> BudgetStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> BudgetStatus {
        let mut counter = self.counter();
        self.roll_over(&mut counter, now);

        let remaining = self.config.daily_limit.saturating_sub(counter.count);
        BudgetStatus {
            used: counter.count,
            remaining,
            is_warning: remaining <= self.config.warning_threshold,
            is_exhausted: remaining <= self.config.reserve,
        }
    }

    fn roll_over(&self, counter: &mut BudgetCounter, now: DateTime<Utc>) {
        let today = now.date_naive();
        if counter.date_key != today {
            info!(
                "New UTC day {}, resetting budget ({} calls used on {})",
                today, counter.count, counter.date_key
            );
            counter.date_key = today;
            counter.count = 0;
        }
    }

    fn counter(&self) -> std::sync::MutexGuard<'_, BudgetCounter> {
        self.counter.lock().unwrap_or_else(|p| p.into_inner())
    }
}
