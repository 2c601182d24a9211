//! Quota tracking and caching for metered third-party data sources.
//!
//! Metered providers are optional enrichment. Nothing in here returns an
//! error: a denied budget or a failed upstream call both come back as `None`.

mod budget;
mod cache;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

pub use budget::{BudgetConfig, BudgetStatus, DailyBudget};
pub use cache::TtlCache;

/// A daily budget plus a TTL cache, shared by every call to one provider.
///
/// Construct once per process and pass by reference.
#[derive(Debug)]
pub struct RateBudgetCache<T> {
    budget: DailyBudget,
    cache: TtlCache<T>,
}

impl<T: Clone> RateBudgetCache<T> {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            budget: DailyBudget::new(config),
            cache: TtlCache::new(),
        }
    }

    pub fn budget(&self) -> &DailyBudget {
        &self.budget
    }

    pub fn cache(&self) -> &TtlCache<T> {
        &self.cache
    }

    pub fn status(&self) -> BudgetStatus {
        self.budget.status()
    }

    /// Cache, then budget, then upstream.
    ///
    /// `fetch` returns `Ok(None)` for a payload that is well-formed but
    /// carries no data (a throttling notice, an unknown symbol); those are
    /// not cached so the next call can try again.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, ttl: Duration, fetch: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        if let Some(hit) = self.cache.get(key) {
            debug!("Cache hit for {}", key);
            return Some(hit);
        }

        if !self.budget.check_and_consume() {
            warn!("Skipping upstream call for {}: daily budget exhausted", key);
            return None;
        }

        match fetch().await {
            Ok(Some(value)) => {
                self.cache.set(key, value.clone(), ttl);
                Some(value)
            }
            Ok(None) => {
                debug!("Upstream returned no usable data for {}", key);
                None
            }
            Err(e) => {
                warn!("Upstream call for {} failed: {}", key, e);
                None
            }
        }
    }
}
