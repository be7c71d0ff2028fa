//! quota.rs: greedy delivery budget.
//!
//! Consulted before every delivery attempt. The global cap always wins over
//! class sub-caps, even when the sub-caps add up to more than it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

fn default_daily_cap() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    #[serde(default = "default_daily_cap")]
    pub daily_cap: usize,
    /// Keeps one category from using the whole budget; `None` means no limit.
    #[serde(default)]
    pub per_category_cap: Option<usize>,
    /// Sub-caps by source class, e.g. `primary = 4`, `secondary = 2`.
    #[serde(default)]
    pub class_caps: BTreeMap<String, usize>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            daily_cap: default_daily_cap(),
            per_category_cap: None,
            class_caps: BTreeMap::new(),
        }
    }
}

impl QuotaPolicy {
    pub fn with_cap(daily_cap: usize) -> Self {
        Self {
            daily_cap,
            ..Self::default()
        }
    }
}

/// Verdict for the next delivery. Checked in this order: global, class, category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    GlobalExhausted,
    ClassExhausted,
    CategoryExhausted,
}

#[derive(Debug, Clone)]
pub struct QuotaAllocator {
    policy: QuotaPolicy,
    consumed: usize,
    by_class: BTreeMap<String, usize>,
    by_category: BTreeMap<String, usize>,
}

impl QuotaAllocator {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self {
            policy,
            consumed: 0,
            by_class: BTreeMap::new(),
            by_category: BTreeMap::new(),
        }
    }

    /// Start from what earlier runs today already used.
    pub fn resume(policy: QuotaPolicy, usage: &DailyUsage) -> Self {
        Self {
            consumed: usage.total,
            by_class: usage.by_class.clone(),
            ..Self::new(policy)
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn admit(&self, category: &str, class: &str) -> Admission {
        if self.is_exhausted() {
            return Admission::GlobalExhausted;
        }
        if let Some(&cap) = self.policy.class_caps.get(class) {
            if self.consumed_by_class(class) >= cap {
                return Admission::ClassExhausted;
            }
        }
        if let Some(cap) = self.policy.per_category_cap {
            if self.by_category.get(category).copied().unwrap_or(0) >= cap {
                return Admission::CategoryExhausted;
            }
        }
        Admission::Granted
    }

    /// Global and class budget only (no category share).
    pub fn can_take(&self, class: &str) -> bool {
        !self.is_exhausted()
            && self
                .policy
                .class_caps
                .get(class)
                .map_or(true, |&cap| self.consumed_by_class(class) < cap)
    }

    /// Record one successful delivery.
    pub fn record(&mut self, category: &str, class: &str) {
        debug_assert!(self.consumed < self.policy.daily_cap, "record past global cap");
        self.consumed += 1;
        *self.by_class.entry(class.to_string()).or_insert(0) += 1;
        *self.by_category.entry(category.to_string()).or_insert(0) += 1;
    }

    pub fn is_exhausted(&self) -> bool {
        self.consumed >= self.policy.daily_cap
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn remaining(&self) -> usize {
        self.policy.daily_cap.saturating_sub(self.consumed)
    }

    pub fn consumed_by_class(&self, class: &str) -> usize {
        self.by_class.get(class).copied().unwrap_or(0)
    }

    pub fn usage_for(&self, date: NaiveDate) -> DailyUsage {
        DailyUsage {
            date: date.to_string(),
            total: self.consumed,
            by_class: self.by_class.clone(),
        }
    }
}

/// Deliveries already made on one UTC calendar day, shared by every run that day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: String,
    pub total: usize,
    #[serde(default)]
    pub by_class: BTreeMap<String, usize>,
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl DailyUsage {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date: date.to_string(),
            ..Self::default()
        }
    }

    /// Missing, unreadable or stale (another day) usage starts from zero.
    pub fn load_for(path: &Path, date: NaiveDate) -> Self {
        let loaded = fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str::<DailyUsage>(&s).ok());
        match loaded {
            Some(u) if u.date == date.to_string() => u,
            Some(_) => {
                tracing::info!(path = %path.display(), "daily usage rolled over");
                Self::empty(date)
            }
            None => Self::empty(date),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        let s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        let mut f = fs::File::create(&tmp)?;
        f.write_all(s.as_bytes())?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}
