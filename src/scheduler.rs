//! Scheduling functionality for automated backups.
//!
//! Each target has a persisted [`ScheduleState`]. The next run is the first
//! occurrence strictly after "now" in the series anchored at the state's
//! anchor; a run missed while the process was down fires once on startup and
//! the series continues from there, without replaying a backlog.

use crate::manifest::{persist_json, read_json};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Longest the timer loop sleeps before re-checking the clock
const MAX_SLEEP_SECS: i64 = 60;

/// How often a target is backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    /// Same day of month as the anchor, clamped to the month's last day
    Monthly,
    Custom { interval_secs: u64 },
}

impl Frequency {
    /// Parse `daily`, `weekly`, `monthly` or `every@<n>[s|m|h|d]`
    pub fn parse(pattern: &str) -> Result<Self> {
        match pattern.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => {
                let interval = other.strip_prefix("every@").ok_or_else(|| Error::Scheduling {
                    reason: format!("Unknown schedule frequency: {}", pattern),
                })?;
                let (digits, unit) = match interval.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
                    Some((idx, _)) => interval.split_at(idx),
                    None => (interval, "s"),
                };
                let value: u64 = digits.parse().map_err(|_| Error::Scheduling {
                    reason: format!("Invalid interval: {}", interval),
                })?;
                let multiplier = match unit {
                    "s" => 1,
                    "m" => 60,
                    "h" => 3600,
                    "d" => 86400,
                    _ => {
                        return Err(Error::Scheduling {
                            reason: format!("Invalid interval unit: {}", unit),
                        })
                    }
                };
                Ok(Frequency::Custom {
                    interval_secs: value.saturating_mul(multiplier),
                })
            }
        }
    }

    /// Fixed period, for every frequency but monthly
    fn period(&self) -> Result<Option<Duration>> {
        match self {
            Frequency::Daily => Ok(Some(Duration::days(1))),
            Frequency::Weekly => Ok(Some(Duration::weeks(1))),
            Frequency::Monthly => Ok(None),
            Frequency::Custom { interval_secs } => {
                if *interval_secs == 0 || *interval_secs > i64::MAX as u64 / 1000 {
                    return Err(Error::Scheduling {
                        reason: format!("Invalid custom interval: {}s", interval_secs),
                    });
                }
                Ok(Some(Duration::seconds(*interval_secs as i64)))
            }
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Monthly => write!(f, "monthly"),
            Frequency::Custom { interval_secs } => write!(f, "every@{}s", interval_secs),
        }
    }
}

/// The first occurrence strictly after `now` in the series anchored at `anchor`.
///
/// Before the anchor, the anchor itself is next.
pub fn compute_next_run(
    frequency: Frequency,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if now < anchor {
        return Ok(anchor);
    }

    match frequency.period()? {
        Some(period) => {
            let out_of_range = || Error::Scheduling {
                reason: format!("next run after {} is out of range", now),
            };
            let period_secs = period.num_seconds();
            let steps = (now - anchor).num_seconds() / period_secs + 1;
            let offset = steps
                .checked_mul(period_secs)
                .and_then(Duration::try_seconds)
                .ok_or_else(out_of_range)?;
            anchor.checked_add_signed(offset).ok_or_else(out_of_range)
        }
        None => next_monthly(anchor, now),
    }
}

fn next_monthly(anchor: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let anchor_month = anchor.year() * 12 + anchor.month0() as i32;
    let now_month = now.year() * 12 + now.month0() as i32;

    for offset in (now_month - anchor_month)..=(now_month - anchor_month + 2) {
        let month_index = anchor_month + offset;
        let (year, month) = (month_index.div_euclid(12), month_index.rem_euclid(12) as u32 + 1);
        let day = anchor.day().min(days_in_month(year, month)?);
        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| Error::Scheduling {
            reason: format!("Invalid date {}-{}-{}", year, month, day),
        })?;
        let candidate = Utc.from_utc_datetime(&date.and_time(anchor.time()));
        if candidate > now {
            return Ok(candidate);
        }
    }

    Err(Error::Scheduling {
        reason: "No monthly occurrence found".to_string(),
    })
}

fn days_in_month(year: i32, month: u32) -> Result<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .ok_or_else(|| Error::Scheduling {
            reason: format!("Invalid month {}-{}", year, month),
        })
}

/// Today's date at `hour:minute` UTC
pub fn anchor_at(hour: u32, minute: u32, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    now.date_naive()
        .and_hms_opt(hour, minute, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| Error::Scheduling {
            reason: format!("Invalid time of day {:02}:{:02}", hour, minute),
        })
}

/// Persisted schedule of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub target: String,
    pub frequency: Frequency,
    pub anchor: DateTime<Utc>,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

impl ScheduleState {
    pub fn new(
        target: impl Into<String>,
        frequency: Frequency,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            target: target.into(),
            frequency,
            anchor,
            next_run: compute_next_run(frequency, anchor, now)?,
            last_run: None,
        })
    }

    /// Load the state at `path`, or start a new one when it is absent or the
    /// configured frequency or time of day changed. A new state is persisted.
    pub fn load_or_create(
        path: &Path,
        target: &str,
        frequency: Frequency,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let (state, fresh) = Self::resolve(path, target, frequency, anchor, now)?;
        if fresh {
            state.save(path)?;
        }
        Ok(state)
    }

    /// The state [`load_or_create`](Self::load_or_create) would return, without writing anything
    pub fn peek(
        path: &Path,
        target: &str,
        frequency: Frequency,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Self::resolve(path, target, frequency, anchor, now).map(|(state, _)| state)
    }

    /// Persisted state if it still matches the configuration; otherwise a
    /// fresh one, flagged so the caller can decide whether to save it
    fn resolve(
        path: &Path,
        target: &str,
        frequency: Frequency,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Self, bool)> {
        if path.exists() {
            match read_json::<ScheduleState>(path) {
                Ok(state)
                    if state.frequency == frequency
                        && state.target == target
                        && state.anchor.time() == anchor.time() =>
                {
                    return Ok((state, false))
                }
                Ok(state) => {
                    info!("Schedule of {} changed; re-anchoring", target);
                    let mut fresh = Self::new(target, frequency, anchor, now)?;
                    fresh.last_run = state.last_run;
                    return Ok((fresh, true));
                }
                Err(e) => warn!("Ignoring unreadable schedule state {}: {}", path.display(), e),
            }
        }
        Ok((Self::new(target, frequency, anchor, now)?, true))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist_json(path, self)
    }

    /// Whether a run is due (including one missed while not running)
    pub fn on_startup(&self, now: DateTime<Utc>) -> bool {
        self.next_run <= now
    }

    /// Record a fire at `now` and move to the next occurrence after it
    pub fn mark_fired(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.last_run = Some(now);
        self.next_run = compute_next_run(self.frequency, self.anchor, now)?;
        Ok(())
    }
}

/// What the scheduler fires
#[async_trait]
pub trait BackupTrigger: Send + Sync {
    async fn trigger(&self, target: &str) -> Result<()>;

    /// Periodic housekeeping between fires (e.g. retrying queued pushes)
    async fn idle(&self) -> Result<()> {
        Ok(())
    }
}

/// A target's schedule and where it is persisted
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub path: PathBuf,
    pub state: ScheduleState,
}

/// Timer loop firing backups for scheduled targets
pub struct Scheduler {
    trigger: Arc<dyn BackupTrigger>,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub fn new(trigger: Arc<dyn BackupTrigger>, entries: Vec<ScheduleEntry>) -> Self {
        Self { trigger, entries }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Fire every due entry once
    pub async fn fire_due(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for entry in self.entries.iter_mut() {
            if !entry.state.on_startup(now) {
                continue;
            }
            info!("Scheduled backup of {} is due", entry.state.target);
            if let Err(e) = self.trigger.trigger(&entry.state.target).await {
                warn!("Scheduled backup of {} failed: {}", entry.state.target, e);
            }
            entry.state.mark_fired(now)?;
            entry.state.save(&entry.path)?;
            debug!(
                "Next backup of {} at {}",
                entry.state.target, entry.state.next_run
            );
            fired += 1;
        }
        Ok(fired)
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Scheduler started with {} targets", self.entries.len());
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.fire_due(Utc::now()).await?;
            if let Err(e) = self.trigger.idle().await {
                warn!("Scheduler housekeeping failed: {}", e);
            }

            let now = Utc::now();
            let sleep_secs = self
                .entries
                .iter()
                .map(|e| (e.state.next_run - now).num_seconds())
                .min()
                .unwrap_or(MAX_SLEEP_SECS)
                .clamp(1, MAX_SLEEP_SECS);

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs as u64)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }
}
