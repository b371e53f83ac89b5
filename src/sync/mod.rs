pub mod orchestrator;
pub mod runner;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::api::DateType;

/// Lookback for automatic freshness syncs.
const AUTO_LOOKBACK_HOURS: i64 = 24;
/// Manual ranges longer than this are narrowed to bound latency.
const MANUAL_MAX_DAYS: i64 = 7;
/// The recent slice a too-large manual range is narrowed to.
const MANUAL_NARROWED_DAYS: i64 = 5;

/// What kind of sync the caller asked for. The mode only determines the
/// (date type, start, end) window; the paginated runner is mode-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Scheduled freshness sync over the last 24 hours of updates.
    Auto,
    /// User-selected purchase-date range.
    Manual {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// Targeted repair of a single day, issued by the reconciliation auditor.
    Repair { day: NaiveDate },
    /// Full-year backfill by purchase date.
    History { year: i32 },
}

impl SyncMode {
    /// Compute the sync window for this mode. The bool is true when a
    /// manual range was narrowed to a recent slice; callers surface it
    /// so the user knows older rows in their range were not re-synced.
    pub fn window(&self, now: NaiveDateTime) -> (DateType, NaiveDateTime, NaiveDateTime, bool) {
        match self {
            SyncMode::Auto => (
                DateType::UpdateTime,
                now - Duration::hours(AUTO_LOOKBACK_HOURS),
                now,
                false,
            ),
            SyncMode::Manual { start, end } => {
                if *end - *start > Duration::days(MANUAL_MAX_DAYS) {
                    (
                        DateType::Purchase,
                        now - Duration::days(MANUAL_NARROWED_DAYS),
                        now,
                        true,
                    )
                } else {
                    (DateType::Purchase, *start, *end, false)
                }
            }
            SyncMode::Repair { day } => {
                let (start, end) = crate::date_util::day_window(*day);
                (DateType::Purchase, start, end, false)
            }
            SyncMode::History { year } => {
                let start = NaiveDate::from_ymd_opt(*year, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap();
                let year_end = NaiveDate::from_ymd_opt(*year, 12, 31)
                    .unwrap()
                    .and_hms_opt(23, 59, 59)
                    .unwrap();
                (DateType::Purchase, start, year_end.min(now), false)
            }
        }
    }
}

/// Observable orchestrator state, for the UI's busy indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    HotSyncing,
    BackgroundSyncing,
    Failed,
}

/// Report returned after one paginated date-range sync completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Human-readable window description, for logs and the CLI.
    pub window: String,
    pub synced_count: u64,
    pub pages: u32,
    /// True when the run ended via the stalled-pagination dedup guard.
    pub stalled: bool,
}

/// Outcome of a full orchestrated sync (hot phase + background phase).
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    /// Orders refreshed in the hot phase (visible-row batch sync).
    pub hot_synced: u64,
    pub background: SyncReport,
    /// True when a manual range was narrowed to a recent slice.
    pub narrowed: bool,
}
