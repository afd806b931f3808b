use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use crate::cigars::SmokingEvent;

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(target_arch = "wasm32", derive(tsify::Tsify))]
#[cfg_attr(target_arch = "wasm32", tsify(into_wasm_abi, from_wasm_abi))]
#[serde(rename_all = "camelCase")]
pub struct CigarStats {
    pub total: usize,
    pub today: usize,
    pub this_week: usize,
    pub this_month: usize,
    pub total_cost: f64,
}

/// Start of each counting window, as instants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Windows {
    today: DateTime<Utc>,
    this_week: DateTime<Utc>,
    this_month: DateTime<Utc>,
}

impl Windows {
    /// Days start at midnight in `now`'s timezone. The week is the seven days before the start of today.
    fn at<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let date = now.date_naive();
        let today = start_of_day(&tz, date).unwrap_or_else(|| now.with_timezone(&Utc));
        let this_month = date
            .with_day(1)
            .and_then(|first| start_of_day(&tz, first))
            .unwrap_or(today);

        Self {
            today,
            this_week: today - Duration::days(7),
            this_month,
        }
    }
}

/// `None` only when midnight doesn't exist on that date (a DST gap at midnight).
fn start_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)?
        .and_local_timezone(tz.clone())
        .earliest()
        .map(|midnight| midnight.with_timezone(&Utc))
}

impl CigarStats {
    /// Events without a resolved timestamp count toward `total` and `total_cost` but no window.
    pub fn compute<'a, Tz: TimeZone>(
        events: impl IntoIterator<Item = &'a SmokingEvent>,
        now: &DateTime<Tz>,
    ) -> Self {
        let windows = Windows::at(now);
        let mut stats = CigarStats::default();

        for event in events {
            stats.total += 1;
            stats.total_cost += event.cost.unwrap_or(0.0);

            let Some(smoked_at) = event.smoked_at else {
                continue;
            };
            if smoked_at >= windows.today {
                stats.today += 1;
            }
            if smoked_at >= windows.this_week {
                stats.this_week += 1;
            }
            if smoked_at >= windows.this_month {
                stats.this_month += 1;
            }
        }

        stats
    }
}

/// Newest first. Events still waiting on a server timestamp go last.
pub fn sort_newest_first(events: &mut [SmokingEvent]) {
    // Option orders None before Some, so reversing puts the unresolved ones at the end
    events.sort_by(|a, b| b.smoked_at.cmp(&a.smoked_at));
}
