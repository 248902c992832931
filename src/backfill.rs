// One-time backfill at startup: zero-valued energy totals before the first recorded day, so
// month/year sums and dashboards see a continuous history.

use chrono::{DateTime, Datelike, Days, Local, Months, NaiveDate, Utc};
use tracing::info;

use crate::config::BackfillConfig;
use crate::context::CollectorContext;
use crate::error::StoreError;
use crate::models::{Period, Point, flux_string};
use crate::scheduler::local_midnight;
use crate::task_manager::flux::ENERGY_MEASUREMENT;

/// First day of the month `months` months before `today`'s month.
pub fn backfill_start(today: NaiveDate, months: u32) -> NaiveDate {
    let first = today.with_day(1).unwrap_or(today);
    first.checked_sub_months(Months::new(months)).unwrap_or(first)
}

/// Zero points for every day in `[start, stop)`, and for every month and year window that
/// starts at or after `start`'s window and ends by `stop`. A window reaching past `stop` holds
/// recorded data and is left alone.
pub fn backfill_points(device: &str, start: NaiveDate, stop: NaiveDate) -> Vec<Point> {
    let zero = |period: Period, date: NaiveDate| {
        Point::new(ENERGY_MEASUREMENT, period.as_str(), 0.0, local_midnight(date).timestamp())
            .tag("_device", device)
    };
    let mut points = Vec::new();

    for (period, months) in [(Period::Year, 12), (Period::Month, 1)] {
        let mut current = period.window_start(start);
        while let Some(end) = current.checked_add_months(Months::new(months))
            && end <= stop
        {
            points.push(zero(period, current));
            current = end;
        }
    }

    let mut current = start;
    while current < stop {
        points.push(zero(Period::Today, current));
        let Some(next) = current.checked_add_days(Days::new(1)) else {
            break;
        };
        current = next;
    }
    points
}

async fn first_recorded_day(ctx: &CollectorContext, device: &str) -> Result<Option<NaiveDate>, StoreError> {
    let query = format!(
        "from(bucket: {})\n  |> range(start: 0)\n  |> filter(fn: (r) => r._measurement == {} and r._device == {} and r._field == {})\n  |> first()\n",
        flux_string(ctx.store.bucket()),
        flux_string(ENERGY_MEASUREMENT),
        flux_string(device),
        flux_string(Period::Today.as_str()),
    );
    let rows = ctx.store.query(&query).await?;
    let first = rows
        .iter()
        .filter_map(|row| row.get("_time"))
        .filter_map(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc).with_timezone(&Local).date_naive())
        .min();
    Ok(first)
}

/// Fills the gap before the first recorded day (or up to today). Returns points written.
pub async fn run_backfill(
    ctx: &CollectorContext,
    config: &BackfillConfig,
    today: NaiveDate,
) -> Result<usize, StoreError> {
    let start = backfill_start(today, config.months);
    let stop = first_recorded_day(ctx, &config.device)
        .await?
        .unwrap_or(today)
        .min(today);
    if stop <= start {
        info!(device = %config.device, "backfill not needed");
        return Ok(0);
    }
    let points = backfill_points(&config.device, start, stop);
    ctx.store.write(&points).await?;
    info!(
        device = %config.device,
        from = %start,
        to = %stop,
        points_count = points.len(),
        "backfill complete"
    );
    Ok(points.len())
}
