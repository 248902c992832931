// Utility-meter reading: folded forward each night with the day's production/consumption delta.

use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tracing::{info, warn};

use crate::context::CollectorContext;
use crate::error::StoreError;
use crate::models::{Point, flux_string};
use crate::scheduler::local_midnight;
use crate::task_manager::flux::{ENERGY_MEASUREMENT, METER_CLOSING_FIELD, METER_DELTA, METER_READING, METER_TAG};

/// Field the reading is stored under.
pub const READING_FIELD: &str = "today";

/// Lookback for both inputs; one day plus slack for DST and late snapshots.
const LOOKBACK: &str = "-25h";

/// Reading is kWh, delta is Wh.
pub fn reconcile_reading(old_reading: f64, delta_wh: f64) -> f64 {
    old_reading + delta_wh * 0.001
}

fn reading_point(value: f64, date: NaiveDate) -> Point {
    Point::new(
        ENERGY_MEASUREMENT,
        READING_FIELD,
        value,
        local_midnight(date).timestamp(),
    )
    .tag(METER_TAG, METER_READING)
}

/// The reading at yesterday's midnight (closing) and at today's midnight (opening).
pub fn reading_points(value: f64, today: NaiveDate) -> Vec<Point> {
    let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    vec![reading_point(value, yesterday), reading_point(value, today)]
}

pub struct MeterReconciler {
    ctx: Arc<CollectorContext>,
}

impl MeterReconciler {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }

    fn last_query(&self, tag_value: &str, field: &str) -> String {
        format!(
            "from(bucket: {})\n  |> range(start: {LOOKBACK})\n  |> filter(fn: (r) => r._measurement == {} and r.{METER_TAG} == {} and r._field == {})\n  |> last()\n",
            flux_string(self.ctx.store.bucket()),
            flux_string(ENERGY_MEASUREMENT),
            flux_string(tag_value),
            flux_string(field),
        )
    }

    async fn last_value(&self, tag_value: &str, field: &str) -> Result<Option<f64>, StoreError> {
        let rows = self.ctx.store.query(&self.last_query(tag_value, field)).await?;
        Ok(rows.iter().rev().find_map(|row| row.value()))
    }

    /// Folds the last closing delta into the last reading. `Ok(None)` when either is missing.
    pub async fn reconcile(&self, today: NaiveDate) -> Result<Option<f64>, StoreError> {
        let old_reading = self.last_value(METER_READING, READING_FIELD).await?;
        let delta = self.last_value(METER_DELTA, METER_CLOSING_FIELD).await?;
        let (Some(old_reading), Some(delta)) = (old_reading, delta) else {
            warn!(
                has_reading = old_reading.is_some(),
                has_delta = delta.is_some(),
                "meter reconciliation skipped: missing input"
            );
            return Ok(None);
        };
        let reading = reconcile_reading(old_reading, delta);
        self.ctx.store.write(&reading_points(reading, today)).await?;
        Ok(Some(reading))
    }

    /// Writes a configured reading as today's opening balance.
    pub async fn set_reading(&self, reading: f64, today: NaiveDate) -> Result<(), StoreError> {
        self.ctx.store.write(&[reading_point(reading, today)]).await?;
        info!(reading, date = %today, "meter reading set");
        Ok(())
    }
}
