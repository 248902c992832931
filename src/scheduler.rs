// Calendar scheduler: wakes at local midnight, refreshes the aggregation jobs of the windows
// that rolled over, triggers retention and reconciles the meter.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Local, NaiveDate, NaiveTime, TimeZone};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::meter::MeterReconciler;
use crate::models::Period;
use crate::task_manager::TaskManager;

/// Seconds-resolution cron for 00:00:00 every day.
const MIDNIGHT_CRON: &str = "0 0 0 * * *";

/// Start of `date` in local time. When midnight does not exist (DST gap), the first instant
/// of the day after the gap.
pub fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    let naive = date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&naive).earliest() {
        Some(midnight) => midnight,
        None => Local.from_utc_datetime(&naive),
    }
}

/// First local midnight strictly after `now`.
pub fn next_midnight(now: DateTime<Local>) -> DateTime<Local> {
    let from_cron = cron::Schedule::from_str(MIDNIGHT_CRON)
        .ok()
        .and_then(|schedule| schedule.after(&now).next());
    match from_cron {
        Some(next) => next,
        None => {
            let tomorrow = now
                .date_naive()
                .checked_add_days(Days::new(1))
                .unwrap_or(now.date_naive());
            local_midnight(tomorrow)
        }
    }
}

/// Windows that begin on `date`: always today, plus month on the 1st and year on January 1st.
pub fn periods_for(date: NaiveDate) -> Vec<Period> {
    let mut periods = vec![Period::Today];
    if date.day() == 1 {
        periods.push(Period::Month);
        if date.month() == 1 {
            periods.push(Period::Year);
        }
    }
    periods
}

pub struct SchedulerDeps {
    pub task_manager: Arc<TaskManager>,
    pub meter: Option<Arc<MeterReconciler>>,
    /// Retention worker trigger; receives the period set of each midnight.
    pub retention_tx: mpsc::Sender<Vec<Period>>,
    /// Date of the last midnight handled.
    last_rollover: Mutex<Option<NaiveDate>>,
}

impl SchedulerDeps {
    pub fn new(
        task_manager: Arc<TaskManager>,
        meter: Option<Arc<MeterReconciler>>,
        retention_tx: mpsc::Sender<Vec<Period>>,
    ) -> Self {
        Self {
            task_manager,
            meter,
            retention_tx,
            last_rollover: Mutex::new(None),
        }
    }

    /// Claims `today` for rollover work; false if it (or a later date) was already handled.
    fn claim(&self, today: NaiveDate) -> bool {
        let mut last = self
            .last_rollover
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.is_some_and(|done| today <= done) {
            return false;
        }
        *last = Some(today);
        true
    }
}

pub fn spawn(deps: SchedulerDeps) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(deps).await;
    })
}

#[instrument(skip_all)]
async fn run(deps: SchedulerDeps) {
    let today = Local::now().date_naive();
    if let Err(e) = deps.task_manager.refresh(&periods_for(today), today).await {
        warn!(error = %e, operation = "refresh_jobs", "startup job refresh failed");
    }

    loop {
        let next = next_midnight(Local::now());
        debug!(next = %next, "scheduler sleeping until midnight");
        // Timers and wall clock drift apart (clock steps, suspend); wake only once past `next`.
        loop {
            let now = Local::now();
            if now >= next {
                break;
            }
            let remaining = (next - now).to_std().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(remaining).await;
        }
        on_midnight(&deps, next.date_naive()).await;
    }
}

/// One midnight's work, at most once per date. Each step logs its own failure; none stops the
/// others. Returns false when `today` was already handled.
pub async fn on_midnight(deps: &SchedulerDeps, today: NaiveDate) -> bool {
    if !deps.claim(today) {
        warn!(date = %today, "midnight already handled; skipping");
        return false;
    }
    let periods = periods_for(today);
    info!(date = %today, periods = ?periods, "midnight rollover");

    if let Err(e) = deps.task_manager.refresh(&periods, today).await {
        warn!(error = %e, operation = "refresh_jobs", "job refresh failed");
    }
    if let Err(e) = deps.retention_tx.try_send(periods.clone()) {
        warn!(error = %e, operation = "trigger_retention", "retention worker not triggered");
    }
    if let Some(meter) = &deps.meter {
        match meter.reconcile(today).await {
            Ok(Some(reading)) => info!(reading, "meter reading reconciled"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, operation = "reconcile_meter", "meter reconciliation failed"),
        }
    }
    true
}
