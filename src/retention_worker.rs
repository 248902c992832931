// Prunes old raw samples per configured rule. Runs once at startup and then whenever the
// scheduler signals a new day.

use std::sync::Arc;

use chrono::{DateTime, Days, Local, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::CollectorContext;
use crate::error::StoreError;
use crate::models::{Period, RetentionRule};
use crate::scheduler::local_midnight;

/// `[epoch, local midnight keep_last days ago)`.
pub fn retention_window(now: DateTime<Local>, keep_last: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(keep_last as u64))
        .unwrap_or(today);
    (DateTime::<Utc>::UNIX_EPOCH, local_midnight(cutoff).with_timezone(&Utc))
}

/// Applies every rule once. A failing rule is logged and the rest still run.
pub async fn prune(ctx: &CollectorContext, rules: &[RetentionRule], now: DateTime<Local>) -> usize {
    let mut pruned = 0;
    for rule in rules {
        match prune_rule(ctx, rule, now).await {
            Ok(()) => pruned += 1,
            Err(e) => warn!(error = %e, rule = %rule.name, operation = "delete_range", "pruning failed"),
        }
    }
    pruned
}

async fn prune_rule(ctx: &CollectorContext, rule: &RetentionRule, now: DateTime<Local>) -> Result<(), StoreError> {
    let (start, stop) = retention_window(now, rule.keep_last);
    ctx.store.delete_range(start, stop, &rule.predicate).await?;
    info!(
        rule = %rule.name,
        bucket = %ctx.store.bucket(),
        predicate = %rule.predicate,
        keep_last = rule.keep_last,
        "pruned old samples"
    );
    Ok(())
}

pub fn spawn(
    ctx: Arc<CollectorContext>,
    rules: Vec<RetentionRule>,
    mut trigger_rx: mpsc::Receiver<Vec<Period>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        prune(&ctx, &rules, Local::now()).await;
        while let Some(periods) = trigger_rx.recv().await {
            tracing::debug!(periods = ?periods, "retention triggered");
            prune(&ctx, &rules, Local::now()).await;
        }
    })
}
