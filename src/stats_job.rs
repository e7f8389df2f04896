use crate::visit_ledger::{VisitKind, VisitLedger};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Periodic counter folding job.
///
/// Runs from a single spawned task, which is what makes the fold the sole
/// mutator of the aggregate counters: kinds are folded sequentially and no
/// two folds of the same kind ever overlap. A failed fold leaves the ledger
/// untouched and is retried on the next tick.
pub async fn run_fold_scheduler(ledger: Arc<VisitLedger>, fold_interval: Duration) {
    info!(
        interval_secs = fold_interval.as_secs(),
        "Visit counter fold scheduler started"
    );

    let mut ticker = interval(fold_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        for kind in [VisitKind::View, VisitKind::Download] {
            match ledger.fold_and_truncate(kind).await {
                Ok(folded) => {
                    if folded > 0 {
                        info!(kind = kind.as_str(), visits_folded = folded, "Fold completed");
                    }
                }
                Err(e) => {
                    // The statement is atomic, so nothing was partially
                    // applied; the rows are still there for the next tick.
                    error!(kind = kind.as_str(), error = %e, "Fold failed, will retry next tick");
                    metrics::counter!("visits.fold_errors", "kind" => kind.as_str()).increment(1);
                }
            }
        }
    }
}
