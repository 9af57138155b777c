//! Stateless sweep: one advance step for every running pair that no live
//! loop is driving, plus the cron schedule that triggers it.

use anyhow::Result;
use chrono::Utc;
use cron::Schedule;
use matura_core::{DriverKind, PairStatus};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::advance::{AdvanceOutcome, Advancer};
use crate::pair_loop::mark_exhausted;

/// Parse a sweep schedule. Five fields are a classic crontab line and fire
/// on the minute; six or seven fields lead with seconds (`*/15 * * * * *`
/// sweeps every fifteen seconds), the last of seven being the year.
pub(crate) fn parse_cron(expr: &str) -> Result<Schedule> {
    let full_expr = match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_owned(),
        _ => anyhow::bail!("invalid cron expression (expected 5-7 fields): {expr}"),
    };
    Schedule::from_str(&full_expr)
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SweepEntry {
    pub pair_id: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct SweepReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    fn record(&mut self, pair_id: &str, outcome: &AdvanceOutcome) {
        self.processed += 1;
        let detail = match outcome {
            AdvanceOutcome::Advanced { .. } => {
                self.succeeded += 1;
                None
            }
            AdvanceOutcome::LeaseHeld
            | AdvanceOutcome::Superseded
            | AdvanceOutcome::Gone
            | AdvanceOutcome::Cancelled => {
                self.skipped += 1;
                None
            }
            AdvanceOutcome::Transient(reason) | AdvanceOutcome::ConfigError(reason) => {
                self.failed += 1;
                Some(reason.clone())
            }
            AdvanceOutcome::Duplicate { .. }
            | AdvanceOutcome::Uncommitted { .. }
            | AdvanceOutcome::ScriptExhausted => {
                self.failed += 1;
                None
            }
        };
        self.entries.push(SweepEntry {
            pair_id: pair_id.to_owned(),
            outcome: outcome.as_str(),
            detail,
        });
    }
}

/// Runs single advance steps over all running pairs, without retries.
#[derive(Debug)]
pub(crate) struct Sweeper {
    advancer: Arc<Advancer>,
    lease_ttl: Duration,
}

impl Sweeper {
    pub(crate) fn new(advancer: Arc<Advancer>, lease_ttl: Duration) -> Self {
        Self {
            advancer,
            lease_ttl,
        }
    }

    pub(crate) async fn sweep_once(&self) -> Result<SweepReport> {
        let holder = format!("sweep:{}", uuid::Uuid::new_v4());
        let span = info_span!("sweep", holder = %holder);
        self.sweep_inner(&holder).instrument(span).await
    }

    async fn sweep_inner(&self, holder: &str) -> Result<SweepReport> {
        let store = self.advancer.store();
        let mut pairs = store.list_by_status(PairStatus::Running).await?;
        pairs.retain(|p| p.active);
        pairs.sort_by(|a, b| a.id.cmp(&b.id));

        let never = CancellationToken::new();
        let mut report = SweepReport::default();
        for pair in &pairs {
            let outcome = self
                .advancer
                .advance(pair, DriverKind::Sweep, holder, self.lease_ttl, &never)
                .await;

            match &outcome {
                AdvanceOutcome::ScriptExhausted => mark_exhausted(store.as_ref(), &pair.id).await,
                AdvanceOutcome::Transient(reason) | AdvanceOutcome::ConfigError(reason) => {
                    warn!(pair.id = %pair.id, error = %reason, "sweep advance failed");
                }
                _ => {}
            }
            if !matches!(outcome, AdvanceOutcome::LeaseHeld | AdvanceOutcome::Gone)
                && let Err(e) = store.release_lease(&pair.id, holder).await
            {
                warn!(pair.id = %pair.id, error = %e, "failed to release sweep lease");
            }
            report.record(&pair.id, &outcome);
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "sweep finished"
        );
        Ok(report)
    }
}

/// Fire `sweep_once` on `schedule` until `shutdown` is cancelled.
pub(crate) async fn run_sweep_schedule(
    sweeper: Arc<Sweeper>,
    schedule: Schedule,
    shutdown: CancellationToken,
) {
    info!("sweep scheduler started");

    loop {
        let now = Utc::now();
        let Some(fire_time) = schedule.upcoming(Utc).next() else {
            warn!("sweep schedule has no upcoming times, scheduler exiting");
            return;
        };
        let delay = (fire_time - now).to_std().unwrap_or(Duration::ZERO);
        debug!(
            fire_time = %fire_time,
            delay_secs = delay.as_secs(),
            "sweep scheduler sleeping"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {
                if Utc::now() < fire_time {
                    continue;
                }
                if let Err(e) = sweeper.sweep_once().await {
                    warn!(error = %e, "scheduled sweep failed");
                }
            }
            () = shutdown.cancelled() => {
                info!("sweep scheduler shutting down");
                return;
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Harness;
    use chrono::Duration as ChronoDuration;
    use chrono::Timelike;
    use matura_core::{PairStore, SchedulingMode};

    #[test]
    fn parse_cron_5_field() {
        assert_eq!(spacing("*/30 * * * *"), ChronoDuration::minutes(30));
        let next = parse_cron("*/30 * * * *").unwrap().upcoming(Utc).next().unwrap();
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn parse_cron_6_and_7_field_lead_with_seconds() {
        assert_eq!(spacing("*/10 * * * * *"), ChronoDuration::seconds(10));
        assert_eq!(spacing("* * * * * *"), ChronoDuration::seconds(1));
        assert_eq!(spacing("*/30 * * * * * *"), ChronoDuration::seconds(30));
        assert_eq!(spacing("0 */2 * * * *"), ChronoDuration::minutes(2));
    }

    /// Gap between two consecutive firings.
    fn spacing(expr: &str) -> ChronoDuration {
        let schedule = parse_cron(expr).unwrap();
        let mut upcoming = schedule.upcoming(Utc);
        let first = upcoming.next().unwrap();
        let second = upcoming.next().unwrap();
        second - first
    }

    #[test]
    fn parse_cron_rejects_garbage() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("* * *").is_err());
    }

    fn sweeper(h: &Harness) -> Sweeper {
        Sweeper::new(h.advancer(), h.config.lease.sweep_ttl())
    }

    #[tokio::test]
    async fn sweep_advances_each_running_pair_once() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        h.store.insert_running("p2", "carol", "dave", 3);
        h.store.insert_running("p3", "carol", "dave", 0);
        h.store
            .set_status("p3", PairStatus::Paused)
            .await
            .unwrap();

        let report = sweeper(&h).sweep_once().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        let ids: Vec<&str> = report.entries.iter().map(|e| e.pair_id.as_str()).collect();
        assert_eq!(ids, ["p1", "p2"]);

        assert_eq!(h.store.pair("p1").unwrap().turn_counter, 1);
        let p2 = h.store.pair("p2").unwrap();
        assert_eq!(p2.turn_counter, 4);
        assert!(p2.lease.is_none(), "sweep releases its lease");
        assert_eq!(h.store.pair("p3").unwrap().turn_counter, 0);
        assert_eq!(h.store.turns("p2")[0].driver, DriverKind::Sweep);
        assert_eq!(h.store.turns("p2")[0].from_member, "dave");
    }

    #[tokio::test]
    async fn sweep_skips_pairs_with_live_loop_lease() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        h.store.insert_running("p2", "carol", "dave", 0);
        h.store
            .try_acquire_lease("p1", "loop:other-host", ChronoDuration::seconds(60), Utc::now())
            .await
            .unwrap();

        let report = sweeper(&h).sweep_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.entries[0].outcome, "lease_held");
        assert_eq!(h.store.pair("p1").unwrap().turn_counter, 0);
        assert_eq!(
            h.store.pair("p1").unwrap().lease.unwrap().holder,
            "loop:other-host"
        );
    }

    #[tokio::test]
    async fn sweep_takes_over_expired_lease() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        let long_ago = Utc::now() - ChronoDuration::minutes(10);
        h.store
            .try_acquire_lease("p1", "loop:dead-host", ChronoDuration::seconds(60), long_ago)
            .await
            .unwrap();

        let report = sweeper(&h).sweep_once().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.store.pair("p1").unwrap().turn_counter, 1);
    }

    #[tokio::test]
    async fn sweep_reports_failures_and_stops_exhausted_scripts() {
        let h = Harness::new();
        h.store.insert_running("broken", "alice", "noaddr", 0);
        h.store.insert_running_with_mode(
            "done",
            "alice",
            "bob",
            3,
            SchedulingMode::Scripted {
                script_id: "intro".to_owned(),
                cursor: 3,
                looped: false,
            },
        );

        let report = sweeper(&h).sweep_once().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);
        let broken = &report.entries[0];
        assert_eq!(broken.outcome, "config_error");
        assert!(broken.detail.as_deref().unwrap().contains("noaddr"));
        assert_eq!(report.entries[1].outcome, "script_exhausted");

        let done = h.store.pair("done").unwrap();
        assert_eq!(done.status, PairStatus::Stopped);
        assert_eq!(done.last_error.as_deref(), Some("script exhausted"));
        assert_eq!(h.channel.sent_count(), 0);
    }

    #[test]
    fn report_serializes_entries() {
        let mut report = SweepReport::default();
        report.record("p1", &AdvanceOutcome::Transient("timeout".to_owned()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["failed"], 1);
        assert_eq!(json["entries"][0]["outcome"], "transient");
        assert_eq!(json["entries"][0]["detail"], "timeout");
    }

    #[tokio::test]
    async fn scheduler_exits_on_cancellation() {
        let h = Harness::new();
        let sweeper = Arc::new(sweeper(&h));
        let schedule = parse_cron("0 0 1 1 *").unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_sweep_schedule(sweeper, schedule, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not exit after cancellation")
            .expect("scheduler task panicked");
    }

    #[tokio::test]
    async fn scheduler_fires_sweeps() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        let sweeper = Arc::new(sweeper(&h));
        let schedule = parse_cron("* * * * * *").unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_sweep_schedule(sweeper, schedule, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(h.store.pair("p1").unwrap().turn_counter >= 1);
    }
}
