//! Per-pair conversation loop.
//!
//! A small state machine: `Active` runs one advance step, `Idle` waits out
//! the delay it chose, `Stopping` releases the lease and ends the task.
//! Only the waits are cancellable; an advance step already past its status
//! check runs to completion, so a stop lets at most one more turn out.

use matura_core::{DriverKind, PairPatch, PairStatus, PairStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advance::{AdvanceOutcome, Advancer};
use crate::config::Config;
use crate::pacing;

pub(crate) const SCRIPT_EXHAUSTED: &str = "script exhausted";

#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub turn_delay: (Duration, Duration),
    pub retry_backoff: Duration,
    pub max_config_backoff: Duration,
    pub config_error_threshold: u32,
    pub lease_ttl: Duration,
}

impl LoopSettings {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            turn_delay: config.pacing.turn_delay(),
            retry_backoff: config.pacing.retry_backoff(),
            max_config_backoff: config.pacing.max_config_backoff(),
            config_error_threshold: config.pacing.config_error_threshold,
            lease_ttl: config.lease.loop_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    /// Waiting before the next iteration.
    Idle { wait: Duration },
    /// About to run an iteration.
    Active,
    Stopping,
}

pub(crate) struct PairLoop {
    pair_id: String,
    holder: String,
    advancer: Arc<Advancer>,
    settings: LoopSettings,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    config_failures: u32,
}

impl PairLoop {
    pub(crate) fn new(
        pair_id: impl Into<String>,
        holder: impl Into<String>,
        advancer: Arc<Advancer>,
        settings: LoopSettings,
        cancel: CancellationToken,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            pair_id: pair_id.into(),
            holder: holder.into(),
            advancer,
            settings,
            cancel,
            wake,
            config_failures: 0,
        }
    }

    fn store(&self) -> &Arc<dyn PairStore> {
        self.advancer.store()
    }

    /// Run until the pair stops, disappears, or the loop is cancelled.
    pub(crate) async fn run(mut self) {
        info!(pair.id = %self.pair_id, holder = %self.holder, "pair loop started");

        let mut state = LoopState::Active;
        loop {
            state = match state {
                LoopState::Active => self.iterate().await,
                LoopState::Idle { wait } => self.idle(wait).await,
                LoopState::Stopping => break,
            };
        }

        if let Err(e) = self.store().release_lease(&self.pair_id, &self.holder).await {
            warn!(pair.id = %self.pair_id, error = %e, "failed to release lease");
        }
        info!(pair.id = %self.pair_id, "pair loop stopped");
    }

    async fn idle(&self, wait: Duration) -> LoopState {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => LoopState::Stopping,
            () = self.wake.notified() => {
                debug!(pair.id = %self.pair_id, "woken early by reply");
                LoopState::Active
            }
            () = tokio::time::sleep(wait) => LoopState::Active,
        }
    }

    async fn iterate(&mut self) -> LoopState {
        if self.cancel.is_cancelled() {
            return LoopState::Stopping;
        }

        let pair = match self.store().get(&self.pair_id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!(pair.id = %self.pair_id, "pair deleted, exiting loop");
                return LoopState::Stopping;
            }
            Err(e) => {
                warn!(pair.id = %self.pair_id, error = %e, "failed to read pair");
                return LoopState::Idle { wait: self.settings.retry_backoff };
            }
        };
        if !pair.is_schedulable() {
            info!(
                pair.id = %self.pair_id,
                status = %pair.status,
                active = pair.active,
                "pair no longer running, exiting loop"
            );
            return LoopState::Stopping;
        }

        let outcome = self
            .advancer
            .advance(
                &pair,
                DriverKind::Loop,
                &self.holder,
                self.settings.lease_ttl,
                &self.cancel,
            )
            .await;

        match outcome {
            AdvanceOutcome::Advanced { .. } | AdvanceOutcome::Duplicate { .. } => {
                self.config_failures = 0;
                LoopState::Idle { wait: self.turn_delay() }
            }
            AdvanceOutcome::Superseded | AdvanceOutcome::LeaseHeld => {
                LoopState::Idle { wait: self.turn_delay() }
            }
            AdvanceOutcome::Uncommitted { .. }
            | AdvanceOutcome::Gone
            | AdvanceOutcome::Cancelled => LoopState::Stopping,
            AdvanceOutcome::Transient(_) => LoopState::Idle { wait: self.settings.retry_backoff },
            AdvanceOutcome::ConfigError(reason) => self.config_error(&reason).await,
            AdvanceOutcome::ScriptExhausted => {
                mark_exhausted(self.store().as_ref(), &self.pair_id).await;
                LoopState::Stopping
            }
        }
    }

    async fn config_error(&mut self, reason: &str) -> LoopState {
        self.config_failures = self.config_failures.saturating_add(1);
        let failures = self.config_failures;
        let backoff = pacing::config_backoff(
            self.settings.retry_backoff,
            self.settings.max_config_backoff,
            failures,
        );

        if failures == self.settings.config_error_threshold {
            error!(
                pair.id = %self.pair_id,
                failures,
                error = %reason,
                "pair keeps failing on configuration, needs operator attention"
            );
            let patch = PairPatch {
                last_error: Some(Some(reason.to_owned())),
                ..PairPatch::default()
            };
            if let Err(e) = self.store().update(&self.pair_id, &patch).await {
                warn!(pair.id = %self.pair_id, error = %e, "failed to record last_error");
            }
        } else {
            warn!(
                pair.id = %self.pair_id,
                failures,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "configuration error, backing off"
            );
        }

        LoopState::Idle { wait: backoff }
    }

    fn turn_delay(&self) -> Duration {
        let (min, max) = self.settings.turn_delay;
        pacing::sample_delay(&mut rand::rng(), min, max)
    }
}

/// Stop a pair whose script has run out and say why.
pub(crate) async fn mark_exhausted(store: &dyn PairStore, pair_id: &str) {
    let patch = PairPatch {
        status: Some(PairStatus::Stopped),
        active: Some(false),
        last_error: Some(Some(SCRIPT_EXHAUSTED.to_owned())),
        ..PairPatch::default()
    };
    match store.update(pair_id, &patch).await {
        Ok(_) => info!(pair.id = %pair_id, "script exhausted, pair stopped"),
        Err(e) => warn!(pair.id = %pair_id, error = %e, "failed to stop exhausted pair"),
    }
}
