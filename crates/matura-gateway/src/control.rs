//! Operator-facing pair lifecycle: create, start, pause, stop, delete and
//! history. Shared by the CLI and the long-running service.

use anyhow::{Context, Result};
use chrono::Utc;
use matura_core::{
    Behavior, DriverKind, IdentityResolver, Pair, PairPatch, PairStatus, PairStore,
    SchedulingMode, ScriptSource, StoreError, Turn,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::advance::{AdvanceOutcome, Advancer};
use crate::pair_loop::mark_exhausted;
use crate::supervisor::Supervisor;
use crate::sweep::{SweepReport, Sweeper};

/// Whether a lifecycle command changed the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Changed,
    Unchanged,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Changed => f.write_str("changed"),
            Self::Unchanged => f.write_str("unchanged"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct NewPair {
    pub id: Option<String>,
    pub member_a: String,
    pub member_b: String,
    /// `None` picks the mode from member A's configured behaviour.
    pub mode: Option<SchedulingMode>,
}

/// Collaborators needed to advance pairs from this process.
struct Drivers {
    advancer: Arc<Advancer>,
    sweeper: Arc<Sweeper>,
    manual_lease_ttl: Duration,
}

pub(crate) struct PairControl {
    store: Arc<dyn PairStore>,
    identities: Arc<dyn IdentityResolver>,
    scripts: Arc<dyn ScriptSource>,
    drivers: Option<Drivers>,
    supervisor: Option<Arc<Supervisor>>,
}

impl std::fmt::Debug for PairControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairControl")
            .field("drivers", &self.drivers.is_some())
            .field("supervised", &self.supervisor.is_some())
            .finish_non_exhaustive()
    }
}

impl PairControl {
    /// Store-only control: lifecycle changes are recorded, nothing is sent.
    pub(crate) fn new(
        store: Arc<dyn PairStore>,
        identities: Arc<dyn IdentityResolver>,
        scripts: Arc<dyn ScriptSource>,
    ) -> Self {
        Self {
            store,
            identities,
            scripts,
            drivers: None,
            supervisor: None,
        }
    }

    /// Allow out-of-band advances and sweeps from this process.
    #[must_use]
    pub(crate) fn with_drivers(
        mut self,
        advancer: Arc<Advancer>,
        sweeper: Arc<Sweeper>,
        manual_lease_ttl: Duration,
    ) -> Self {
        self.drivers = Some(Drivers {
            advancer,
            sweeper,
            manual_lease_ttl,
        });
        self
    }

    /// Hand lifecycle changes to a running supervisor instead of advancing
    /// out of band.
    #[must_use]
    pub(crate) fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn store(&self) -> &Arc<dyn PairStore> {
        &self.store
    }

    async fn require(&self, id: &str) -> Result<Pair> {
        self.store()
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_owned()).into())
    }

    pub(crate) async fn create_pair(&self, new: NewPair) -> Result<Pair> {
        anyhow::ensure!(
            new.member_a != new.member_b,
            "a pair needs two distinct identities, got '{}' twice",
            new.member_a
        );
        let member_a = self
            .identities
            .resolve(&new.member_a)
            .await
            .context("member A")?;
        self.identities
            .resolve(&new.member_b)
            .await
            .context("member B")?;

        let mode = match new.mode {
            Some(mode) => mode,
            None => match member_a.behavior {
                Behavior::Script(script_id) => SchedulingMode::scripted(script_id, false),
                Behavior::Prompt(_) | Behavior::Unset => SchedulingMode::Generated,
            },
        };
        if let SchedulingMode::Scripted { script_id, .. } = &mode {
            let known = self.scripts.messages(script_id).await?.is_some();
            anyhow::ensure!(known, "unknown script '{script_id}'");
        }

        let id = new
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let pair = Pair::new(id, new.member_a, new.member_b, mode);
        self.store().create(&pair).await?;
        info!(pair.id = %pair.id, member_a = %pair.member_a, member_b = %pair.member_b, "pair created");
        Ok(pair)
    }

    /// Set the pair running and kick off its first turn without delay.
    pub(crate) async fn start_pair(&self, id: &str) -> Result<Transition> {
        let pair = self.require(id).await?;
        if pair.is_schedulable() {
            if let Some(supervisor) = &self.supervisor {
                supervisor.ensure_running(id);
            }
            return Ok(Transition::Unchanged);
        }

        let patch = PairPatch {
            active: Some(true),
            status: Some(PairStatus::Running),
            started_at: Some(Utc::now()),
            last_error: Some(None),
            ..PairPatch::default()
        };
        let pair = self.store().update(id, &patch).await?;
        info!(pair.id = %id, counter = pair.turn_counter, "pair started");

        match (&self.supervisor, &self.drivers) {
            (Some(supervisor), _) => {
                supervisor.ensure_running(id);
            }
            (None, Some(drivers)) => self.advance_once(drivers, &pair).await,
            (None, None) => {
                info!(pair.id = %id, "no driver in this process, a running scheduler picks the pair up");
            }
        }
        Ok(Transition::Changed)
    }

    /// One out-of-band advance for processes without a supervisor.
    async fn advance_once(&self, drivers: &Drivers, pair: &Pair) {
        let holder = format!("manual:{}", uuid::Uuid::new_v4());
        let outcome = drivers
            .advancer
            .advance(
                pair,
                DriverKind::Manual,
                &holder,
                drivers.manual_lease_ttl,
                &CancellationToken::new(),
            )
            .await;
        match &outcome {
            AdvanceOutcome::Advanced { .. } => {}
            AdvanceOutcome::ScriptExhausted => {
                mark_exhausted(self.store().as_ref(), &pair.id).await;
            }
            other => warn!(pair.id = %pair.id, outcome = other.as_str(), "initial advance did not commit"),
        }
        if let Err(e) = self.store().release_lease(&pair.id, &holder).await {
            warn!(pair.id = %pair.id, error = %e, "failed to release manual lease");
        }
    }

    pub(crate) async fn pause_pair(&self, id: &str) -> Result<Transition> {
        let pair = self.require(id).await?;
        if pair.status == PairStatus::Paused {
            return Ok(Transition::Unchanged);
        }
        self.store()
            .set_status(id, PairStatus::Paused)
            .await?;
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop(id);
        }
        info!(pair.id = %id, "pair paused");
        Ok(Transition::Changed)
    }

    pub(crate) async fn stop_pair(&self, id: &str) -> Result<Transition> {
        let pair = self.require(id).await?;
        if pair.status == PairStatus::Stopped && !pair.active {
            return Ok(Transition::Unchanged);
        }
        let patch = PairPatch {
            active: Some(false),
            status: Some(PairStatus::Stopped),
            ..PairPatch::default()
        };
        self.store().update(id, &patch).await?;
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop(id);
        }
        info!(pair.id = %id, "pair stopped");
        Ok(Transition::Changed)
    }

    pub(crate) async fn delete_pair(&self, id: &str) -> Result<bool> {
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop(id);
        }
        let existed = self.store().delete(id).await?;
        if existed {
            info!(pair.id = %id, "pair deleted");
        }
        Ok(existed)
    }

    pub(crate) async fn list_pairs(&self) -> Result<Vec<Pair>> {
        let mut pairs = self.store().list().await?;
        pairs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pairs)
    }

    pub(crate) async fn sweep_once(&self) -> Result<SweepReport> {
        let drivers = self
            .drivers
            .as_ref()
            .context("sweeping needs a provider and a channel")?;
        drivers.sweeper.sweep_once().await
    }

    /// The last `limit` turns of a pair, oldest first.
    pub(crate) async fn turn_history(&self, id: &str, limit: usize) -> Result<Vec<Turn>> {
        self.require(id).await?;
        Ok(self.store().recent_turns(id, limit).await?)
    }
}
