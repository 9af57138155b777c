use matura_core::PairStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advance::Advancer;
use crate::pair_loop::{LoopSettings, PairLoop};

struct LoopHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Not cancelled and not finished.
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

/// Owns one conversation loop task per running pair.
///
/// Every loop gets a child of the supervisor's shutdown token, so a single
/// `shutdown` cancels them all while `stop` cancels just one. A stopped loop
/// stays in the map until its task ends; a replacement spawned meanwhile
/// waits for it, so one pair never has two loops advancing at once.
pub(crate) struct Supervisor {
    advancer: Arc<Advancer>,
    settings: LoopSettings,
    holder: String,
    spawned: AtomicU64,
    shutdown: CancellationToken,
    loops: Mutex<HashMap<String, LoopHandle>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("holder", &self.holder)
            .field("running", &self.running_pairs())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub(crate) fn new(
        advancer: Arc<Advancer>,
        settings: LoopSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            advancer,
            settings,
            holder: format!("loop:{}", uuid::Uuid::new_v4()),
            spawned: AtomicU64::new(0),
            shutdown,
            loops: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LoopHandle>> {
        self.loops
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Prefix of the lease holder ids of this process's loops.
    pub(crate) fn holder(&self) -> &str {
        &self.holder
    }

    /// Spawn a loop for `pair_id` unless a live one exists. Returns whether a
    /// new task was spawned.
    pub(crate) fn ensure_running(&self, pair_id: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let mut loops = self.lock();
        if loops.get(pair_id).is_some_and(LoopHandle::is_live) {
            return false;
        }
        let previous = loops
            .remove(pair_id)
            .map(|h| h.task)
            .filter(|task| !task.is_finished());

        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let holder = format!("{}:{n}", self.holder);
        let cancel = self.shutdown.child_token();
        let wake = Arc::new(Notify::new());
        let pair_loop = PairLoop::new(
            pair_id,
            holder,
            Arc::clone(&self.advancer),
            self.settings.clone(),
            cancel.clone(),
            Arc::clone(&wake),
        );
        let id = pair_id.to_owned();
        let task = tokio::spawn(async move {
            // A stopped loop may still be finishing its last turn.
            if let Some(previous) = previous {
                debug!(pair.id = %id, "waiting for previous loop to exit");
                if let Err(e) = previous.await {
                    warn!(pair.id = %id, error = %e, "previous pair loop panicked");
                }
            }
            pair_loop.run().await;
        });
        loops.insert(pair_id.to_owned(), LoopHandle { cancel, wake, task });
        debug!(pair.id = %pair_id, "pair loop spawned");
        true
    }

    /// Cancel the loop for `pair_id`. The task exits at its next suspension
    /// point; an in-flight turn still completes.
    pub(crate) fn stop(&self, pair_id: &str) -> bool {
        match self.lock().get(pair_id) {
            Some(handle) if handle.is_live() => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cut the loop's inter-turn sleep short. Only a loop that is currently
    /// sleeping is woken; a wake during a turn is dropped.
    pub(crate) fn wake(&self, pair_id: &str) -> bool {
        match self.lock().get(pair_id) {
            Some(handle) if handle.is_live() => {
                handle.wake.notify_waiters();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self, pair_id: &str) -> bool {
        self.lock().get(pair_id).is_some_and(LoopHandle::is_live)
    }

    pub(crate) fn running_pairs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, h)| h.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Spawn loops for every pair the store says is running. Used at startup
    /// so pairs resume from their stored counters.
    pub(crate) async fn resume_all(&self) -> anyhow::Result<usize> {
        let pairs = self
            .advancer
            .store()
            .list_by_status(PairStatus::Running)
            .await?;
        let mut spawned = 0;
        for pair in pairs.iter().filter(|p| p.active) {
            if self.ensure_running(&pair.id) {
                info!(pair.id = %pair.id, counter = pair.turn_counter, "resuming pair");
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    /// Re-run [`Self::resume_all`] every `interval`, so pairs started from
    /// another process get a loop here.
    pub(crate) async fn reconcile(&self, interval: Duration) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            match self.resume_all().await {
                Ok(0) => {}
                Ok(spawned) => debug!(spawned, "reconcile spawned pair loops"),
                Err(e) => warn!(error = %e, "reconcile failed to list pairs"),
            }
        }
    }

    /// Cancel every loop and wait for them to release their leases.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<(String, LoopHandle)> = self.lock().drain().collect();
        for (pair_id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(pair.id = %pair_id, error = %e, "pair loop panicked");
            }
        }
        info!("supervisor stopped");
    }
}
