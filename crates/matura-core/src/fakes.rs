//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::error::{ChannelError, ResolveError, StoreError};
use crate::traits::{Channel, IdentityResolver, PairStore, Provider, ScriptSource};
use crate::types::{
    Behavior, ChannelHealth, Identity, Message, ModelInfo, OutboundMessage, Pair, PairPatch,
    PairStatus, SchedulingMode, Turn, TurnCommit, Usage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// FakeChannel
// ---------------------------------------------------------------------------

/// Fake channel that records every send and can be told to fail.
#[derive(Debug)]
pub struct FakeChannel {
    pub id: String,
    pub outbound: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<VecDeque<ChannelError>>,
}

impl FakeChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outbound: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next send fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: ChannelError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    pub fn take_outbound(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.outbound.lock().unwrap())
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_text(
        &self,
        instance: &str,
        address: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.outbound.lock().unwrap().push(OutboundMessage {
            instance: instance.to_owned(),
            address: address.to_owned(),
            content: text.to_owned(),
        });
        Ok(())
    }

    async fn probe(&self) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}

// ---------------------------------------------------------------------------
// FakeProvider
// ---------------------------------------------------------------------------

/// A recorded `complete()` call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub system: String,
    pub messages: Vec<Message>,
}

/// Fake provider that returns canned responses.
#[derive(Debug)]
pub struct FakeProvider {
    pub name: String,
    pub model: ModelInfo,
    /// The text response to return on each complete() call.
    pub response: Mutex<String>,
    calls: Mutex<Vec<ProviderCall>>,
}

impl FakeProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            name: "fake".into(),
            model: ModelInfo {
                name: "fake-model".into(),
                context_limit: 128_000,
            },
            response: Mutex::new(response.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_response(&self, response: impl Into<String>) {
        *self.response.lock().unwrap() = response.into();
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    async fn complete(&self, system: &str, messages: &[Message]) -> Result<(Message, Usage)> {
        self.calls.lock().unwrap().push(ProviderCall {
            system: system.to_owned(),
            messages: messages.to_vec(),
        });
        let text = self.response.lock().unwrap().clone();
        Ok((
            Message::assistant(text),
            Usage {
                input_tokens: Some(100),
                output_tokens: Some(50),
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// SlowFakeProvider
// ---------------------------------------------------------------------------

/// Fake provider that sleeps before returning, simulating slow API calls.
#[derive(Debug)]
pub struct SlowFakeProvider {
    inner: FakeProvider,
    delay: std::time::Duration,
}

impl SlowFakeProvider {
    pub fn new(response: impl Into<String>, delay: std::time::Duration) -> Self {
        Self {
            inner: FakeProvider::new(response),
            delay,
        }
    }
}

#[async_trait]
impl Provider for SlowFakeProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_info(&self) -> &ModelInfo {
        self.inner.model_info()
    }

    async fn complete(&self, system: &str, messages: &[Message]) -> Result<(Message, Usage)> {
        tokio::time::sleep(self.delay).await;
        self.inner.complete(system, messages).await
    }
}

// ---------------------------------------------------------------------------
// FailingProvider
// ---------------------------------------------------------------------------

/// Fake provider whose every call fails.
#[derive(Debug)]
pub struct FailingProvider {
    model: ModelInfo,
}

impl FailingProvider {
    pub fn new() -> Self {
        Self {
            model: ModelInfo {
                name: "failing-model".into(),
                context_limit: 128_000,
            },
        }
    }
}

impl Default for FailingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    async fn complete(&self, _system: &str, _messages: &[Message]) -> Result<(Message, Usage)> {
        anyhow::bail!("completion service unavailable")
    }
}

// ---------------------------------------------------------------------------
// StaticIdentities / StaticScripts
// ---------------------------------------------------------------------------

/// Build a prompt-driven identity with a full set of channel coordinates.
pub fn identity(name: &str, address: &str, instance: &str) -> Identity {
    Identity {
        name: name.to_owned(),
        address: Some(address.to_owned()),
        instance: Some(instance.to_owned()),
        behavior: Behavior::Prompt(format!("You are {name}. Chat casually.")),
    }
}

/// In-memory identity resolver.
#[derive(Debug, Default)]
pub struct StaticIdentities {
    identities: Mutex<HashMap<String, Identity>>,
}

impl StaticIdentities {
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            identities: Mutex::new(
                identities
                    .into_iter()
                    .map(|identity| (identity.name.clone(), identity))
                    .collect(),
            ),
        }
    }

    pub fn insert(&self, identity: Identity) {
        self.identities
            .lock()
            .unwrap()
            .insert(identity.name.clone(), identity);
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentities {
    async fn resolve(&self, name: &str) -> Result<Identity, ResolveError> {
        self.identities
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(name.to_owned()))
    }
}

/// In-memory script source.
#[derive(Debug, Default)]
pub struct StaticScripts {
    scripts: HashMap<String, Vec<String>>,
}

impl StaticScripts {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, id: &str, messages: &[&str]) -> Self {
        self.scripts.insert(
            id.to_owned(),
            messages.iter().map(|m| (*m).to_owned()).collect(),
        );
        self
    }
}

#[async_trait]
impl ScriptSource for StaticScripts {
    async fn messages(&self, script_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self.scripts.get(script_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryPairStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    pairs: BTreeMap<String, Pair>,
    turns: Vec<Turn>,
}

/// In-memory pair store for testing.
#[derive(Debug, Default)]
pub struct MemoryPairStore {
    state: Mutex<MemoryState>,
    leases_disabled: AtomicBool,
}

impl MemoryPairStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant every lease request, reproducing a store without lease support.
    pub fn disable_leases(&self) {
        self.leases_disabled.store(true, Ordering::SeqCst);
    }

    /// Insert a pair that is already running, bypassing transition checks.
    pub fn insert_running(&self, id: &str, member_a: &str, member_b: &str, counter: u64) -> Pair {
        self.insert_running_with_mode(id, member_a, member_b, counter, SchedulingMode::Generated)
    }

    pub fn insert_running_with_mode(
        &self,
        id: &str,
        member_a: &str,
        member_b: &str,
        counter: u64,
        mode: SchedulingMode,
    ) -> Pair {
        let mut pair = Pair::new(id, member_a, member_b, mode);
        pair.active = true;
        pair.status = PairStatus::Running;
        pair.turn_counter = counter;
        pair.started_at = Some(Utc::now());
        self.state
            .lock()
            .unwrap()
            .pairs
            .insert(id.to_owned(), pair.clone());
        pair
    }

    pub fn pair(&self, id: &str) -> Option<Pair> {
        self.state.lock().unwrap().pairs.get(id).cloned()
    }

    pub fn turns(&self, id: &str) -> Vec<Turn> {
        self.state
            .lock()
            .unwrap()
            .turns
            .iter()
            .filter(|t| t.pair_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PairStore for MemoryPairStore {
    async fn create(&self, pair: &Pair) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.pairs.contains_key(&pair.id) {
            return Err(StoreError::AlreadyExists(pair.id.clone()));
        }
        state.pairs.insert(pair.id.clone(), pair.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Pair>, StoreError> {
        Ok(self.state.lock().unwrap().pairs.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Pair>, StoreError> {
        Ok(self.state.lock().unwrap().pairs.values().cloned().collect())
    }

    async fn list_by_status(&self, status: PairStatus) -> Result<Vec<Pair>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pairs
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect())
    }

    async fn update(&self, id: &str, patch: &PairPatch) -> Result<Pair, StoreError> {
        let mut state = self.state.lock().unwrap();
        let pair = state
            .pairs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        let mut updated = pair.clone();
        patch.apply(&mut updated)?;
        *pair = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.turns.retain(|t| t.pair_id != id);
        Ok(state.pairs.remove(id).is_some())
    }

    async fn advance_turn(&self, id: &str, commit: &TurnCommit) -> Result<Pair, StoreError> {
        let mut state = self.state.lock().unwrap();
        let pair = state
            .pairs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        if pair.status != PairStatus::Running {
            return Err(StoreError::NotRunning {
                pair_id: id.to_owned(),
                status: pair.status,
            });
        }
        if pair.turn_counter != commit.expected_counter {
            return Err(StoreError::Conflict {
                pair_id: id.to_owned(),
                expected: commit.expected_counter,
                actual: pair.turn_counter,
            });
        }
        pair.turn_counter += 1;
        pair.last_activity_at = Some(commit.at);
        pair.waiting_for_reply = true;
        pair.last_error = None;
        if let (Some(next), SchedulingMode::Scripted { cursor, .. }) =
            (commit.cursor, &mut pair.mode)
        {
            *cursor = next;
        }
        Ok(pair.clone())
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        self.state.lock().unwrap().turns.push(turn.clone());
        Ok(())
    }

    async fn recent_turns(&self, id: &str, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let turns = self.turns(id);
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.leases_disabled.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let mut state = self.state.lock().unwrap();
        let pair = state
            .pairs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        if let Some(ref lease) = pair.lease
            && !lease.available_to(holder, now)
        {
            return Ok(false);
        }
        pair.lease = Some(crate::types::Lease {
            holder: holder.to_owned(),
            expires_at: now + ttl,
        });
        Ok(true)
    }

    async fn release_lease(&self, id: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(pair) = state.pairs.get_mut(id)
            && pair.lease.as_ref().is_some_and(|l| l.holder == holder)
        {
            pair.lease = None;
        }
        Ok(())
    }
}
