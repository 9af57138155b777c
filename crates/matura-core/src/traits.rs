//! Core trait definitions for Matura.
//!
//! These define the contracts between the scheduler and its collaborators.
//! Implementations live in other crates (matura-agent for providers,
//! matura-channels for channels, matura-store for persistence).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{ChannelError, ResolveError, StoreError};
use crate::types::{
    ChannelHealth, Identity, Message, ModelInfo, Pair, PairPatch, PairStatus, Turn, TurnCommit,
    Usage,
};

/// A messaging channel that can send text from one of our instances.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique identifier for this channel.
    fn id(&self) -> &str;

    /// Send `text` from `instance` to an already normalized `address`.
    async fn send_text(&self, instance: &str, address: &str, text: &str)
    -> Result<(), ChannelError>;

    /// Probe health of this channel.
    async fn probe(&self) -> ChannelHealth;
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// A completion service used to generate conversation turns.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Model info (name, context limit).
    fn model_info(&self) -> &ModelInfo;

    /// Given a system prompt and the recent conversation, return the next
    /// message and usage.
    async fn complete(&self, system: &str, messages: &[Message]) -> Result<(Message, Usage)>;
}

// ---------------------------------------------------------------------------
// Identities and scripts
// ---------------------------------------------------------------------------

/// Maps a pair member name to its channel coordinates and behaviour.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Identity, ResolveError>;
}

/// Source of pre-authored message scripts.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Ordered messages of `script_id`, or `None` if the script is unknown.
    async fn messages(&self, script_id: &str) -> Result<Option<Vec<String>>>;
}

// ---------------------------------------------------------------------------
// Pair state storage
// ---------------------------------------------------------------------------

/// Persisted pair records, turn history and per-pair leases.
///
/// No call spans more than one operation; the only atomic guarantees are
/// the conditional ones documented per method.
#[async_trait]
pub trait PairStore: Send + Sync {
    async fn create(&self, pair: &Pair) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Pair>, StoreError>;

    async fn list(&self) -> Result<Vec<Pair>, StoreError>;

    async fn list_by_status(&self, status: PairStatus) -> Result<Vec<Pair>, StoreError>;

    /// Apply `patch`, enforcing status transition rules. Returns the updated pair.
    async fn update(&self, id: &str, patch: &PairPatch) -> Result<Pair, StoreError>;

    async fn set_status(&self, id: &str, status: PairStatus) -> Result<Pair, StoreError> {
        self.update(id, &PairPatch::status(status)).await
    }

    /// Delete a pair and its history. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Increment the turn counter iff it still equals `commit.expected_counter`
    /// and the pair is running. Also stamps `last_activity_at`, stores the
    /// scripted cursor, sets `waiting_for_reply` and clears `last_error`.
    async fn advance_turn(&self, id: &str, commit: &TurnCommit) -> Result<Pair, StoreError>;

    async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError>;

    /// The last `limit` turns of a pair, oldest first.
    async fn recent_turns(&self, id: &str, limit: usize) -> Result<Vec<Turn>, StoreError>;

    /// Take or renew the pair's lease for `holder` until `now + ttl`.
    /// Returns `false` when a different holder owns a live lease.
    async fn try_acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `holder` owns it.
    async fn release_lease(&self, id: &str, holder: &str) -> Result<(), StoreError>;
}
