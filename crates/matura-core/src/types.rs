use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Pair
// ---------------------------------------------------------------------------

/// Scheduling status of a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl PairStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }

    /// Allowed edges: `stopped <-> running` and `running <-> paused`.
    /// Re-applying the current status is always allowed (no-op).
    pub fn can_transition_to(self, next: Self) -> bool {
        self == next
            || matches!(
                (self, next),
                (Self::Stopped, Self::Running)
                    | (Self::Running, Self::Stopped)
                    | (Self::Running, Self::Paused)
                    | (Self::Paused, Self::Running)
            )
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PairStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            other => anyhow::bail!("unknown pair status: {other}"),
        }
    }
}

/// Which member of a pair speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speaker {
    A,
    B,
}

impl Speaker {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("a"),
            Self::B => f.write_str("b"),
        }
    }
}

/// Where a pair's turn content comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchedulingMode {
    #[default]
    Generated,
    Scripted {
        script_id: String,
        cursor: usize,
        #[serde(default)]
        looped: bool,
    },
}

impl SchedulingMode {
    pub fn scripted(script_id: impl Into<String>, looped: bool) -> Self {
        Self::Scripted {
            script_id: script_id.into(),
            cursor: 0,
            looped,
        }
    }

    pub fn cursor(&self) -> Option<usize> {
        match self {
            Self::Generated => None,
            Self::Scripted { cursor, .. } => Some(*cursor),
        }
    }
}

/// A time-bounded claim on a pair by one driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether `holder` may take this lease at `now`.
    pub fn available_to(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder || !self.is_live(now)
    }
}

/// Two identities scheduled to exchange turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub id: String,
    pub member_a: String,
    pub member_b: String,
    pub active: bool,
    pub status: PairStatus,
    pub turn_counter: u64,
    pub mode: SchedulingMode,
    pub waiting_for_reply: bool,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Pair {
    /// A freshly created pair: stopped, inactive, counter zero.
    pub fn new(
        id: impl Into<String>,
        member_a: impl Into<String>,
        member_b: impl Into<String>,
        mode: SchedulingMode,
    ) -> Self {
        Self {
            id: id.into(),
            member_a: member_a.into(),
            member_b: member_b.into(),
            active: false,
            status: PairStatus::Stopped,
            turn_counter: 0,
            mode,
            waiting_for_reply: false,
            last_error: None,
            lease: None,
            created_at: Utc::now(),
            started_at: None,
            last_activity_at: None,
        }
    }

    pub fn member(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::A => &self.member_a,
            Speaker::B => &self.member_b,
        }
    }

    pub fn next_speaker(&self) -> Speaker {
        crate::selector::select_speaker(self.turn_counter)
    }

    /// Running and active: eligible for any driver to advance.
    pub fn is_schedulable(&self) -> bool {
        self.active && self.status == PairStatus::Running
    }
}

/// Partial update applied by [`crate::PairStore::update`].
///
/// `None` leaves a field untouched. `last_error: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairPatch {
    pub active: Option<bool>,
    pub status: Option<PairStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub waiting_for_reply: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub mode: Option<SchedulingMode>,
}

impl PairPatch {
    pub fn status(status: PairStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Apply to `pair`, enforcing the status transition rules.
    ///
    /// `started_at` is only recorded when the pair has none yet.
    pub fn apply(&self, pair: &mut Pair) -> Result<(), StoreError> {
        if let Some(next) = self.status {
            if !pair.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    pair_id: pair.id.clone(),
                    from: pair.status,
                    to: next,
                });
            }
            pair.status = next;
        }
        if let Some(active) = self.active {
            pair.active = active;
        }
        if let Some(started_at) = self.started_at
            && pair.started_at.is_none()
        {
            pair.started_at = Some(started_at);
        }
        if let Some(waiting) = self.waiting_for_reply {
            pair.waiting_for_reply = waiting;
        }
        if let Some(ref last_error) = self.last_error {
            pair.last_error.clone_from(last_error);
        }
        if let Some(ref mode) = self.mode {
            pair.mode = mode.clone();
        }
        Ok(())
    }
}

/// A conditional counter advance: only succeeds when the stored counter
/// still equals `expected_counter` and the pair is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCommit {
    pub expected_counter: u64,
    pub at: DateTime<Utc>,
    /// New scripted cursor, for scripted pairs.
    pub cursor: Option<usize>,
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// Which scheduler produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Loop,
    Sweep,
    Manual,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loop => "loop",
            Self::Sweep => "sweep",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loop" => Ok(Self::Loop),
            "sweep" => Ok(Self::Sweep),
            "manual" => Ok(Self::Manual),
            other => anyhow::bail!("unknown driver kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    /// Content is a fallback phrase substituted for a failed generation.
    #[serde(default)]
    pub fallback: bool,
    /// The counter advance for this turn was accepted.
    #[serde(default)]
    pub committed: bool,
    /// Another driver already advanced the counter this turn was based on.
    #[serde(default)]
    pub duplicate: bool,
}

/// One exchanged message. History only; scheduling never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub pair_id: String,
    pub turn_index: u64,
    pub from_member: String,
    pub to_member: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub driver: DriverKind,
    #[serde(default)]
    pub metadata: TurnMetadata,
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// How an identity produces its turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Prompt(String),
    Script(String),
    #[default]
    Unset,
}

/// A logical account ("chip") with its channel coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub address: Option<String>,
    pub instance: Option<String>,
    #[serde(default)]
    pub behavior: Behavior,
}

impl Identity {
    pub fn prompt(&self) -> Option<&str> {
        match &self.behavior {
            Behavior::Prompt(prompt) => Some(prompt),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Message role in a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message sent to or returned by a completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_limit: usize,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A message handed to a messaging channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub instance: String,
    pub address: String,
    pub content: String,
}

/// An event reported by the channel for a message received on `instance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub instance: String,
    pub from_address: String,
    pub content: String,
    pub from_me: bool,
    pub timestamp: DateTime<Utc>,
}

/// Health status of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelHealth {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}
