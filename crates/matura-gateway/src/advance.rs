//! The advance step shared by every driver: lease, re-check, generate,
//! dispatch, conditional commit, record.

use chrono::Utc;
use matura_core::{
    DriverKind, GenerateError, IdentityResolver, Pair, PairStore, Speaker, StoreError, Turn,
    TurnCommit, TurnMetadata, select_speaker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::PacingConfig;
use crate::dispatcher::Dispatcher;
use crate::generator::{ContentGenerator, Generated};
use crate::pacing;

/// Result of one advance attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AdvanceOutcome {
    /// Turn sent and the counter advanced.
    Advanced { turn_index: u64, fallback: bool },
    /// Turn sent, but another driver had already advanced the counter.
    Duplicate { turn_index: u64 },
    /// Turn sent, but the pair stopped running before the commit.
    Uncommitted { turn_index: u64 },
    /// The pair changed (status or counter) since the driver looked at it.
    Superseded,
    /// The pair no longer exists.
    Gone,
    /// Another driver holds a live lease on the pair.
    LeaseHeld,
    /// Cancelled during the typing delay, before anything was sent.
    Cancelled,
    /// Retry soon: channel hiccup, timeout, storage error.
    Transient(String),
    /// Retrying will not help until an operator fixes the configuration.
    ConfigError(String),
    ScriptExhausted,
}

impl AdvanceOutcome {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Duplicate { .. } => "duplicate",
            Self::Uncommitted { .. } => "uncommitted",
            Self::Superseded => "superseded",
            Self::Gone => "gone",
            Self::LeaseHeld => "lease_held",
            Self::Cancelled => "cancelled",
            Self::Transient(_) => "transient",
            Self::ConfigError(_) => "config_error",
            Self::ScriptExhausted => "script_exhausted",
        }
    }
}

/// Runs advance steps against the shared store.
pub(crate) struct Advancer {
    store: Arc<dyn PairStore>,
    identities: Arc<dyn IdentityResolver>,
    generator: ContentGenerator,
    dispatcher: Dispatcher,
    typing: (Duration, Duration),
}

impl std::fmt::Debug for Advancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advancer")
            .field("generator", &self.generator)
            .field("dispatcher", &self.dispatcher)
            .field("typing", &self.typing)
            .finish_non_exhaustive()
    }
}

impl Advancer {
    pub(crate) fn new(
        store: Arc<dyn PairStore>,
        identities: Arc<dyn IdentityResolver>,
        generator: ContentGenerator,
        dispatcher: Dispatcher,
        pacing: &PacingConfig,
    ) -> Self {
        Self {
            store,
            identities,
            generator,
            dispatcher,
            typing: pacing.typing_delay(),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn PairStore> {
        &self.store
    }

    /// Advance `observed` by one turn on behalf of `holder`.
    ///
    /// Takes (or renews) the pair lease for `lease_ttl`; releasing it is the
    /// caller's business. `cancel` only interrupts the typing delay.
    pub(crate) async fn advance(
        &self,
        observed: &Pair,
        driver: DriverKind,
        holder: &str,
        lease_ttl: Duration,
        cancel: &CancellationToken,
    ) -> AdvanceOutcome {
        let counter = observed.turn_counter;
        let span = info_span!(
            "pair_turn",
            pair.id = %observed.id,
            turn = counter,
            speaker = %select_speaker(counter),
            driver = %driver,
        );

        async {
            let outcome = self
                .advance_inner(observed, driver, holder, lease_ttl, cancel)
                .await;
            debug!(outcome = outcome.as_str(), "advance finished");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn advance_inner(
        &self,
        observed: &Pair,
        driver: DriverKind,
        holder: &str,
        lease_ttl: Duration,
        cancel: &CancellationToken,
    ) -> AdvanceOutcome {
        let id = observed.id.as_str();
        let ttl = chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::MAX);

        match self.store.try_acquire_lease(id, holder, ttl, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => return AdvanceOutcome::LeaseHeld,
            Err(StoreError::NotFound(_)) => return AdvanceOutcome::Gone,
            Err(e) => return AdvanceOutcome::Transient(e.to_string()),
        }

        let pair = match self.store.get(id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return AdvanceOutcome::Gone,
            Err(e) => return AdvanceOutcome::Transient(e.to_string()),
        };
        if !pair.is_schedulable() || pair.turn_counter != observed.turn_counter {
            debug!(
                status = %pair.status,
                active = pair.active,
                counter = pair.turn_counter,
                "pair changed since observed"
            );
            return AdvanceOutcome::Superseded;
        }

        let counter = pair.turn_counter;
        let speaker = select_speaker(counter);
        let from = pair.member(speaker).to_owned();
        let to = pair.member(speaker.other()).to_owned();

        let generated = match self.content(&pair, speaker, &from).await {
            Ok(generated) => generated,
            Err(outcome) => return outcome,
        };

        let typing = pacing::sample_delay(&mut rand::rng(), self.typing.0, self.typing.1);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return AdvanceOutcome::Cancelled,
            () = tokio::time::sleep(typing) => {}
        }

        let (content, fallback) = generated;
        if let Err(e) = self.dispatcher.send(&from, &to, &content.content).await {
            return if e.is_transient() {
                warn!(error = %e, "dispatch failed, will retry");
                AdvanceOutcome::Transient(e.to_string())
            } else {
                AdvanceOutcome::ConfigError(e.to_string())
            };
        }

        let commit = TurnCommit {
            expected_counter: counter,
            at: Utc::now(),
            cursor: content.cursor,
        };
        let mut metadata = TurnMetadata {
            model: content.model.clone(),
            input_tokens: content.usage.input_tokens,
            output_tokens: content.usage.output_tokens,
            fallback,
            committed: false,
            duplicate: false,
        };

        let outcome = match self.store.advance_turn(id, &commit).await {
            Ok(advanced) => {
                metadata.committed = true;
                info!(counter = advanced.turn_counter, fallback, "turn advanced");
                AdvanceOutcome::Advanced {
                    turn_index: counter,
                    fallback,
                }
            }
            Err(StoreError::Conflict { actual, .. }) => {
                metadata.duplicate = true;
                warn!(
                    expected = counter,
                    actual, "duplicate turn: counter already advanced by another driver"
                );
                AdvanceOutcome::Duplicate {
                    turn_index: counter,
                }
            }
            Err(StoreError::NotRunning { status, .. }) => {
                info!(%status, "pair stopped while turn was in flight");
                AdvanceOutcome::Uncommitted {
                    turn_index: counter,
                }
            }
            Err(StoreError::NotFound(_)) => return AdvanceOutcome::Gone,
            Err(e) => {
                error!(error = %e, "failed to commit turn");
                AdvanceOutcome::Transient(e.to_string())
            }
        };

        let turn = Turn {
            pair_id: id.to_owned(),
            turn_index: counter,
            from_member: from,
            to_member: to,
            content: content.content,
            timestamp: commit.at,
            driver,
            metadata,
        };
        if let Err(e) = self.store.append_turn(&turn).await {
            warn!(error = %e, "failed to record turn");
        }

        outcome
    }

    /// Generate content for `speaker`, substituting a fallback phrase when the
    /// completion fails.
    async fn content(
        &self,
        pair: &Pair,
        speaker: Speaker,
        from: &str,
    ) -> Result<(Generated, bool), AdvanceOutcome> {
        let identity = self
            .identities
            .resolve(from)
            .await
            .map_err(|e| AdvanceOutcome::ConfigError(e.to_string()))?;

        let history = self
            .store
            .recent_turns(&pair.id, self.generator.history_limit())
            .await
            .map_err(|e| AdvanceOutcome::Transient(e.to_string()))?;

        match self
            .generator
            .generate(pair, speaker, &identity, &history)
            .await
        {
            Ok(generated) => Ok((generated, false)),
            Err(GenerateError::Failed(reason)) => {
                warn!(reason = %reason, "generation failed, using fallback phrase");
                let phrase = self.generator.fallback_phrase(pair.turn_counter);
                Ok((
                    Generated {
                        content: phrase,
                        cursor: None,
                        model: None,
                        usage: matura_core::Usage::default(),
                    },
                    true,
                ))
            }
            Err(GenerateError::ScriptExhausted { script_id }) => {
                info!(script_id = %script_id, "script exhausted");
                Err(AdvanceOutcome::ScriptExhausted)
            }
            Err(e @ (GenerateError::UnknownScript { .. } | GenerateError::MissingBehavior { .. })) => {
                Err(AdvanceOutcome::ConfigError(e.to_string()))
            }
        }
    }
}
