use matura_channels::normalize_address;
use matura_core::{ChannelEvent, IdentityResolver, Pair, PairPatch, PairStatus, PairStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub(crate) enum InboundOutcome {
    Ignored { reason: &'static str },
    Matched { pair_id: String, woke: bool },
}

/// Marks replies between pair members as seen and, optionally, wakes the
/// pair's loop early.
pub(crate) struct ReplyListener {
    store: Arc<dyn PairStore>,
    identities: Arc<dyn IdentityResolver>,
    supervisor: Option<Arc<Supervisor>>,
    wake_on_reply: bool,
}

impl std::fmt::Debug for ReplyListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyListener")
            .field("wake_on_reply", &self.wake_on_reply)
            .finish_non_exhaustive()
    }
}

impl ReplyListener {
    pub(crate) fn new(
        store: Arc<dyn PairStore>,
        identities: Arc<dyn IdentityResolver>,
        supervisor: Option<Arc<Supervisor>>,
        wake_on_reply: bool,
    ) -> Self {
        Self {
            store,
            identities,
            supervisor,
            wake_on_reply,
        }
    }

    pub(crate) async fn on_inbound(&self, event: &ChannelEvent) -> InboundOutcome {
        if event.from_me {
            return InboundOutcome::Ignored { reason: "from_me" };
        }
        let Ok(sender) = normalize_address(&event.from_address) else {
            debug!(from = %event.from_address, "inbound from unparseable address");
            return InboundOutcome::Ignored {
                reason: "bad_address",
            };
        };

        let pairs = match self.store.list_by_status(PairStatus::Running).await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(error = %e, "failed to list pairs for inbound event");
                return InboundOutcome::Ignored {
                    reason: "store_error",
                };
            }
        };

        for pair in pairs.iter().filter(|p| p.active && p.waiting_for_reply) {
            if !self.is_reply(pair, &event.instance, &sender).await {
                continue;
            }

            let patch = PairPatch {
                waiting_for_reply: Some(false),
                ..PairPatch::default()
            };
            if let Err(e) = self.store.update(&pair.id, &patch).await {
                warn!(pair.id = %pair.id, error = %e, "failed to clear waiting_for_reply");
            }

            let woke = self.wake_on_reply
                && self
                    .supervisor
                    .as_ref()
                    .is_some_and(|s| s.wake(&pair.id));
            info!(pair.id = %pair.id, instance = %event.instance, woke, "reply received");
            return InboundOutcome::Matched {
                pair_id: pair.id.clone(),
                woke,
            };
        }

        InboundOutcome::Ignored { reason: "no_pair" }
    }

    /// The event arrived on the next speaker's instance, sent from the
    /// address of the member who spoke last.
    async fn is_reply(&self, pair: &Pair, instance: &str, sender: &str) -> bool {
        let next = pair.next_speaker();
        let (Ok(receiver), Ok(last)) = (
            self.identities.resolve(pair.member(next)).await,
            self.identities.resolve(pair.member(next.other())).await,
        ) else {
            return false;
        };

        receiver.instance.as_deref() == Some(instance)
            && last
                .address
                .as_deref()
                .and_then(|a| normalize_address(a).ok())
                .is_some_and(|a| a == sender)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair_loop::LoopSettings;
    use crate::testkit::Harness;
    use chrono::Utc;
    use matura_core::DriverKind;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn event(instance: &str, from: &str, from_me: bool) -> ChannelEvent {
        ChannelEvent {
            instance: instance.to_owned(),
            from_address: from.to_owned(),
            content: "oi".to_owned(),
            from_me,
            timestamp: Utc::now(),
        }
    }

    fn listener(h: &Harness, supervisor: Option<Arc<Supervisor>>, wake: bool) -> ReplyListener {
        ReplyListener::new(
            h.pair_store(),
            Arc::clone(&h.identities) as Arc<dyn IdentityResolver>,
            supervisor,
            wake,
        )
    }

    async fn advance_once(h: &Harness, id: &str) {
        let pair = h.store.pair(id).unwrap();
        h.advancer()
            .advance(
                &pair,
                DriverKind::Loop,
                "loop:t",
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;
    }

    #[tokio::test]
    async fn reply_from_last_speaker_clears_flag() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        advance_once(&h, "p1").await;
        assert!(h.store.pair("p1").unwrap().waiting_for_reply);

        // Alice spoke; bob (next speaker) receives on chip-b from alice's number.
        let outcome = listener(&h, None, false)
            .on_inbound(&event("chip-b", "5511900000001@s.whatsapp.net", false))
            .await;
        assert_eq!(
            outcome,
            InboundOutcome::Matched {
                pair_id: "p1".to_owned(),
                woke: false
            }
        );
        assert!(!h.store.pair("p1").unwrap().waiting_for_reply);
    }

    #[tokio::test]
    async fn unrelated_events_are_ignored() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        advance_once(&h, "p1").await;
        let l = listener(&h, None, false);

        let cases = [
            (event("chip-b", "5511900000001", true), "from_me"),
            (event("chip-b", "not-a-number", false), "bad_address"),
            // Wrong direction: alice's own instance receiving from bob.
            (event("chip-a", "5511900000002", false), "no_pair"),
            (event("chip-b", "5511999999999", false), "no_pair"),
        ];
        for (ev, reason) in cases {
            assert_eq!(l.on_inbound(&ev).await, InboundOutcome::Ignored { reason });
        }
        assert!(h.store.pair("p1").unwrap().waiting_for_reply);
    }

    #[tokio::test]
    async fn pair_not_waiting_is_ignored() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 1);
        let outcome = listener(&h, None, false)
            .on_inbound(&event("chip-b", "5511900000001", false))
            .await;
        assert_eq!(outcome, InboundOutcome::Ignored { reason: "no_pair" });
    }

    #[tokio::test(start_paused = true)]
    async fn reply_wakes_supervised_loop_when_enabled() {
        let mut h = Harness::new();
        h.config.pacing.min_delay_ms = 60_000;
        h.config.pacing.max_delay_ms = 60_000;
        h.store.insert_running("p1", "alice", "bob", 0);
        let supervisor = Arc::new(Supervisor::new(
            h.advancer(),
            LoopSettings::from_config(&h.config),
            CancellationToken::new(),
        ));
        supervisor.ensure_running("p1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.channel.sent_count(), 1);

        let outcome = listener(&h, Some(Arc::clone(&supervisor)), true)
            .on_inbound(&event("chip-b", "+55 11 90000-0001", false))
            .await;
        assert_eq!(
            outcome,
            InboundOutcome::Matched {
                pair_id: "p1".to_owned(),
                woke: true
            }
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.channel.sent_count(), 2);

        supervisor.shutdown().await;
    }
}
