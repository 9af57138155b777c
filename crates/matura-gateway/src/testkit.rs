#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use matura_core::fakes::{FakeChannel, FakeProvider, MemoryPairStore, StaticIdentities, StaticScripts, identity};
use matura_core::{
    Channel, ChannelError, ChannelHealth, IdentityResolver, OutboundMessage, PairStore, Provider,
    ScriptSource,
};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

use crate::advance::Advancer;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::generator::ContentGenerator;

/// Fakes wired together the way `main` wires the real collaborators.
pub(crate) struct Harness {
    pub store: Arc<MemoryPairStore>,
    pub channel: Arc<FakeChannel>,
    pub provider: Arc<FakeProvider>,
    pub identities: Arc<StaticIdentities>,
    pub scripts: Arc<StaticScripts>,
    pub config: Config,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let mut noaddr = identity("noaddr", "", "chip-x");
        noaddr.address = None;

        let identities = StaticIdentities::new([
            identity("alice", "+55 11 90000-0001", "chip-a"),
            identity("bob", "5511900000002", "chip-b"),
            identity("carol", "5511900000003", "chip-c"),
            identity("dave", "5511900000004", "chip-d"),
            noaddr,
        ]);

        let mut config = Config::default();
        config.pacing.min_delay_ms = 1_000;
        config.pacing.max_delay_ms = 2_000;
        config.pacing.typing_min_ms = 0;
        config.pacing.typing_max_ms = 0;
        config.pacing.retry_backoff_ms = 100;
        config.pacing.max_config_backoff_ms = 800;
        config.pacing.config_error_threshold = 3;
        config.lease.loop_ttl_ms = 10_000;
        config.lease.sweep_ttl_ms = 5_000;
        config.generation.fallback_phrases =
            vec!["haha".to_owned(), "sim".to_owned(), "boa".to_owned()];

        Self {
            store: Arc::new(MemoryPairStore::new()),
            channel: Arc::new(FakeChannel::new("fake")),
            provider: Arc::new(FakeProvider::new("tudo certo por aqui")),
            identities: Arc::new(identities),
            scripts: Arc::new(StaticScripts::new().with("intro", &["one", "two", "three"])),
            config,
        }
    }

    pub(crate) fn pair_store(&self) -> Arc<dyn PairStore> {
        Arc::clone(&self.store) as Arc<dyn PairStore>
    }

    pub(crate) fn advancer(&self) -> Arc<Advancer> {
        self.advancer_with(
            Arc::clone(&self.channel) as Arc<dyn Channel>,
            Arc::clone(&self.provider) as Arc<dyn Provider>,
        )
    }

    pub(crate) fn advancer_with(
        &self,
        channel: Arc<dyn Channel>,
        provider: Arc<dyn Provider>,
    ) -> Arc<Advancer> {
        let identities = Arc::clone(&self.identities) as Arc<dyn IdentityResolver>;
        let generator = ContentGenerator::new(
            provider,
            Arc::clone(&self.scripts) as Arc<dyn ScriptSource>,
            self.config.generation.clone(),
        );
        let dispatcher = Dispatcher::new(
            channel,
            Arc::clone(&identities),
            self.config.dispatch.timeout(),
        );
        Arc::new(Advancer::new(
            self.pair_store(),
            identities,
            generator,
            dispatcher,
            &self.config.pacing,
        ))
    }
}

/// Channel whose sends rendezvous on two barriers: one when the send
/// arrives, one before it returns.
pub(crate) struct GatedChannel {
    arrived: Barrier,
    release: Barrier,
    outbound: Mutex<Vec<OutboundMessage>>,
}

impl GatedChannel {
    pub(crate) fn new(parties: usize) -> Self {
        Self {
            arrived: Barrier::new(parties),
            release: Barrier::new(parties),
            outbound: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn wait_for_send(&self) {
        self.arrived.wait().await;
    }

    pub(crate) async fn release(&self) {
        self.release.wait().await;
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for GatedChannel {
    fn id(&self) -> &'static str {
        "gated"
    }

    async fn send_text(
        &self,
        instance: &str,
        address: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.outbound.lock().unwrap().push(OutboundMessage {
            instance: instance.to_owned(),
            address: address.to_owned(),
            content: text.to_owned(),
        });
        self.arrived.wait().await;
        self.release.wait().await;
        Ok(())
    }

    async fn probe(&self) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}
