use async_trait::async_trait;
use matura_core::{Channel, ChannelError, ChannelHealth, OutboundMessage};
use tokio::sync::mpsc;

/// In-process channel: every send lands on an mpsc receiver instead of a
/// messaging server. Used for dry runs and local testing.
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct LoopbackChannel {
    id: String,
    tx: mpsc::Sender<OutboundMessage>,
}

/// Receiving side of a [`LoopbackChannel`].
#[allow(missing_debug_implementations)] // contains mpsc channels
pub struct LoopbackHandle {
    pub rx: mpsc::Receiver<OutboundMessage>,
}

/// Create a linked pair of (LoopbackChannel, LoopbackHandle).
/// Messages sent through the channel are received by `LoopbackHandle.rx`.
pub fn loopback_pair(buffer: usize) -> (LoopbackChannel, LoopbackHandle) {
    let (tx, rx) = mpsc::channel(buffer);
    let channel = LoopbackChannel {
        id: "loopback".to_owned(),
        tx,
    };
    (channel, LoopbackHandle { rx })
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_text(
        &self,
        instance: &str,
        address: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.tx
            .send(OutboundMessage {
                instance: instance.to_owned(),
                address: address.to_owned(),
                content: text.to_owned(),
            })
            .await
            .map_err(|_send_err| ChannelError::Fatal("loopback receiver dropped".to_owned()))
    }

    async fn probe(&self) -> ChannelHealth {
        if self.tx.is_closed() {
            ChannelHealth::Unhealthy("channel closed".to_owned())
        } else {
            ChannelHealth::Healthy
        }
    }
}
