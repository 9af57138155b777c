use matura_channels::normalize_address;
use matura_core::{Channel, DispatchError, IdentityResolver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info_span};

/// Where a dispatched message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DispatchAck {
    pub instance: String,
    pub address: String,
}

/// Sends a turn from one identity's instance to the other identity's address.
pub(crate) struct Dispatcher {
    channel: Arc<dyn Channel>,
    identities: Arc<dyn IdentityResolver>,
    timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channel", &self.channel.id())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        identities: Arc<dyn IdentityResolver>,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            identities,
            timeout,
        }
    }

    pub(crate) async fn send(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> Result<DispatchAck, DispatchError> {
        let instance = self.sender_instance(from).await?;
        let address = self.recipient_address(to).await?;

        let span = info_span!(
            "dispatch",
            channel = self.channel.id(),
            from,
            to,
            instance = %instance,
        );

        async {
            let send = self.channel.send_text(&instance, &address, text);
            match tokio::time::timeout(self.timeout, send).await {
                Ok(Ok(())) => {
                    debug!(content_len = text.len(), "turn dispatched");
                    Ok(DispatchAck { instance, address })
                }
                Ok(Err(error)) => Err(error.into()),
                Err(_elapsed) => Err(DispatchError::Transient(format!(
                    "send timed out after {}ms",
                    self.timeout.as_millis()
                ))),
            }
        }
        .instrument(span)
        .await
    }

    async fn sender_instance(&self, name: &str) -> Result<String, DispatchError> {
        let identity = self
            .identities
            .resolve(name)
            .await
            .map_err(|e| unresolvable(name, e))?;
        identity
            .instance
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| unresolvable(name, "no instance configured"))
    }

    async fn recipient_address(&self, name: &str) -> Result<String, DispatchError> {
        let identity = self
            .identities
            .resolve(name)
            .await
            .map_err(|e| unresolvable(name, e))?;
        let raw = identity
            .address
            .ok_or_else(|| unresolvable(name, "no address configured"))?;
        normalize_address(&raw).map_err(|e| unresolvable(name, e))
    }
}

fn unresolvable(name: &str, reason: impl std::fmt::Display) -> DispatchError {
    DispatchError::IdentityUnresolvable {
        name: name.to_owned(),
        reason: reason.to_string(),
    }
}
