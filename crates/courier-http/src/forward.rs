//! Pub/sub to HTTP forwarding

use async_trait::async_trait;
use courier_mesh::{AgentId, Envelope, Sender, Subscriber};
use std::sync::Arc;
use tracing::debug;

/// Subscriber standing in for a remote agent
///
/// Matches envelopes addressed to the agent or broadcast and delivers each
/// one with its [`Sender`]. A transport failure or a non-2xx answer is
/// reported as a handler failure; nothing is retried.
pub struct ForwardingSubscriber {
    agent: AgentId,
    sender: Arc<dyn Sender>,
    label: String,
}

impl ForwardingSubscriber {
    pub fn new(agent: AgentId, sender: Arc<dyn Sender>) -> Self {
        let label = format!("forward:{agent}");
        Self {
            agent,
            sender,
            label,
        }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }
}

#[async_trait]
impl Subscriber for ForwardingSubscriber {
    fn is_intended_for_me(&self, envelope: &Envelope) -> bool {
        envelope.is_addressed_to(&self.agent)
    }

    async fn handle_message(&self, envelope: Envelope) -> Result<(), String> {
        let delivery = self
            .sender
            .send(&envelope)
            .await
            .map_err(|e| e.to_string())?;

        if !delivery.is_success() {
            return Err(format!(
                "{} rejected envelope with status {}",
                self.agent, delivery.status
            ));
        }

        debug!(agent = %self.agent, status = delivery.status, "Forwarded envelope");
        Ok(())
    }

    fn label(&self) -> &str {
        &self.label
    }
}
