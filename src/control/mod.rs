//! Control channel
//!
//! Reliable, ordered messages between participants, used to steer the
//! transform (prompts). Sending requires a connected session: nothing is
//! queued while disconnected or reconnecting, and failures are not retried.

pub mod message;

pub use message::{ControlMessage, DeliveryMode, PromptCommand, ReceivedMessage};

use bytes::Bytes;

use crate::error::DeliveryError;
use crate::session::{ConnectionState, SessionManager, Subscription};

#[derive(Clone)]
pub struct ControlChannel {
    manager: SessionManager,
}

impl ControlChannel {
    pub(crate) fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Send `payload` to the participant `destination`
    pub async fn send(&self, destination: &str, payload: Bytes) -> Result<(), DeliveryError> {
        self.send_message(ControlMessage::new(destination, payload)).await
    }

    pub async fn send_message(&self, message: ControlMessage) -> Result<(), DeliveryError> {
        let state = self.manager.state();
        if state != ConnectionState::Connected {
            return Err(DeliveryError::NotConnected(state));
        }
        let link = self
            .manager
            .link()
            .ok_or(DeliveryError::NotConnected(state))?;

        let len = message.payload.len();
        link.send_data(&message.destination, message.payload).await?;
        tracing::debug!(
            "Sent {} bytes to {} ({:?})",
            len,
            message.destination,
            message.mode
        );
        Ok(())
    }

    /// Send `{"prompt": prompt}` to `destination`
    pub async fn send_prompt(&self, destination: &str, prompt: &str) -> Result<(), DeliveryError> {
        let payload = PromptCommand::new(prompt).encode()?;
        self.send(destination, payload).await?;
        tracing::info!("Prompt sent to {}: {:?}", destination, prompt);
        Ok(())
    }

    /// Called once per received message, in arrival order
    pub fn on_message(&self, callback: impl Fn(&ReceivedMessage) + Send + Sync + 'static) -> Subscription {
        self.manager.message_observers().register(callback)
    }
}
