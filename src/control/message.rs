//! Control-plane message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transform::DEFAULT_CAPTION;

/// Delivery guarantee requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    ReliableOrdered,
}

/// Outgoing message addressed to one participant
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub destination: String,
    pub payload: Bytes,
    pub mode: DeliveryMode,
}

impl ControlMessage {
    pub fn new(destination: &str, payload: Bytes) -> Self {
        Self {
            destination: destination.to_string(),
            payload,
            mode: DeliveryMode::ReliableOrdered,
        }
    }
}

/// Message delivered to the local participant
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub sender: String,
    pub payload: Bytes,
}

impl ReceivedMessage {
    /// Interpret the payload as a prompt command
    pub fn prompt(&self) -> Result<PromptCommand, serde_json::Error> {
        PromptCommand::decode(&self.payload)
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

fn default_prompt() -> String {
    DEFAULT_CAPTION.to_string()
}

/// `{"prompt": "..."}`; a missing prompt means the default caption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptCommand {
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl PromptCommand {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_wire_format() {
        let bytes = PromptCommand::new("sketch lines").encode().unwrap();
        assert_eq!(&bytes[..], br#"{"prompt":"sketch lines"}"#);
    }

    #[test]
    fn test_missing_prompt_uses_default() {
        let command = PromptCommand::decode(br#"{"style": 3}"#).unwrap();
        assert_eq!(command.prompt, DEFAULT_CAPTION);
    }

    #[test]
    fn test_received_message() {
        let message = ReceivedMessage {
            sender: "browser".into(),
            payload: Bytes::from_static(b"not json"),
        };
        assert!(message.prompt().is_err());
        assert_eq!(message.text(), Some("not json"));
    }
}
