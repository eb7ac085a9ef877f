//! Message types flowing through the forwarding pipeline.
//!
//! [`RawMessageRef`] is what a validated inbound notification points at,
//! [`TransformedMessage`] is the rewritten result owned by the pipeline
//! until it is enqueued, and [`QueuedMessage`] is the JSON wire format
//! shared between the pipeline and the drainer.

use serde::{Deserialize, Serialize};

/// Reference to a raw message sitting in the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessageRef {
    /// Identifier of the stored raw message, used to build its content key.
    pub message_id: String,

    /// Envelope sender reported by the notification, if any.
    pub source: Option<String>,

    /// Recipients the message was originally addressed to, in order.
    pub original_recipients: Vec<String>,
}

/// Outcome of resolving one original recipient against the alias directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRecipient {
    /// The alias maps to a live forwarding target.
    Forward(String),
    /// No usable target: unknown alias, lookup failure or suppression.
    Suppressed,
}

impl ResolvedRecipient {
    /// Returns the forwarding target, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            ResolvedRecipient::Forward(target) => Some(target),
            ResolvedRecipient::Suppressed => None,
        }
    }
}

/// A message whose headers have been rewritten for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedMessage {
    pub message_id: String,

    /// Rewritten header block, including its trailing line terminator.
    pub header: String,

    /// Original body, starting with the blank separator line.
    pub body: String,

    /// Non-empty list of forwarding targets.
    pub recipients: Vec<String>,

    /// The alias the message was received on, used as envelope sender.
    pub original_recipient: String,
}

impl TransformedMessage {
    /// Returns the full message text (rewritten header followed by body).
    pub fn raw(&self) -> String {
        let mut raw = String::with_capacity(self.header.len() + self.body.len());
        raw.push_str(&self.header);
        raw.push_str(&self.body);
        raw
    }

    /// Builds the queue wire representation, the body is left behind and
    /// re-read from the content store by the drainer.
    pub fn to_queued(&self) -> QueuedMessage {
        QueuedMessage {
            header: self.header.clone(),
            message_id: self.message_id.clone(),
            recipients: self.recipients.clone(),
            original_recipient: self.original_recipient.clone(),
        }
    }
}

/// JSON representation of a forward sitting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub header: String,
    pub message_id: String,
    pub recipients: Vec<String>,
    pub original_recipient: String,
}

impl QueuedMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reassembles the full message from the queued header and the body
    /// re-fetched from the content store.
    pub fn assemble(&self, body: &str) -> String {
        let mut raw = String::with_capacity(self.header.len() + body.len());
        raw.push_str(&self.header);
        raw.push_str(body);
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformed() -> TransformedMessage {
        TransformedMessage {
            message_id: "o3vrnil0e2ic28trm7dakrc2v0clambda4nbp0g1".to_string(),
            header: "From: Jane <no-reply@x.com>\r\n".to_string(),
            body: "\r\nHello\r\n".to_string(),
            recipients: vec!["team@example.com".to_string()],
            original_recipient: "info@example.com".to_string(),
        }
    }

    #[test]
    fn test_queued_wire_format_field_names() {
        let json = transformed().to_queued().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["messageId"], "o3vrnil0e2ic28trm7dakrc2v0clambda4nbp0g1");
        assert_eq!(value["originalRecipient"], "info@example.com");
        assert_eq!(value["recipients"][0], "team@example.com");
        assert_eq!(value["header"], "From: Jane <no-reply@x.com>\r\n");
        assert!(value.get("body").is_none());
    }

    #[test]
    fn test_assemble_matches_transformed_raw() {
        let message = transformed();
        let queued = QueuedMessage::from_json(&message.to_queued().to_json().unwrap()).unwrap();
        assert_eq!(queued.assemble(&message.body), message.raw());
    }

    #[test]
    fn test_resolved_recipient_target() {
        assert_eq!(
            ResolvedRecipient::Forward("a@b.c".to_string()).target(),
            Some("a@b.c")
        );
        assert_eq!(ResolvedRecipient::Suppressed.target(), None);
    }
}
