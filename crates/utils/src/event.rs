//! Inbound mail notifications.
//!
//! A notification is the event emitted by the receiving mail service once a
//! raw message has been stored. Only the fields needed to locate the stored
//! message and its recipients are modelled, everything else is ignored.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{PipelineError, RawMessageRef};

/// Event source tag every accepted record must carry.
pub const EXPECTED_EVENT_SOURCE: &str = "aws:ses";

/// Event version tag every accepted record must carry.
pub const EXPECTED_EVENT_VERSION: &str = "1.0";

/// Wrapper around the notification records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(default)]
    pub event_source: Option<String>,

    #[serde(default)]
    pub event_version: Option<String>,

    #[serde(default)]
    pub ses: Option<MailDelivery>,
}

/// The mail-delivery payload of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailDelivery {
    pub mail: MailInfo,

    #[serde(default)]
    pub receipt: ReceiptInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailInfo {
    pub message_id: String,

    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptInfo {
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl InboundNotification {
    /// Parses a notification from its JSON text.
    ///
    /// Text that is not even a JSON object of the expected shape is reported
    /// as [`PipelineError::InvalidEvent`], the same way a structurally valid
    /// but unexpected notification is.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json).map_err(|e| {
            error!(error = %e, "Failed to parse inbound notification");
            PipelineError::InvalidEvent(format!("malformed notification: {e}"))
        })
    }

    /// Builds a single-record notification, mostly useful for tests and
    /// for replaying a stored message by hand.
    pub fn for_message(message_id: &str, recipients: &[&str]) -> Self {
        Self {
            records: vec![NotificationRecord {
                event_source: Some(EXPECTED_EVENT_SOURCE.to_string()),
                event_version: Some(EXPECTED_EVENT_VERSION.to_string()),
                ses: Some(MailDelivery {
                    mail: MailInfo {
                        message_id: message_id.to_string(),
                        source: None,
                    },
                    receipt: ReceiptInfo {
                        recipients: recipients.iter().map(|r| r.to_string()).collect(),
                    },
                }),
            }],
        }
    }

    /// Checks the notification shape and extracts the message reference.
    ///
    /// Exactly one record is accepted, and it must carry the expected event
    /// source and version tags.
    pub fn validate(&self) -> Result<RawMessageRef, PipelineError> {
        let [record] = self.records.as_slice() else {
            return Err(PipelineError::InvalidEvent(format!(
                "expected exactly one record, found {}",
                self.records.len()
            )));
        };

        if record.event_source.as_deref() != Some(EXPECTED_EVENT_SOURCE) {
            return Err(PipelineError::InvalidEvent(format!(
                "unexpected event source {:?}",
                record.event_source
            )));
        }

        if record.event_version.as_deref() != Some(EXPECTED_EVENT_VERSION) {
            return Err(PipelineError::InvalidEvent(format!(
                "unexpected event version {:?}",
                record.event_version
            )));
        }

        let Some(delivery) = &record.ses else {
            return Err(PipelineError::InvalidEvent(
                "record carries no mail delivery".to_string(),
            ));
        };

        if delivery.mail.message_id.is_empty() {
            return Err(PipelineError::InvalidEvent(
                "mail delivery has an empty message id".to_string(),
            ));
        }

        Ok(RawMessageRef {
            message_id: delivery.mail.message_id.clone(),
            source: delivery.mail.source.clone(),
            original_recipients: delivery.receipt.recipients.clone(),
        })
    }
}
