//! Alias resolution against an external directory.
//!
//! A directory maps an inbound address to the mailbox behind it, together
//! with the reputation counters kept for that mailbox. Resolution applies
//! the suppression rules on top of the raw lookup so that complained,
//! bouncing or opted-out mailboxes never receive forwards.

use std::{future::Future, pin::Pin};

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ResolvedRecipient;

/// Boxed future type for directory lookups, enabling object safety.
pub type LookupFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<AliasRecord>, LookupError>> + Send + 'a>>;

/// Errors raised by a single alias lookup.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The directory could not be reached.
    #[error("Lookup transport error: {0}")]
    Transport(String),

    /// The directory answered with something that is not an alias record.
    #[error("Lookup decode error: {0}")]
    Decode(String),
}

/// Forwarding record kept by the directory for an alias.
///
/// Counters and flags are stored loosely by the directory, numbers, booleans
/// and null are all accepted and read as "truthy" values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AliasRecord {
    /// Mailbox the alias forwards to.
    #[serde(default)]
    pub email: String,

    #[serde(default, deserialize_with = "de_count")]
    pub count_bounce: u64,

    #[serde(default, deserialize_with = "de_count")]
    pub count_complaint: u64,

    #[serde(default, deserialize_with = "de_flag")]
    pub optout: bool,
}

impl AliasRecord {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl Loose {
    fn as_count(&self) -> u64 {
        match self {
            Loose::Bool(value) => u64::from(*value),
            Loose::Unsigned(value) => *value,
            Loose::Float(value) if *value > 0.0 => value.ceil() as u64,
            Loose::Float(_) => 0,
            Loose::Text(value) => value.trim().parse().unwrap_or(u64::from(!value.is_empty())),
        }
    }
}

fn de_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Option::<Loose>::deserialize(deserializer)?;
    Ok(value.map(|value| value.as_count()).unwrap_or(0))
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    de_count(deserializer).map(|count| count > 0)
}

/// Suppression rules applied to every looked up record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppressionPolicy {
    /// Records with more bounces than this are suppressed.
    pub max_bounces: u64,
}

impl Default for SuppressionPolicy {
    fn default() -> Self {
        Self { max_bounces: 3 }
    }
}

impl SuppressionPolicy {
    /// Returns the reason a record must not receive forwards, if any.
    pub fn suppression_reason(&self, record: &AliasRecord) -> Option<&'static str> {
        if record.email.is_empty() {
            Some("empty target")
        } else if record.count_complaint > 0 {
            Some("complaint")
        } else if record.count_bounce > self.max_bounces {
            Some("bounces")
        } else if record.optout {
            Some("optout")
        } else {
            None
        }
    }
}

/// Trait for directories that map aliases to forwarding records.
pub trait AliasDirectory: Send + Sync {
    /// Looks up an alias, returning `None` when it has no mapping.
    fn lookup<'a>(&'a self, address: &'a str) -> LookupFuture<'a>;

    /// Returns the name of this directory.
    fn name(&self) -> &str;
}

/// Resolves an original recipient into a forwarding decision.
///
/// The address is lower-cased before the lookup. Lookup failures never
/// escape, they degrade the recipient to [`ResolvedRecipient::Suppressed`].
pub async fn resolve_recipient(
    directory: &dyn AliasDirectory,
    policy: &SuppressionPolicy,
    address: &str,
) -> ResolvedRecipient {
    let alias = address.trim().to_lowercase();
    match directory.lookup(&alias).await {
        Ok(Some(record)) => match policy.suppression_reason(&record) {
            Some(reason) => {
                info!(
                    recipient = %alias,
                    target = %record.email,
                    reason = reason,
                    "Forward target suppressed"
                );
                ResolvedRecipient::Suppressed
            }
            None => {
                debug!(recipient = %alias, target = %record.email, "Resolved forward target");
                ResolvedRecipient::Forward(record.email)
            }
        },
        Ok(None) => {
            info!(recipient = %alias, directory = directory.name(), "No mapping for alias");
            ResolvedRecipient::Suppressed
        }
        Err(e) => {
            warn!(
                recipient = %alias,
                directory = directory.name(),
                error = %e,
                "Alias lookup failed"
            );
            ResolvedRecipient::Suppressed
        }
    }
}
