//! Delivery transports handing forwarded messages to the outside world.

use std::{future::Future, pin::Pin};

use lettre::{
    address::Envelope, transport::smtp::authentication::Credentials, Address, AsyncSmtpTransport,
    AsyncTransport, Tokio1Executor,
};
use thiserror::Error;
use tracing::{debug, error, info};

/// Boxed future type for deliveries, enabling object safety.
pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;

/// Errors raised while handing a message to the transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The envelope could not be built from the given addresses.
    #[error("Invalid envelope: {0}")]
    Envelope(String),

    /// The transport refused or failed to accept the message.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Trait for transports that accept a fully formed message.
pub trait DeliveryTransport: Send + Sync {
    /// Sends the raw message to the recipients with the given envelope sender.
    fn send<'a>(
        &'a self,
        raw: &'a [u8],
        recipients: &'a [String],
        envelope_sender: &'a str,
    ) -> DeliveryFuture<'a>;

    /// Returns the name of this transport.
    fn name(&self) -> &str;
}

/// Builds an SMTP envelope, an empty sender becomes the null reverse path.
pub fn build_envelope(
    envelope_sender: &str,
    recipients: &[String],
) -> Result<Envelope, DeliveryError> {
    let sender = if envelope_sender.is_empty() {
        None
    } else {
        Some(parse_address(envelope_sender)?)
    };
    let recipients = recipients
        .iter()
        .map(|recipient| parse_address(recipient))
        .collect::<Result<Vec<_>, _>>()?;
    Envelope::new(sender, recipients).map_err(|e| DeliveryError::Envelope(e.to_string()))
}

fn parse_address(address: &str) -> Result<Address, DeliveryError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|e| DeliveryError::Envelope(format!("{address}: {e}")))
}

/// Transport relaying messages through an SMTP server.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpTransport {
    /// Creates a new [`SmtpTransport`] for the given relay.
    ///
    /// With `starttls` the connection is upgraded before authenticating,
    /// otherwise the relay is contacted in plain text.
    pub fn new(
        host: &str,
        port: u16,
        starttls: bool,
        credentials: Option<(String, String)>,
    ) -> Result<Self, DeliveryError> {
        let builder = if starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(|e| {
                error!(host = %host, error = %e, "Failed to create SMTP relay");
                DeliveryError::Transport(e.to_string())
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let mut builder = builder.port(port);
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }
        info!(host = %host, port = port, starttls = starttls, "SMTP transport initialized");
        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
        })
    }
}

impl DeliveryTransport for SmtpTransport {
    fn send<'a>(
        &'a self,
        raw: &'a [u8],
        recipients: &'a [String],
        envelope_sender: &'a str,
    ) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let envelope = build_envelope(envelope_sender, recipients)?;
            let response = self.transport.send_raw(&envelope, raw).await.map_err(|e| {
                error!(host = %self.host, error = %e, "SMTP relay rejected message");
                DeliveryError::Transport(e.to_string())
            })?;
            debug!(
                host = %self.host,
                code = %response.code(),
                recipients = recipients.len(),
                "SMTP relay accepted message"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

/// Transport that only logs what would have been sent.
#[derive(Debug, Default)]
pub struct LogTransport;

impl DeliveryTransport for LogTransport {
    fn send<'a>(
        &'a self,
        raw: &'a [u8],
        recipients: &'a [String],
        envelope_sender: &'a str,
    ) -> DeliveryFuture<'a> {
        Box::pin(async move {
            build_envelope(envelope_sender, recipients)?;
            info!(
                sender = %envelope_sender,
                recipients = ?recipients,
                size = raw.len(),
                "Dry run delivery"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}
