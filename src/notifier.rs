//! Outbound mail for dispatch tasks.
//!
//! [`Notifier`] sends one fixed body to every recipient over a single session
//! and reports one coarse outcome for the whole batch. The session itself is
//! behind [`MailTransport`]; [`SmtpMailer`] is the SMTP implementation.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::{
    address::AddressError,
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        PoolConfig,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info, instrument, warn};

use crate::config::SmtpConfig;

pub const SENT_MESSAGE: &str = "The message was sent successfully!";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("{0} check your login or password please!")]
    Session(String),
    #[error("failed to deliver to {recipient}: {reason}")]
    Delivery { recipient: String, reason: String },
    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: AddressError,
    },
    #[error("could not build message: {0}")]
    Message(#[from] lettre::error::Error),
}

/// One authenticated mail session.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Connects and authenticates.
    async fn open(&self) -> Result<(), NotifyError>;
    async fn deliver(&self, recipient: &str, body: &str) -> Result<(), NotifyError>;
}

pub struct Notifier {
    transport: Arc<dyn MailTransport>,
    body: String,
}

impl Notifier {
    pub fn new(transport: Arc<dyn MailTransport>, body: impl Into<String>) -> Self {
        Self {
            transport,
            body: body.into(),
        }
    }

    /// Sends the body to each recipient in order. The first failure ends the
    /// batch; nothing is retried.
    #[instrument(skip_all, fields(recipients = recipients.len()))]
    pub async fn notify(&self, recipients: &[String]) -> Result<String, NotifyError> {
        if recipients.is_empty() {
            debug!("No recipients, nothing to send");
            return Ok(SENT_MESSAGE.to_string());
        }

        self.transport.open().await?;

        for (sent, recipient) in recipients.iter().enumerate() {
            debug!(message = "Sending", recipient = %recipient);
            if let Err(err) = self.transport.deliver(recipient, &self.body).await {
                warn!(message = "Batch aborted", sent, error = %err);
                return Err(err);
            }
        }

        info!(message = "Batch sent", sent = recipients.len());
        Ok(SENT_MESSAGE.to_string())
    }
}

/// SMTP over STARTTLS with PLAIN authentication.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    subject: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from = config
            .user
            .parse::<Mailbox>()
            .map_err(|source| NotifyError::Address {
                address: config.user.clone(),
                source,
            })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|err| NotifyError::Session(err.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(
                config.user.clone(),
                config.password.clone(),
            ))
            .authentication(vec![Mechanism::Plain])
            // one connection carries the whole batch
            .pool_config(PoolConfig::new().max_size(1))
            .build();

        Ok(Self {
            transport,
            from,
            subject: config.subject.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn open(&self) -> Result<(), NotifyError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NotifyError::Session(
                "SMTP server rejected the connection.".to_string(),
            )),
            Err(err) => Err(NotifyError::Session(err.to_string())),
        }
    }

    async fn deliver(&self, recipient: &str, body: &str) -> Result<(), NotifyError> {
        let to = recipient
            .parse::<Mailbox>()
            .map_err(|source| NotifyError::Address {
                address: recipient.to_string(),
                source,
            })?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(self.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        self.transport
            .send(message)
            .await
            .map_err(|err| NotifyError::Delivery {
                recipient: recipient.to_string(),
                reason: err.to_string(),
            })?;

        Ok(())
    }
}
