//! SMTP transport backed by lettre's async tokio transport.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use courier_common::config::SmtpConfig;

use crate::classify::classify_smtp_error;
use crate::{DeliveryOutcome, OutgoingEmail, Transport};

/// Delivers notifications through a single SMTP relay.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpTransport {
    /// Build the transport from configuration. Does not connect.
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let address: Address = config
            .email
            .parse()
            .map_err(|e| anyhow::anyhow!("SMTP_EMAIL '{}' is not a valid address: {}", config.email, e))?;
        let sender = Mailbox::new(Some(config.name.clone()), address);

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
        };
        builder = builder.port(config.port).timeout(Some(config.timeout));

        if let (Some(login), Some(password)) = (&config.login, &config.password) {
            builder = builder.credentials(Credentials::new(login.clone(), password.clone()));
        }

        tracing::debug!(
            host = %config.host,
            port = config.port,
            starttls = config.starttls,
            "SMTP transport configured"
        );

        Ok(Self {
            mailer: builder.build(),
            sender,
        })
    }

    /// Open a connection to the relay and issue `NOOP`; used as a startup check.
    pub async fn verify(&self) -> anyhow::Result<()> {
        let reachable = self
            .mailer
            .test_connection()
            .await
            .map_err(|e| anyhow::anyhow!("SMTP relay unreachable: {}", e))?;

        if !reachable {
            anyhow::bail!("SMTP relay refused the connection test");
        }

        tracing::info!("Connected to SMTP relay");
        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome {
        let message = match render_message(&self.sender, email) {
            Ok(message) => message,
            Err(outcome) => return outcome,
        };

        match self.mailer.send(message).await {
            Ok(response) => {
                tracing::debug!(
                    notification_id = %email.notification_id,
                    code = %response.code(),
                    "Relay accepted message"
                );
                DeliveryOutcome::Success
            }
            Err(e) => classify_smtp_error(&e),
        }
    }
}

/// Render an [`OutgoingEmail`] into a plain-text MIME message.
///
/// A recipient that does not parse as an address is a permanent failure.
pub fn render_message(sender: &Mailbox, email: &OutgoingEmail) -> Result<Message, DeliveryOutcome> {
    let recipient: Address = email.recipient.parse().map_err(|e| {
        DeliveryOutcome::PermanentFailure(format!(
            "invalid recipient '{}': {}",
            email.recipient, e
        ))
    })?;

    let message_id = format!("<{}@{}>", email.notification_id, sender.email.domain());

    Message::builder()
        .from(sender.clone())
        .to(Mailbox::new(None, recipient))
        .subject(email.subject.clone())
        .message_id(Some(message_id))
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())
        .map_err(|e| DeliveryOutcome::PermanentFailure(format!("message rejected by builder: {}", e)))
}
