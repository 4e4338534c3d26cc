use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::MailConfig;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to build email message: {0}")]
    MessageBuild(String),
    #[error("Failed to send email: {0}")]
    SendFailed(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError>;
}

/// Writes mail to the log instead of delivering it. Used when no SMTP relay
/// is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        info!(
            recipients = ?mail.recipients,
            subject = %mail.subject,
            "mail delivery disabled, logging message instead"
        );
        info!("{}", mail.html);
        Ok(())
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig, site_name: &str) -> Result<Self, MailError> {
        let from = format!("{} <{}>", site_name, config.from)
            .parse::<Mailbox>()
            .map_err(|e| MailError::ConfigError(format!("invalid sender address: {}", e)))?;

        let credentials = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| MailError::ConfigError(format!("SMTP starttls error: {}", e)))?
            .port(config.port)
            .credentials(credentials)
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(mail.subject)
            .header(ContentType::TEXT_HTML);

        for recipient in &mail.recipients {
            let mailbox = recipient
                .parse::<Mailbox>()
                .map_err(|e| MailError::MessageBuild(format!("invalid recipient: {}", e)))?;
            builder = builder.to(mailbox);
        }

        let message = builder
            .body(mail.html)
            .map_err(|e| MailError::MessageBuild(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::SendFailed(e.to_string()))?;

        info!(recipients = ?mail.recipients, "mail sent");
        Ok(())
    }
}

pub fn confirmation_email(recipient: &str, link: &str, site_name: &str) -> OutgoingMail {
    let html = format!(
        r#"<!doctype html>
<html lang="en">
<body>
  <p>Hi there,</p>
  <p>Please confirm your email address by clicking the button below:</p>
  <a href="{link}"
     style="text-decoration:none;color:#fff;background-color:#007bff;padding:.4rem .75rem;border-radius:.5rem"
     target="_blank">Confirm Email</a>
  <p>The link is valid for five minutes. You can safely ignore this email if
  you didn't request it.</p>
  <p>Thank you,<br>{site_name}</p>
  <hr style="border:solid 1px lightgray">
  <small>Sent automatically. If the button doesn't work, open <a href="{link}">{link}</a></small>
</body>
</html>"#
    );

    OutgoingMail {
        recipients: vec![recipient.to_string()],
        subject: "Confirm your email".to_string(),
        html,
    }
}

pub fn api_key_email(recipient: &str, api_key: &str, site_name: &str) -> OutgoingMail {
    let html = format!(
        r#"<!doctype html>
<html lang="en">
<body>
  <p>Hi there,</p>
  <p>The API key for your account is: <code>{api_key}</code></p>
  <p>Send it in the <code>X-API-KEY</code> header when calling <code>/api/news</code>.
  If you didn't request this, you can safely ignore this email.</p>
  <p>Thank you,<br>{site_name}</p>
</body>
</html>"#
    );

    OutgoingMail {
        recipients: vec![recipient.to_string()],
        subject: "Your API Key".to_string(),
        html,
    }
}
