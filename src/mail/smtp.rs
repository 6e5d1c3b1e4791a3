//! Outbound mail over SMTP (lettre).

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::TransportError;

/// A file attached to an outbound message.
#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message to send.
#[derive(Debug, Clone, Default)]
pub struct OutboundMail {
    /// `From` mailbox. The transport's configured sender when `None`.
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

/// What the transport reports for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    /// Message-ID header of the delivered mail.
    pub message_id: String,
}

/// Sends mail. Used for forwarding and for quotation delivery.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_mail(&self, mail: OutboundMail) -> Result<SentMail, TransportError>;
}

/// Pick the SMTP mailer when credentials exist, otherwise a transport that
/// fails every send with `NotConfigured`.
pub fn transport_from_config(config: &SmtpConfig) -> Arc<dyn MailTransport> {
    if config.is_configured() {
        Arc::new(SmtpMailer::new(config.clone()))
    } else {
        Arc::new(UnconfiguredTransport)
    }
}

/// Transport used when SMTP credentials are missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredTransport;

#[async_trait]
impl MailTransport for UnconfiguredTransport {
    async fn send_mail(&self, _mail: OutboundMail) -> Result<SentMail, TransportError> {
        Err(TransportError::NotConfigured)
    }
}

/// Blocking lettre SMTP transport, driven from `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn sender(&self) -> Result<&str, TransportError> {
        self.config
            .user
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(TransportError::NotConfigured)
    }

    /// Build the MIME message, including a fresh Message-ID.
    pub fn build_message(&self, mail: &OutboundMail) -> Result<(Message, String), TransportError> {
        let first_recipient = mail.to.first().cloned().unwrap_or_default();
        let send_err = |reason: String| TransportError::Send {
            recipient: first_recipient.clone(),
            reason,
        };

        let sender = self.sender()?;
        let from: Mailbox = match &mail.from {
            Some(from) => from.parse(),
            None => format!("{} <{sender}>", self.config.from_name).parse(),
        }
        .map_err(|e| send_err(format!("Invalid from address: {e}")))?;

        let domain = sender.rsplit_once('@').map_or("localhost", |(_, d)| d);
        let message_id = format!("<{}@{domain}>", Uuid::new_v4());

        let mut builder = Message::builder()
            .from(from)
            .subject(mail.subject.clone())
            .message_id(Some(message_id.clone()));
        if mail.to.is_empty() {
            return Err(send_err("No recipients".into()));
        }
        for to in &mail.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| send_err(format!("Invalid to address {to}: {e}")))?;
            builder = builder.to(mailbox);
        }
        if let Some(in_reply_to) = &mail.in_reply_to {
            builder = builder.in_reply_to(in_reply_to.clone());
        }
        if let Some(references) = &mail.references {
            builder = builder.references(references.clone());
        }

        let body = match &mail.html {
            Some(html) => MultiPart::alternative_plain_html(mail.text.clone(), html.clone()),
            None => MultiPart::mixed().singlepart(SinglePart::plain(mail.text.clone())),
        };
        let body = if mail.attachments.is_empty() {
            body
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for attachment in &mail.attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .or_else(|_| ContentType::parse("application/octet-stream"))
                    .map_err(|e| send_err(format!("Invalid content type: {e}")))?;
                mixed = mixed.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.data.clone(), content_type),
                );
            }
            mixed
        };

        let message = builder
            .multipart(body)
            .map_err(|e| send_err(format!("Failed to build email: {e}")))?;
        Ok((message, message_id))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send_mail(&self, mail: OutboundMail) -> Result<SentMail, TransportError> {
        let recipients = mail.to.join(", ");
        let (message, message_id) = self.build_message(&mail)?;

        let config = self.config.clone();
        let user = self.sender()?.to_string();
        let password = config
            .password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .ok_or(TransportError::NotConfigured)?;
        let send_to = recipients.clone();

        let result = tokio::task::spawn_blocking(move || {
            let send_err = |reason: String| TransportError::Send {
                recipient: send_to.clone(),
                reason,
            };
            let relay = if config.secure {
                SmtpTransport::relay(&config.host)
            } else {
                SmtpTransport::starttls_relay(&config.host)
            }
            .map_err(|e| send_err(format!("SMTP relay error: {e}")))?;

            let transport = relay
                .port(config.port)
                .credentials(Credentials::new(user, password))
                .build();
            transport
                .send(&message)
                .map_err(|e| send_err(format!("SMTP send failed: {e}")))?;
            Ok::<_, TransportError>(())
        })
        .await
        .map_err(|e| TransportError::Send {
            recipient: recipients.clone(),
            reason: format!("SMTP task panicked: {e}"),
        })?;
        result?;

        info!(to = %recipients, message_id = %message_id, "Email sent");
        debug!(subject = %mail.subject, "Sent mail details");
        Ok(SentMail { message_id })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.test".into(),
            port: 587,
            secure: false,
            user: Some("bot@company.test".into()),
            password: Some(SecretString::from("pw")),
            from_name: "Funnel Automation".into(),
        }
    }

    fn formatted(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).into_owned()
    }

    #[test]
    fn message_carries_generated_id_and_sender() {
        let mailer = SmtpMailer::new(config());
        let mail = OutboundMail {
            to: vec!["sales@company.test".into()],
            subject: "FWD: Need quote".into(),
            text: "hello".into(),
            ..Default::default()
        };
        let (message, id) = mailer.build_message(&mail).unwrap();
        let raw = formatted(&message);

        assert!(id.starts_with('<') && id.ends_with("@company.test>"));
        assert!(raw.contains(&id));
        assert!(raw.contains("Funnel Automation"));
        assert!(raw.contains("bot@company.test"));
        assert!(raw.contains("Subject: FWD: Need quote"));
    }

    #[test]
    fn threading_headers_are_set() {
        let mailer = SmtpMailer::new(config());
        let mail = OutboundMail {
            to: vec!["buyer@acme.test".into()],
            subject: "Re: quote".into(),
            text: "attached".into(),
            in_reply_to: Some("<orig@acme.test>".into()),
            references: Some("<orig@acme.test>".into()),
            ..Default::default()
        };
        let raw = formatted(&mailer.build_message(&mail).unwrap().0);
        assert!(raw.contains("In-Reply-To: <orig@acme.test>"));
        assert!(raw.contains("References: <orig@acme.test>"));
    }

    #[test]
    fn attachments_and_html_are_included() {
        let mailer = SmtpMailer::new(config());
        let mail = OutboundMail {
            to: vec!["ops@company.test".into()],
            subject: "FWD: specs".into(),
            text: "plain".into(),
            html: Some("<p>rich</p>".into()),
            attachments: vec![OutboundAttachment {
                filename: "specs.txt".into(),
                content_type: "text/plain".into(),
                data: b"cpu: 32 cores".to_vec(),
            }],
            ..Default::default()
        };
        let raw = formatted(&mailer.build_message(&mail).unwrap().0);
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("specs.txt"));
    }

    #[test]
    fn invalid_recipient_is_a_send_error() {
        let mailer = SmtpMailer::new(config());
        let mail = OutboundMail {
            to: vec!["not an address".into()],
            subject: "x".into(),
            text: "x".into(),
            ..Default::default()
        };
        assert!(matches!(
            mailer.build_message(&mail),
            Err(TransportError::Send { .. })
        ));
    }

    #[tokio::test]
    async fn unconfigured_transport_always_fails() {
        let transport = transport_from_config(&SmtpConfig {
            user: None,
            password: None,
            ..config()
        });
        let err = transport
            .send_mail(OutboundMail {
                to: vec!["a@b.test".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConfigured));
        assert_eq!(err.to_string(), "SMTP not configured");
    }
}
