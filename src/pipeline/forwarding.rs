//! Fan-out of inbound mail to the other department mailboxes.
//!
//! `(message_id, recipient)` is the idempotency key. A recipient with a
//! recorded `success` is skipped without touching the transport; every real
//! send records exactly one attempt, success or failure.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::mail::{MailTransport, OutboundMail};
use crate::pipeline::attachments::AttachmentStore;
use crate::pipeline::types::{ForwardOutcome, ForwardingAttempt, ForwardingStatus, InboundMessage};
use crate::store::Database;

pub struct ForwardingOrchestrator {
    db: Arc<dyn Database>,
    transport: Arc<dyn MailTransport>,
    department_addresses: Vec<String>,
    attachments: AttachmentStore,
}

impl ForwardingOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn MailTransport>,
        department_addresses: Vec<String>,
        attachments: AttachmentStore,
    ) -> Self {
        let mut normalized: Vec<String> = Vec::with_capacity(department_addresses.len());
        for address in department_addresses {
            let address = address.trim().to_lowercase();
            if !address.is_empty() && !normalized.contains(&address) {
                normalized.push(address);
            }
        }
        Self {
            db,
            transport,
            department_addresses: normalized,
            attachments,
        }
    }

    /// Every department address except the receiving one and the sender.
    pub fn recipients_for(&self, message: &InboundMessage, receiving_address: &str) -> Vec<String> {
        let receiving = receiving_address.trim().to_lowercase();
        let sender = message.sender_address.trim().to_lowercase();
        self.department_addresses
            .iter()
            .filter(|a| **a != receiving && **a != sender)
            .cloned()
            .collect()
    }

    /// Forward `message` to each recipient that has not yet received it.
    ///
    /// Recipients are independent; one failure never stops the loop. No
    /// retries happen here, a failed pair is retried by the next call.
    pub async fn forward(
        &self,
        message: &InboundMessage,
        receiving_address: &str,
    ) -> Vec<ForwardOutcome> {
        let recipients = self.recipients_for(message, receiving_address);
        if recipients.is_empty() {
            debug!(message_id = %message.id, "No forwarding recipients");
            return Vec::new();
        }

        // Built lazily so a fully-forwarded message costs no file reads.
        let mut template: Option<OutboundMail> = None;
        let mut outcomes = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            match self.db.has_successful_forward(&message.id, &recipient).await {
                Ok(true) => {
                    debug!(message_id = %message.id, recipient = %recipient, "Already forwarded");
                    outcomes.push(ForwardOutcome::AlreadyForwarded { recipient });
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    // Sending blind could duplicate a delivery; leave it for the next call.
                    warn!(message_id = %message.id, recipient = %recipient, "Forward check failed: {e}");
                    outcomes.push(ForwardOutcome::Failed {
                        recipient,
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            if template.is_none() {
                template = Some(self.build_forward(message).await);
            }
            let mut mail = template.clone().unwrap_or_default();
            mail.to = vec![recipient.clone()];

            let outcome = match self.transport.send_mail(mail).await {
                Ok(sent) => {
                    info!(
                        message_id = %message.id,
                        recipient = %recipient,
                        transport_id = %sent.message_id,
                        "Message forwarded"
                    );
                    ForwardOutcome::Sent {
                        recipient,
                        transport_message_id: sent.message_id,
                    }
                }
                Err(e) => {
                    warn!(message_id = %message.id, recipient = %recipient, "Forward failed: {e}");
                    ForwardOutcome::Failed {
                        recipient,
                        error: e.to_string(),
                    }
                }
            };
            self.record(message, &outcome).await;
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn record(&self, message: &InboundMessage, outcome: &ForwardOutcome) {
        let (status, transport_message_id, error) = match outcome {
            ForwardOutcome::Sent {
                transport_message_id,
                ..
            } => (ForwardingStatus::Success, Some(transport_message_id.clone()), None),
            ForwardOutcome::Failed { error, .. } => {
                (ForwardingStatus::Failed, None, Some(error.clone()))
            }
            ForwardOutcome::AlreadyForwarded { .. } => return,
        };
        let attempt = ForwardingAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: message.id.clone(),
            recipient: outcome.recipient().to_string(),
            status,
            transport_message_id,
            error,
            attempted_at: Utc::now(),
        };
        if let Err(e) = self.db.record_forwarding_attempt(&attempt).await {
            error!(
                message_id = %message.id,
                recipient = %attempt.recipient,
                "Failed to record forwarding attempt: {e}"
            );
        }
    }

    async fn build_forward(&self, message: &InboundMessage) -> OutboundMail {
        let attachments = match self.db.list_attachments(&message.id).await {
            Ok(records) => self.attachments.load(&records).await,
            Err(e) => {
                warn!(message_id = %message.id, "Cannot list attachments for forward: {e}");
                Vec::new()
            }
        };
        OutboundMail {
            subject: format!("FWD: {}", message.subject_or_placeholder()),
            text: forward_text(message),
            html: message.body_html.as_deref().map(|html| forward_html(message, html)),
            attachments,
            ..Default::default()
        }
    }
}

fn forward_header(message: &InboundMessage) -> [(&'static str, String); 4] {
    [
        ("From", message.sender_display()),
        ("Date", message.received_at.to_rfc2822()),
        ("Subject", message.subject_or_placeholder().to_string()),
        ("To", message.recipients.join(", ")),
    ]
}

pub fn forward_text(message: &InboundMessage) -> String {
    let mut text = String::from("---------- Forwarded Message ----------\n");
    for (label, value) in forward_header(message) {
        text.push_str(&format!("{label}: {value}\n"));
    }
    text.push('\n');
    text.push_str(&message.body_text);
    text
}

fn forward_html(message: &InboundMessage, html: &str) -> String {
    let mut header = String::from("<p>---------- Forwarded Message ----------<br>");
    for (label, value) in forward_header(message) {
        header.push_str(&format!("<b>{label}:</b> {}<br>", escape_html(&value)));
    }
    header.push_str("</p>");
    format!("{header}\n{html}")
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttachmentConfig;
    use crate::error::TransportError;
    use crate::store::LibSqlBackend;
    use crate::testing::{RecordingTransport, sample_message};

    const DEPARTMENTS: [&str; 3] = ["sales@co.test", "support@co.test", "ops@co.test"];

    async fn setup(
        transport: Arc<RecordingTransport>,
    ) -> (ForwardingOrchestrator, Arc<dyn Database>, InboundMessage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let message = sample_message("sales", "<fwd-1@acme.test>");
        db.insert_message(&message).await.unwrap();
        let orchestrator = ForwardingOrchestrator::new(
            Arc::clone(&db),
            transport,
            DEPARTMENTS.iter().map(|s| s.to_string()).collect(),
            AttachmentStore::new(&AttachmentConfig {
                dir: dir.path().to_path_buf(),
                max_size: 1024,
            }),
        );
        (orchestrator, db, message, dir)
    }

    #[tokio::test]
    async fn receiving_address_is_excluded() {
        let (orchestrator, _db, message, _dir) = setup(Arc::new(RecordingTransport::new())).await;
        assert_eq!(
            orchestrator.recipients_for(&message, "SALES@co.test"),
            vec!["support@co.test".to_string(), "ops@co.test".to_string()]
        );
    }

    #[tokio::test]
    async fn department_sender_is_not_forwarded_back() {
        let (orchestrator, _db, mut message, _dir) =
            setup(Arc::new(RecordingTransport::new())).await;
        message.sender_address = "ops@co.test".into();
        assert_eq!(
            orchestrator.recipients_for(&message, "sales@co.test"),
            vec!["support@co.test".to_string()]
        );
    }

    #[tokio::test]
    async fn second_forward_makes_no_transport_calls() {
        let transport = Arc::new(RecordingTransport::new());
        let (orchestrator, db, message, _dir) = setup(Arc::clone(&transport)).await;

        let first = orchestrator.forward(&message, "sales@co.test").await;
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|o| matches!(o, ForwardOutcome::Sent { .. })));
        assert_eq!(transport.sent().len(), 2);

        let second = orchestrator.forward(&message, "sales@co.test").await;
        assert!(
            second
                .iter()
                .all(|o| matches!(o, ForwardOutcome::AlreadyForwarded { .. }))
        );
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(db.list_forwarding_attempts(&message.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_loop() {
        let transport = Arc::new(RecordingTransport::failing_for(&["support@co.test"]));
        let (orchestrator, db, message, _dir) = setup(Arc::clone(&transport)).await;

        let outcomes = orchestrator.forward(&message, "sales@co.test").await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_failure());
        assert!(matches!(outcomes[1], ForwardOutcome::Sent { .. }));

        let attempts = db.list_forwarding_attempts(&message.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        let failed = attempts
            .iter()
            .find(|a| a.recipient == "support@co.test")
            .unwrap();
        assert_eq!(failed.status, ForwardingStatus::Failed);
        assert!(failed.error.is_some());

        // Only the failed pair is retried.
        transport.clear_failures();
        let retry = orchestrator.forward(&message, "sales@co.test").await;
        assert!(matches!(retry[0], ForwardOutcome::Sent { .. }));
        assert!(matches!(retry[1], ForwardOutcome::AlreadyForwarded { .. }));
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn unconfigured_smtp_records_failures() {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let message = sample_message("sales", "<fwd-2@acme.test>");
        db.insert_message(&message).await.unwrap();
        let orchestrator = ForwardingOrchestrator::new(
            Arc::clone(&db),
            Arc::new(crate::mail::UnconfiguredTransport),
            vec!["sales@co.test".into(), "ops@co.test".into()],
            AttachmentStore::new(&AttachmentConfig {
                dir: dir.path().to_path_buf(),
                max_size: 1024,
            }),
        );

        let outcomes = orchestrator.forward(&message, "sales@co.test").await;
        assert_eq!(
            outcomes,
            vec![ForwardOutcome::Failed {
                recipient: "ops@co.test".into(),
                error: TransportError::NotConfigured.to_string(),
            }]
        );
    }

    #[test]
    fn forward_text_has_header_block() {
        let message = sample_message("sales", "<fwd-3@acme.test>");
        let text = forward_text(&message);
        assert!(text.starts_with("---------- Forwarded Message ----------\n"));
        assert!(text.contains(&format!("Subject: {}", message.subject_or_placeholder())));
        assert!(text.contains(&format!("From: {}", message.sender_display())));
        assert!(text.ends_with(&message.body_text));
    }

    #[tokio::test]
    async fn forwarded_subject_is_prefixed() {
        let transport = Arc::new(RecordingTransport::new());
        let (orchestrator, _db, mut message, _dir) = setup(Arc::clone(&transport)).await;
        message.subject = None;
        orchestrator.forward(&message, "sales@co.test").await;
        assert!(
            transport
                .sent()
                .iter()
                .all(|m| m.subject == "FWD: (No Subject)")
        );
    }
}
