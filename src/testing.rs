//! Fixtures and fakes shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::config::MailboxAccount;
use crate::error::TransportError;
use crate::funnel::model::{FunnelStage, Priority, Request};
use crate::mail::{MailTransport, MailboxClient, OutboundMail, SentMail};
use crate::pipeline::extraction::Extractor;
use crate::pipeline::types::{
    Extraction, ExtractionResult, InboundMessage, MessageStatus, RawMessage,
};

pub(crate) fn sample_message(account: &str, external_id: &str) -> InboundMessage {
    let now = Utc::now();
    InboundMessage {
        id: uuid::Uuid::new_v4().to_string(),
        external_id: external_id.to_string(),
        account: account.to_string(),
        sender_address: "buyer@example.com".into(),
        sender_name: Some("Pat Buyer".into()),
        recipients: vec![format!("{account}@co.test")],
        subject: Some("Quote request".into()),
        body_text: "Hello, we would like pricing for 10 laptops.".into(),
        body_html: None,
        received_at: now,
        status: MessageStatus::Pending,
        in_reply_to: None,
        references: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn sample_request(code: &str, message_id: Option<&str>) -> Request {
    let now = Utc::now();
    Request {
        id: uuid::Uuid::new_v4().to_string(),
        code: code.to_string(),
        message_id: message_id.map(String::from),
        customer_email: "customer@example.com".into(),
        customer_name: Some("Pat Customer".into()),
        subject: Some("Quote request".into()),
        requirements: "10 laptops".into(),
        original_content: "Hello, we would like pricing for 10 laptops.".into(),
        source: "email".into(),
        funnel_stage: FunnelStage::New,
        priority: Priority::Low,
        assigned_user_id: None,
        email_message_id: None,
        email_references: None,
        created_at: now,
        updated_at: now,
    }
}

/// Records every send; optionally fails for chosen recipients.
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<OutboundMail>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn failing_for(recipients: &[&str]) -> Self {
        let transport = Self::new();
        transport
            .failing
            .lock()
            .unwrap()
            .extend(recipients.iter().map(|r| r.to_string()));
        transport
    }

    pub(crate) fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Successfully sent mail, in order.
    pub(crate) fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_mail(&self, mail: OutboundMail) -> Result<SentMail, TransportError> {
        let recipient = mail.to.join(", ");
        if self.failing.lock().unwrap().contains(&recipient) {
            return Err(TransportError::Send {
                recipient,
                reason: "mailbox unavailable".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail);
        Ok(SentMail {
            message_id: format!("<sent-{}@co.test>", sent.len()),
        })
    }
}

/// Returns the same extraction every time and counts calls.
pub(crate) struct FixedExtractor {
    extraction: Extraction,
    calls: AtomicUsize,
}

impl FixedExtractor {
    pub(crate) fn product(name: &str, quantity: u64, confidence: f64) -> Self {
        Self {
            extraction: Extraction::Ok(ExtractionResult {
                product_name: Some(name.to_string()),
                quantity: Some(quantity),
                specifications: BTreeMap::new(),
                confidence,
                raw: "{}".into(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FixedExtractor {
    async fn extract(&self, _body_text: &str, _subject: &str) -> Extraction {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.extraction.clone()
    }
}

/// Mailbox whose unseen set never drains, so every fetch redelivers.
pub(crate) struct ScriptedMailbox {
    inboxes: Mutex<HashMap<String, Result<Vec<RawMessage>, String>>>,
    fetches: AtomicUsize,
}

impl ScriptedMailbox {
    pub(crate) fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn deliver(&self, account: &str, messages: Vec<RawMessage>) {
        self.inboxes
            .lock()
            .unwrap()
            .insert(account.to_string(), Ok(messages));
    }

    pub(crate) fn fail(&self, account: &str, reason: &str) {
        self.inboxes
            .lock()
            .unwrap()
            .insert(account.to_string(), Err(reason.to_string()));
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxClient for ScriptedMailbox {
    async fn fetch_unseen(
        &self,
        account: &MailboxAccount,
    ) -> Result<Vec<RawMessage>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.inboxes.lock().unwrap().get(&account.name) {
            Some(Ok(messages)) => Ok(messages.clone()),
            Some(Err(reason)) => Err(TransportError::Connection {
                account: account.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }
}
