//! Shared fakes and wiring for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use funnel_intake::config::{AttachmentConfig, MailboxAccount, PollingConfig};
use funnel_intake::error::TransportError;
use funnel_intake::funnel::FunnelStateMachine;
use funnel_intake::mail::{MailTransport, MailboxClient, OutboundMail, SentMail};
use funnel_intake::pipeline::types::RawMessage;
use funnel_intake::pipeline::{
    AttachmentStore, DisabledExtractor, Extractor, ForwardingOrchestrator, IntakePipeline,
    MessageIngestor, PollingScheduler,
};
use funnel_intake::store::{Database, LibSqlBackend};

pub const DEPARTMENTS: [&str; 3] = ["sales", "support", "ops"];

pub fn account(name: &str) -> MailboxAccount {
    MailboxAccount {
        name: name.into(),
        address: format!("{name}@co.test"),
        imap_host: "imap.co.test".into(),
        imap_port: 993,
        imap_user: format!("{name}@co.test"),
        imap_password: SecretString::from("secret"),
        tls: true,
        read_timeout: Duration::from_secs(5),
    }
}

pub fn raw_mail(message_id: &str, subject: &str, body: &str) -> RawMessage {
    RawMessage {
        uid: "1".into(),
        bytes: format!(
            "From: Jordan Buyer <jordan@acme.test>\r\n\
             To: sales@co.test\r\n\
             Subject: {subject}\r\n\
             Message-ID: {message_id}\r\n\
             Date: Wed, 2 Oct 2024 09:30:00 +0000\r\n\
             \r\n\
             {body}\r\n"
        )
        .into_bytes(),
    }
}

/// Mailbox that hands out the same unseen set on every fetch, like a
/// server that redelivers after a crash.
#[derive(Default)]
pub struct FakeMailbox {
    inboxes: Mutex<HashMap<String, Vec<RawMessage>>>,
    fetches: AtomicUsize,
}

impl FakeMailbox {
    pub fn deliver(&self, account: &str, message: RawMessage) {
        self.inboxes
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default()
            .push(message);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn fetch_unseen(
        &self,
        account: &MailboxAccount,
    ) -> Result<Vec<RawMessage>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inboxes
            .lock()
            .unwrap()
            .get(&account.name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Transport that accepts everything and remembers it.
#[derive(Default)]
pub struct CountingTransport {
    sent: Mutex<Vec<OutboundMail>>,
}

impl CountingTransport {
    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for CountingTransport {
    async fn send_mail(&self, mail: OutboundMail) -> Result<SentMail, TransportError> {
        // Yield so overlapping sweeps interleave.
        tokio::task::yield_now().await;
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail);
        Ok(SentMail {
            message_id: format!("<fwd-{}@co.test>", sent.len()),
        })
    }
}

pub struct Harness {
    pub db: Arc<dyn Database>,
    pub mailbox: Arc<FakeMailbox>,
    pub transport: Arc<CountingTransport>,
    pub scheduler: Arc<PollingScheduler>,
    pub funnel: Arc<FunnelStateMachine>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_extractor(Arc::new(DisabledExtractor::new("no API key configured"))).await
    }

    pub async fn with_extractor(extractor: Arc<dyn Extractor>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn Database> = Arc::new(
            LibSqlBackend::new_local(&dir.path().join("intake.db"))
                .await
                .unwrap(),
        );
        let accounts: Vec<MailboxAccount> = DEPARTMENTS.iter().map(|d| account(d)).collect();
        let store = AttachmentStore::new(&AttachmentConfig {
            dir: dir.path().join("attachments"),
            max_size: 1024 * 1024,
        });
        let mailbox = Arc::new(FakeMailbox::default());
        let transport = Arc::new(CountingTransport::default());

        let forwarding = ForwardingOrchestrator::new(
            Arc::clone(&db),
            transport.clone(),
            accounts.iter().map(|a| a.address.clone()).collect(),
            store.clone(),
        );
        let pipeline = Arc::new(IntakePipeline::new(
            Arc::clone(&db),
            MessageIngestor::new(Arc::clone(&db), store),
            extractor,
            forwarding,
            &accounts,
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            pipeline,
            mailbox.clone(),
            accounts,
            PollingConfig {
                enabled: false,
                interval: Duration::from_secs(300),
            },
        ));
        let funnel = Arc::new(FunnelStateMachine::new(Arc::clone(&db)));

        Self {
            db,
            mailbox,
            transport,
            scheduler,
            funnel,
            _dir: dir,
        }
    }
}
