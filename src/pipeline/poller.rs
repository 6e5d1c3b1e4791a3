//! Polling scheduler: one sweep over every account per tick.
//!
//! Accounts are swept sequentially and messages within an account one at a
//! time. A failing account is logged and the sweep moves on. Overlapping
//! sweeps (timer plus a manual trigger) are allowed; every downstream step is
//! idempotent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MailboxAccount, PollingConfig};
use crate::mail::MailboxClient;
use crate::pipeline::processor::{IntakePipeline, MessageOutcome};

/// Per-account summary of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountReport {
    pub account: String,
    pub fetched: usize,
    pub error: Option<String>,
    /// No credentials configured; never contacted.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub results: Vec<MessageOutcome>,
    pub accounts: Vec<AccountReport>,
}

impl SweepReport {
    pub fn processed_count(&self) -> usize {
        self.results.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingStatus {
    pub enabled: bool,
    pub interval_secs: u64,
    pub running: bool,
}

pub struct PollingScheduler {
    pipeline: Arc<IntakePipeline>,
    mailbox: Arc<dyn MailboxClient>,
    accounts: Vec<MailboxAccount>,
    config: PollingConfig,
    running: AtomicBool,
    active_sweeps: AtomicUsize,
}

impl PollingScheduler {
    pub fn new(
        pipeline: Arc<IntakePipeline>,
        mailbox: Arc<dyn MailboxClient>,
        accounts: Vec<MailboxAccount>,
        config: PollingConfig,
    ) -> Self {
        Self {
            pipeline,
            mailbox,
            accounts,
            config,
            running: AtomicBool::new(false),
            active_sweeps: AtomicUsize::new(0),
        }
    }

    pub fn pipeline(&self) -> &Arc<IntakePipeline> {
        &self.pipeline
    }

    pub fn status(&self) -> PollingStatus {
        PollingStatus {
            enabled: self.config.enabled,
            interval_secs: self.config.interval.as_secs(),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// One pass over all accounts.
    pub async fn sweep(&self) -> SweepReport {
        let in_flight = self.active_sweeps.fetch_add(1, Ordering::SeqCst);
        if in_flight > 0 {
            warn!(in_flight, "Sweep started while another is running");
        }

        let mut report = SweepReport::default();
        for account in &self.accounts {
            let account_report = self.sweep_account(account, &mut report.results).await;
            report.accounts.push(account_report);
        }

        self.active_sweeps.fetch_sub(1, Ordering::SeqCst);
        info!(
            processed = report.processed_count(),
            accounts = report.accounts.len(),
            "Sweep complete"
        );
        report
    }

    async fn sweep_account(
        &self,
        account: &MailboxAccount,
        results: &mut Vec<MessageOutcome>,
    ) -> AccountReport {
        let mut report = AccountReport {
            account: account.name.clone(),
            fetched: 0,
            error: None,
            skipped: false,
        };
        if !account.has_credentials() {
            debug!(account = %account.name, "No credentials, skipping account");
            report.skipped = true;
            return report;
        }

        let messages = match self.mailbox.fetch_unseen(account).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(account = %account.name, "Mailbox fetch failed: {e}");
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.fetched = messages.len();
        if !messages.is_empty() {
            info!(account = %account.name, count = messages.len(), "Fetched unseen messages");
        }

        for raw in &messages {
            results.push(self.pipeline.process_raw(raw, account).await);
        }
        report
    }

    /// Start the timer. The first sweep runs immediately.
    ///
    /// Stopping cancels future ticks only; a sweep in progress finishes.
    /// Returns `None` if the timer is already running.
    pub fn start(self: &Arc<Self>) -> Option<SchedulerHandle> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Polling scheduler already running");
            return None;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);

        let task = tokio::spawn(async move {
            info!(
                interval_secs = scheduler.config.interval.as_secs(),
                accounts = scheduler.accounts.len(),
                "Polling scheduler started"
            );
            let mut tick = tokio::time::interval(scheduler.config.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                scheduler.sweep().await;
                if *stop_rx.borrow() {
                    break;
                }
            }

            scheduler.running.store(false, Ordering::SeqCst);
            info!("Polling scheduler stopped");
        });

        Some(SchedulerHandle { stop_tx, task })
    }
}

/// Control handle returned by [`PollingScheduler::start`].
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the loop to exit after [`stop`](Self::stop).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Polling task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use super::*;
    use crate::config::AttachmentConfig;
    use crate::pipeline::attachments::AttachmentStore;
    use crate::pipeline::extraction::DisabledExtractor;
    use crate::pipeline::forwarding::ForwardingOrchestrator;
    use crate::pipeline::parser::MessageIngestor;
    use crate::pipeline::types::RawMessage;
    use crate::store::{Database, LibSqlBackend};
    use crate::testing::{RecordingTransport, ScriptedMailbox};

    fn account(name: &str, password: &str) -> MailboxAccount {
        MailboxAccount {
            name: name.into(),
            address: format!("{name}@co.test"),
            imap_host: "imap.test".into(),
            imap_port: 993,
            imap_user: format!("{name}@co.test"),
            imap_password: SecretString::from(password),
            tls: true,
            read_timeout: Duration::from_secs(5),
        }
    }

    fn raw(id: &str) -> RawMessage {
        RawMessage {
            uid: "7".into(),
            bytes: format!(
                "From: buyer@acme.test\r\nTo: sales@co.test\r\nSubject: Quote\r\nMessage-ID: {id}\r\n\r\nTen laptops\r\n"
            )
            .into_bytes(),
        }
    }

    async fn scheduler(
        mailbox: Arc<ScriptedMailbox>,
        accounts: Vec<MailboxAccount>,
        interval: Duration,
    ) -> (Arc<PollingScheduler>, Arc<dyn Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store = AttachmentStore::new(&AttachmentConfig {
            dir: dir.path().to_path_buf(),
            max_size: 1024,
        });
        let forwarding = ForwardingOrchestrator::new(
            Arc::clone(&db),
            Arc::new(RecordingTransport::new()),
            accounts.iter().map(|a| a.address.clone()).collect(),
            store.clone(),
        );
        let pipeline = Arc::new(IntakePipeline::new(
            Arc::clone(&db),
            MessageIngestor::new(Arc::clone(&db), store),
            Arc::new(DisabledExtractor::new("off")),
            forwarding,
            &accounts,
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            pipeline,
            mailbox,
            accounts,
            PollingConfig {
                enabled: true,
                interval,
            },
        ));
        (scheduler, db, dir)
    }

    #[tokio::test]
    async fn failing_account_does_not_stop_sweep() {
        let mailbox = Arc::new(ScriptedMailbox::new());
        mailbox.fail("broken", "connection refused");
        mailbox.deliver("sales", vec![raw("<a@acme.test>"), raw("<b@acme.test>")]);
        let (scheduler, db, _dir) = scheduler(
            Arc::clone(&mailbox),
            vec![account("broken", "pw"), account("sales", "pw")],
            Duration::from_secs(300),
        )
        .await;

        let report = scheduler.sweep().await;

        assert_eq!(report.processed_count(), 2);
        assert!(report.accounts[0].error.is_some());
        assert_eq!(report.accounts[1].fetched, 2);
        assert_eq!(db.list_requests(&Default::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn account_without_password_is_skipped() {
        let mailbox = Arc::new(ScriptedMailbox::new());
        let (scheduler, _db, _dir) = scheduler(
            Arc::clone(&mailbox),
            vec![account("sales", "")],
            Duration::from_secs(300),
        )
        .await;

        let report = scheduler.sweep().await;
        assert!(report.accounts[0].skipped);
        assert_eq!(mailbox.fetch_count(), 0);
    }

    #[tokio::test]
    async fn redelivered_messages_are_duplicates() {
        let mailbox = Arc::new(ScriptedMailbox::new());
        mailbox.deliver("sales", vec![raw("<again@acme.test>")]);
        let (scheduler, db, _dir) = scheduler(
            Arc::clone(&mailbox),
            vec![account("sales", "pw")],
            Duration::from_secs(300),
        )
        .await;

        scheduler.sweep().await;
        let second = scheduler.sweep().await;

        assert!(matches!(second.results[0], MessageOutcome::Duplicate { .. }));
        assert_eq!(db.list_messages(&Default::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_runs_immediately_and_stops() {
        let mailbox = Arc::new(ScriptedMailbox::new());
        let (scheduler, _db, _dir) = scheduler(
            Arc::clone(&mailbox),
            vec![account("sales", "pw")],
            Duration::from_secs(3600),
        )
        .await;
        assert!(!scheduler.status().running);

        let handle = scheduler.start().unwrap();
        assert!(scheduler.status().running);
        for _ in 0..200 {
            if mailbox.fetch_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mailbox.fetch_count(), 1);

        handle.stop();
        handle.join().await;
        assert!(!scheduler.status().running);
        assert_eq!(mailbox.fetch_count(), 1);
        assert_eq!(scheduler.status().interval_secs, 3600);
    }

    #[tokio::test]
    async fn second_start_is_refused_while_running() {
        let mailbox = Arc::new(ScriptedMailbox::new());
        let (scheduler, _db, _dir) = scheduler(
            Arc::clone(&mailbox),
            vec![account("sales", "pw")],
            Duration::from_secs(3600),
        )
        .await;

        let handle = scheduler.start().unwrap();
        assert!(scheduler.start().is_none());

        handle.stop();
        handle.join().await;
        assert!(!scheduler.status().running);

        let restarted = scheduler.start().unwrap();
        assert!(scheduler.status().running);
        restarted.stop();
        restarted.join().await;
    }
}
