//! Per-message processing: ingest, then extraction alongside forwarding, then
//! request derivation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::MailboxAccount;
use crate::error::{DatabaseError, FunnelError};
use crate::funnel::model::Priority;
use crate::pipeline::deriver::RequestDeriver;
use crate::pipeline::extraction::Extractor;
use crate::pipeline::forwarding::ForwardingOrchestrator;
use crate::pipeline::parser::{Ingested, MessageIngestor};
use crate::pipeline::types::{
    ExtractedData, Extraction, ForwardOutcome, InboundMessage, MessageStatus, RawMessage,
};
use crate::store::Database;

/// What happened to one message during a sweep or reprocess.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MessageOutcome {
    Processed {
        message_id: String,
        external_id: String,
        request_code: String,
        priority: Priority,
        forwarded: usize,
        already_forwarded: usize,
        forward_failures: usize,
        extraction_degraded: bool,
    },
    /// Seen before; nothing downstream ran.
    Duplicate { external_id: String },
    Failed {
        external_id: Option<String>,
        error: String,
    },
}

impl MessageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, MessageOutcome::Failed { .. })
    }
}

pub struct IntakePipeline {
    db: Arc<dyn Database>,
    ingestor: MessageIngestor,
    extractor: Arc<dyn Extractor>,
    forwarding: ForwardingOrchestrator,
    deriver: RequestDeriver,
    /// Account name to receiving address, for reprocessing.
    addresses: HashMap<String, String>,
}

impl IntakePipeline {
    pub fn new(
        db: Arc<dyn Database>,
        ingestor: MessageIngestor,
        extractor: Arc<dyn Extractor>,
        forwarding: ForwardingOrchestrator,
        accounts: &[MailboxAccount],
    ) -> Self {
        Self {
            deriver: RequestDeriver::new(Arc::clone(&db)),
            db,
            ingestor,
            extractor,
            forwarding,
            addresses: accounts
                .iter()
                .map(|a| (a.name.clone(), a.address.clone()))
                .collect(),
        }
    }

    /// Run one fetched message through the whole pipeline.
    ///
    /// Storage errors are reported as `Failed` instead of propagated, so the
    /// caller can move on to the next message.
    pub async fn process_raw(&self, raw: &RawMessage, account: &MailboxAccount) -> MessageOutcome {
        let message = match self.ingestor.ingest(raw, &account.name).await {
            Ok(Ingested::New(message)) => message,
            Ok(Ingested::Duplicate(existing)) => {
                info!(
                    account = %account.name,
                    external_id = %existing.external_id,
                    "Skipping already-processed message"
                );
                return MessageOutcome::Duplicate {
                    external_id: existing.external_id,
                };
            }
            Err(e) => {
                error!(account = %account.name, uid = %raw.uid, "Failed to store message: {e}");
                return MessageOutcome::Failed {
                    external_id: None,
                    error: e.to_string(),
                };
            }
        };

        match self.complete(&message, &account.address).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    account = %account.name,
                    external_id = %message.external_id,
                    "Processing failed, message left pending: {e}"
                );
                MessageOutcome::Failed {
                    external_id: Some(message.external_id),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Re-run downstream steps for a stored message. Each step is idempotent,
    /// so only missing or failed work happens.
    pub async fn reprocess(&self, message_id: &str) -> Result<MessageOutcome, FunnelError> {
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or_else(|| FunnelError::NotFound {
                entity: "message".into(),
                id: message_id.to_string(),
            })?;
        let receiving = match self.addresses.get(&message.account) {
            Some(address) => address.clone(),
            None => {
                warn!(account = %message.account, "Reprocessing message from unknown account");
                String::new()
            }
        };
        Ok(self.complete(&message, &receiving).await?)
    }

    async fn complete(
        &self,
        message: &InboundMessage,
        receiving_address: &str,
    ) -> Result<MessageOutcome, DatabaseError> {
        let (extraction, forwards) = tokio::join!(
            self.extraction_for(message),
            self.forwarding.forward(message, receiving_address),
        );

        let request = self.deriver.derive(message, &extraction).await?;
        self.db
            .update_message_status(&message.id, MessageStatus::Processed)
            .await?;

        let count = |f: fn(&ForwardOutcome) -> bool| forwards.iter().filter(|o| f(o)).count();
        let outcome = MessageOutcome::Processed {
            message_id: message.id.clone(),
            external_id: message.external_id.clone(),
            request_code: request.code,
            priority: request.priority,
            forwarded: count(|o| matches!(o, ForwardOutcome::Sent { .. })),
            already_forwarded: count(|o| matches!(o, ForwardOutcome::AlreadyForwarded { .. })),
            forward_failures: count(ForwardOutcome::is_failure),
            extraction_degraded: extraction.is_degraded(),
        };
        info!(
            external_id = %message.external_id,
            account = %message.account,
            "Message processed"
        );
        Ok(outcome)
    }

    /// Stored extraction if there is one, otherwise ask the extractor.
    async fn extraction_for(&self, message: &InboundMessage) -> Extraction {
        match self.db.get_extracted_data(&message.id).await {
            Ok(Some(stored)) => return stored.to_extraction(),
            Ok(None) => {}
            Err(e) => warn!(message_id = %message.id, "Cannot read stored extraction: {e}"),
        }

        let extraction = self
            .extractor
            .extract(&message.body_text, message.subject_or_placeholder())
            .await;
        if let Some(data) = ExtractedData::from_extraction(&message.id, &extraction)
            && let Err(e) = self.db.insert_extracted_data(&data).await
        {
            warn!(message_id = %message.id, "Failed to store extracted data: {e}");
        }
        extraction
    }
}
