//! MIME parsing and Message-ID deduplication.

use std::sync::Arc;

use chrono::Utc;
use mail_parser::{MessageParser, MimeHeaders};
use tracing::{debug, warn};

use crate::error::{DatabaseError, ParseError};
use crate::mail::text::{
    bracket_id, extract_addresses, extract_sender, extract_text, header_ids, to_utc,
};
use crate::pipeline::attachments::AttachmentStore;
use crate::pipeline::types::{InboundMessage, ParsedAttachment, ParsedMessage, RawMessage};
use crate::store::Database;

/// Longest body kept when a message cannot be parsed at all.
const FALLBACK_BODY_CHARS: usize = 10_000;

/// Parse a raw RFC 822 blob into normalized fields.
///
/// A message without a Message-ID gets a synthesized one; such messages are
/// not protected against redelivery.
pub fn parse_raw_message(bytes: &[u8]) -> Result<ParsedMessage, ParseError> {
    let parsed = MessageParser::default()
        .parse(bytes)
        .ok_or(ParseError::Unparseable)?;

    let (sender_address, sender_name) = extract_sender(&parsed);
    let (external_id, synthesized_id) = match parsed.message_id().map(str::trim) {
        Some(id) if !id.is_empty() => (bracket_id(id), false),
        _ => (synthesize_message_id(), true),
    };

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(index, part)| ParsedAttachment {
            filename: part
                .attachment_name()
                .map(String::from)
                .unwrap_or_else(|| format!("attachment-{}", index + 1)),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            data: part.contents().to_vec(),
        })
        .collect();

    Ok(ParsedMessage {
        external_id,
        synthesized_id,
        sender_address,
        sender_name,
        recipients: extract_addresses(parsed.to()),
        subject: parsed
            .subject()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        body_text: extract_text(&parsed),
        body_html: parsed.body_html(0).map(|h| h.into_owned()),
        received_at: parsed.date().and_then(to_utc).unwrap_or_else(Utc::now),
        in_reply_to: header_ids(parsed.in_reply_to()),
        references: header_ids(parsed.references()),
        attachments,
    })
}

/// Best-effort record for a blob that is not parseable MIME.
pub fn fallback_message(bytes: &[u8]) -> ParsedMessage {
    let body: String = String::from_utf8_lossy(bytes)
        .chars()
        .take(FALLBACK_BODY_CHARS)
        .collect();
    ParsedMessage {
        external_id: synthesize_message_id(),
        synthesized_id: true,
        sender_address: "unknown".into(),
        sender_name: None,
        recipients: Vec::new(),
        subject: None,
        body_text: body.trim().to_string(),
        body_html: None,
        received_at: Utc::now(),
        in_reply_to: None,
        references: None,
        attachments: Vec::new(),
    }
}

/// Fallback identity: ingestion time plus a random suffix.
pub fn synthesize_message_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("generated-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Result of ingesting one raw message.
#[derive(Debug, Clone)]
pub enum Ingested {
    /// First sighting; persisted as `pending`.
    New(InboundMessage),
    /// Already stored. Downstream steps must be skipped.
    Duplicate(InboundMessage),
}

/// Parses raw mail, deduplicates on external id, and persists new messages.
pub struct MessageIngestor {
    db: Arc<dyn Database>,
    attachments: AttachmentStore,
}

impl MessageIngestor {
    pub fn new(db: Arc<dyn Database>, attachments: AttachmentStore) -> Self {
        Self { db, attachments }
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub async fn ingest(&self, raw: &RawMessage, account: &str) -> Result<Ingested, DatabaseError> {
        let parsed = match parse_raw_message(&raw.bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(account = account, uid = %raw.uid, "Unparseable message, storing fallback: {e}");
                fallback_message(&raw.bytes)
            }
        };
        if parsed.synthesized_id {
            warn!(
                account = account,
                external_id = %parsed.external_id,
                "Message has no Message-ID, synthesized one"
            );
        }

        if let Some(existing) = self.db.find_message_by_external_id(&parsed.external_id).await? {
            debug!(external_id = %parsed.external_id, "Message already ingested");
            return Ok(Ingested::Duplicate(existing));
        }

        let message = InboundMessage::from_parsed(&parsed, account);
        if !self.db.insert_message(&message).await? {
            // A concurrent sweep stored it between our lookup and insert.
            let existing = self
                .db
                .find_message_by_external_id(&parsed.external_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "message".into(),
                    id: parsed.external_id.clone(),
                })?;
            return Ok(Ingested::Duplicate(existing));
        }

        let saved = self
            .attachments
            .save_all(self.db.as_ref(), &message.id, &parsed.attachments)
            .await;
        debug!(
            id = %message.id,
            external_id = %message.external_id,
            attachments = saved.len(),
            "Message ingested"
        );
        Ok(Ingested::New(message))
    }
}
