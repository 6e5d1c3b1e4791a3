//! Data types that flow through the intake pipeline.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shown wherever a message has no subject line.
pub const NO_SUBJECT: &str = "(No Subject)";

/// Lifecycle of an ingested message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Persisted, downstream steps not yet complete.
    Pending,
    /// Extraction, forwarding and derivation all ran.
    Processed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(MessageStatus::Pending),
            "processed" => Some(MessageStatus::Processed),
            _ => None,
        }
    }
}

/// A raw message blob as returned by the mailbox.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Server-side UID, used for logging only.
    pub uid: String,
    pub bytes: Vec<u8>,
}

/// An attachment pulled out of a parsed message, not yet stored.
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message after MIME parsing and before persistence.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub external_id: String,
    /// True when the message carried no usable Message-ID.
    pub synthesized_id: bool,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
}

/// A persisted inbound email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    /// Message-ID header (or a synthesized fallback). Unique.
    pub external_id: String,
    /// Name of the mailbox account that received it.
    pub account: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Build a pending record from a parsed message.
    pub fn from_parsed(parsed: &ParsedMessage, account: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: parsed.external_id.clone(),
            account: account.to_string(),
            sender_address: parsed.sender_address.clone(),
            sender_name: parsed.sender_name.clone(),
            recipients: parsed.recipients.clone(),
            subject: parsed.subject.clone(),
            body_text: parsed.body_text.clone(),
            body_html: parsed.body_html.clone(),
            received_at: parsed.received_at,
            status: MessageStatus::Pending,
            in_reply_to: parsed.in_reply_to.clone(),
            references: parsed.references.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subject_or_placeholder(&self) -> &str {
        self.subject.as_deref().unwrap_or(NO_SUBJECT)
    }

    /// `Name <address>` when a display name is known.
    pub fn sender_display(&self) -> String {
        match &self.sender_name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.sender_address),
            _ => self.sender_address.clone(),
        }
    }
}

/// Metadata for an attachment written to the content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// Successful structured extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub product_name: Option<String>,
    /// Never negative.
    pub quantity: Option<u64>,
    pub specifications: BTreeMap<String, String>,
    /// Clamped to `[0, 1]`.
    pub confidence: f64,
    /// Raw service payload, kept for audit.
    pub raw: String,
}

/// Outcome of the extraction step. Never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Extraction {
    Ok(ExtractionResult),
    /// Service unavailable or unusable; treated as zero confidence.
    Degraded { reason: String },
}

impl Extraction {
    pub fn degraded(reason: impl Into<String>) -> Self {
        Extraction::Degraded {
            reason: reason.into(),
        }
    }

    pub fn result(&self) -> Option<&ExtractionResult> {
        match self {
            Extraction::Ok(result) => Some(result),
            Extraction::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Extraction::Degraded { .. })
    }

    /// Product guess, ignoring blank strings.
    pub fn product_name(&self) -> Option<&str> {
        self.result()
            .and_then(|r| r.product_name.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn quantity(&self) -> Option<u64> {
        self.result().and_then(|r| r.quantity)
    }

    pub fn confidence(&self) -> f64 {
        self.result().map_or(0.0, |r| r.confidence)
    }
}

/// Persisted extraction for a message. Written once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedData {
    pub id: String,
    pub message_id: String,
    pub product_name: Option<String>,
    pub quantity: Option<u64>,
    pub specifications: BTreeMap<String, String>,
    pub confidence: f64,
    pub raw: String,
    pub created_at: DateTime<Utc>,
}

impl ExtractedData {
    /// Only worth storing when the service guessed a product or a quantity.
    pub fn from_extraction(message_id: &str, extraction: &Extraction) -> Option<Self> {
        let result = extraction.result()?;
        if extraction.product_name().is_none() && result.quantity.is_none() {
            return None;
        }
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            product_name: result.product_name.clone(),
            quantity: result.quantity,
            specifications: result.specifications.clone(),
            confidence: result.confidence,
            raw: result.raw.clone(),
            created_at: Utc::now(),
        })
    }

    pub fn to_extraction(&self) -> Extraction {
        Extraction::Ok(ExtractionResult {
            product_name: self.product_name.clone(),
            quantity: self.quantity,
            specifications: self.specifications.clone(),
            confidence: self.confidence,
            raw: self.raw.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingStatus {
    Success,
    Failed,
}

impl ForwardingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardingStatus::Success => "success",
            ForwardingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "success" {
            ForwardingStatus::Success
        } else {
            ForwardingStatus::Failed
        }
    }
}

/// One delivery attempt of a message to one recipient.
///
/// `(message_id, recipient)` is the idempotency key: a `success` row means the
/// pair is never sent again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingAttempt {
    pub id: String,
    pub message_id: String,
    pub recipient: String,
    pub status: ForwardingStatus,
    pub transport_message_id: Option<String>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Per-recipient result of one `forward` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ForwardOutcome {
    Sent {
        recipient: String,
        transport_message_id: String,
    },
    /// A previous attempt already succeeded; no network call made.
    AlreadyForwarded { recipient: String },
    Failed { recipient: String, error: String },
}

impl ForwardOutcome {
    pub fn recipient(&self) -> &str {
        match self {
            ForwardOutcome::Sent { recipient, .. }
            | ForwardOutcome::AlreadyForwarded { recipient }
            | ForwardOutcome::Failed { recipient, .. } => recipient,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ForwardOutcome::Failed { .. })
    }
}

/// Filters for listing messages. All optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFilter {
    pub account: Option<String>,
    pub status: Option<MessageStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStats {
    pub total: i64,
    pub pending: i64,
    pub processed: i64,
    pub by_account: HashMap<String, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    /// Percentage of successful attempts, 0 when there are none.
    pub success_rate: f64,
}

impl ForwardingStats {
    pub fn new(successful: i64, failed: i64) -> Self {
        let total = successful + failed;
        let success_rate = if total > 0 {
            (successful as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self {
            total,
            successful,
            failed,
            success_rate,
        }
    }
}
