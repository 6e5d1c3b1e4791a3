//! Derives a funnel request from an ingested message.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::funnel::model::{FunnelStage, Priority, Request};
use crate::pipeline::types::{Extraction, InboundMessage};
use crate::store::Database;

/// Text used when neither extraction, subject, nor body says anything.
pub const MANUAL_REVIEW: &str = "Manual review required";

const SEQUENCE_NAME: &str = "request";
const BODY_EXCERPT_CHARS: usize = 200;
const MEDIUM_CONFIDENCE: f64 = 0.8;

static URGENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(urgent|asap|immediately|critical)").expect("urgent keyword pattern")
});
static HIGH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(important|priority|soon)").expect("high keyword pattern")
});

/// First match wins: urgent keywords, then high keywords, then confidence.
pub fn classify_priority(subject: &str, body: &str, confidence: f64) -> Priority {
    let text = format!("{subject} {body}");
    if URGENT_RE.is_match(&text) {
        Priority::Urgent
    } else if HIGH_RE.is_match(&text) {
        Priority::High
    } else if confidence > MEDIUM_CONFIDENCE {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Requirements text for a new request.
pub fn render_requirements(message: &InboundMessage, extraction: &Extraction) -> String {
    if let Some(product) = extraction.product_name() {
        let mut text = product.to_string();
        if let Some(quantity) = extraction.quantity() {
            text.push_str(&format!(" (Qty: {quantity})"));
        }
        if let Some(result) = extraction.result()
            && !result.specifications.is_empty()
        {
            let specs = result
                .specifications
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join(", ");
            text.push_str(&format!(" - Specs: {specs}"));
        }
        return text;
    }

    if let Some(subject) = message.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return subject.to_string();
    }

    let body = message.body_text.trim();
    if !body.is_empty() {
        return body.chars().take(BODY_EXCERPT_CHARS).collect();
    }

    MANUAL_REVIEW.to_string()
}

pub fn format_code(n: i64) -> String {
    format!("REQ-{n:03}")
}

pub struct RequestDeriver {
    db: Arc<dyn Database>,
}

impl RequestDeriver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Return the message's request, creating it on first call.
    ///
    /// The store's unique index on `message_id` decides concurrent races; the
    /// loser re-reads the winner's row. A lost race burns one sequence value.
    pub async fn derive(
        &self,
        message: &InboundMessage,
        extraction: &Extraction,
    ) -> Result<Request, DatabaseError> {
        if let Some(existing) = self.db.find_request_by_message_id(&message.id).await? {
            debug!(message_id = %message.id, code = %existing.code, "Request already derived");
            return Ok(existing);
        }

        let priority = classify_priority(
            message.subject.as_deref().unwrap_or_default(),
            &message.body_text,
            extraction.confidence(),
        );
        let n = self.db.next_sequence(SEQUENCE_NAME).await?;
        let now = Utc::now();
        let request = Request {
            id: uuid::Uuid::new_v4().to_string(),
            code: format_code(n),
            message_id: Some(message.id.clone()),
            customer_email: message.sender_address.clone(),
            customer_name: message.sender_name.clone(),
            subject: message.subject.clone(),
            requirements: render_requirements(message, extraction),
            original_content: message.body_text.clone(),
            source: "email".into(),
            funnel_stage: FunnelStage::New,
            priority,
            assigned_user_id: None,
            email_message_id: Some(message.external_id.clone()),
            email_references: Some(
                message
                    .references
                    .clone()
                    .unwrap_or_else(|| message.external_id.clone()),
            ),
            created_at: now,
            updated_at: now,
        };

        if self.db.insert_request(&request).await? {
            info!(
                code = %request.code,
                message_id = %message.id,
                priority = %request.priority,
                "Request created"
            );
            return Ok(request);
        }

        self.db
            .find_request_by_message_id(&message.id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "request".into(),
                id: message.id.clone(),
            })
    }
}
