//! `Database` trait — the single async interface for all persistence.
//!
//! Every write the pipeline depends on for idempotency is a conditional
//! insert that reports whether it won, so overlapping sweeps converge on one
//! row per natural key instead of racing a read-then-write.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::funnel::model::{
    AssignmentHistoryEntry, FunnelStage, Request, RequestFilter, RequestStats, RequestUpdate,
};
use crate::pipeline::types::{
    AttachmentRecord, ExtractedData, ForwardingAttempt, ForwardingStats, InboundMessage,
    MessageFilter, MessageStats, MessageStatus,
};

/// Backend-agnostic storage for messages, forwarding, and requests.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message unless its external id is already stored.
    ///
    /// Returns `false` when another record already owns the external id.
    async fn insert_message(&self, message: &InboundMessage) -> Result<bool, DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<InboundMessage>, DatabaseError>;

    async fn find_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<InboundMessage>, DatabaseError>;

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn list_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<InboundMessage>, DatabaseError>;

    async fn message_stats(&self) -> Result<MessageStats, DatabaseError>;

    // ── Attachments ─────────────────────────────────────────────────

    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> Result<(), DatabaseError>;

    async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<AttachmentRecord>, DatabaseError>;

    // ── Extracted data ──────────────────────────────────────────────

    /// Insert unless the message already has extracted data.
    async fn insert_extracted_data(&self, data: &ExtractedData) -> Result<bool, DatabaseError>;

    async fn get_extracted_data(
        &self,
        message_id: &str,
    ) -> Result<Option<ExtractedData>, DatabaseError>;

    // ── Forwarding ──────────────────────────────────────────────────

    /// True if `(message_id, recipient)` already has a `success` attempt.
    async fn has_successful_forward(
        &self,
        message_id: &str,
        recipient: &str,
    ) -> Result<bool, DatabaseError>;

    async fn record_forwarding_attempt(
        &self,
        attempt: &ForwardingAttempt,
    ) -> Result<(), DatabaseError>;

    async fn list_forwarding_attempts(
        &self,
        message_id: &str,
    ) -> Result<Vec<ForwardingAttempt>, DatabaseError>;

    async fn forwarding_stats(&self) -> Result<ForwardingStats, DatabaseError>;

    // ── Requests ────────────────────────────────────────────────────

    /// Atomically increment and return the named counter (first value is 1).
    async fn next_sequence(&self, name: &str) -> Result<i64, DatabaseError>;

    /// Insert a request unless one already references the same message.
    async fn insert_request(&self, request: &Request) -> Result<bool, DatabaseError>;

    async fn get_request(&self, id: &str) -> Result<Option<Request>, DatabaseError>;

    async fn find_request_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<Request>, DatabaseError>;

    /// Newest first.
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, DatabaseError>;

    /// Returns `false` if no request has this id.
    async fn update_request_stage(
        &self,
        id: &str,
        stage: FunnelStage,
    ) -> Result<bool, DatabaseError>;

    /// Set the assignee and move the request to `Assigned`.
    async fn assign_request(&self, id: &str, user_id: &str) -> Result<bool, DatabaseError>;

    async fn update_request_fields(
        &self,
        id: &str,
        update: &RequestUpdate,
    ) -> Result<bool, DatabaseError>;

    async fn request_stats(&self) -> Result<RequestStats, DatabaseError>;

    // ── Assignment history ──────────────────────────────────────────

    async fn insert_assignment(&self, entry: &AssignmentHistoryEntry)
    -> Result<(), DatabaseError>;

    /// Oldest first.
    async fn list_assignments(
        &self,
        request_id: &str,
    ) -> Result<Vec<AssignmentHistoryEntry>, DatabaseError>;
}
