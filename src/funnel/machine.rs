//! Funnel stage transitions for requests.
//!
//! `New → Assigned → Quoted → Closed`. Assignment always lands in
//! `Assigned` and appends a history row. Operator stage overrides are
//! unrestricted; quotation delivery forces `Quoted`.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::FunnelError;
use crate::funnel::model::{
    AssignmentHistoryEntry, FunnelStage, Request, RequestFilter, RequestStats, RequestUpdate,
    ThreadInfo,
};
use crate::store::Database;

pub struct FunnelStateMachine {
    db: Arc<dyn Database>,
}

impl FunnelStateMachine {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Request, FunnelError> {
        self.db
            .get_request(id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, FunnelError> {
        Ok(self.db.list_requests(filter).await?)
    }

    /// Assign (or reassign) a request. Allowed from any stage.
    pub async fn assign(
        &self,
        id: &str,
        user_id: &str,
        assigned_by: &str,
        notes: Option<String>,
    ) -> Result<Request, FunnelError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(FunnelError::Validation("userId is required".into()));
        }
        let assigned_by = assigned_by.trim();
        if assigned_by.is_empty() {
            return Err(FunnelError::Validation("assignedBy is required".into()));
        }

        let previous = self.get(id).await?;
        if !self.db.assign_request(id, user_id).await? {
            return Err(not_found(id));
        }

        let entry = AssignmentHistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: id.to_string(),
            assigned_from: previous.assigned_user_id.clone(),
            assigned_to: user_id.to_string(),
            assigned_by: assigned_by.to_string(),
            notes: notes.filter(|n| !n.trim().is_empty()),
            created_at: Utc::now(),
        };
        self.db.insert_assignment(&entry).await?;

        info!(
            code = %previous.code,
            from = previous.assigned_user_id.as_deref().unwrap_or("-"),
            to = %user_id,
            "Request assigned"
        );
        self.get(id).await
    }

    /// Operator override to any stage.
    pub async fn update_stage(&self, id: &str, stage: &str) -> Result<Request, FunnelError> {
        let stage: FunnelStage = stage.parse()?;
        self.set_stage(id, stage).await
    }

    pub async fn set_stage(&self, id: &str, stage: FunnelStage) -> Result<Request, FunnelError> {
        if !self.db.update_request_stage(id, stage).await? {
            return Err(not_found(id));
        }
        info!(request_id = %id, stage = %stage, "Request stage updated");
        self.get(id).await
    }

    pub async fn update(&self, id: &str, update: RequestUpdate) -> Result<Request, FunnelError> {
        if update.is_empty() {
            return Err(FunnelError::Validation("no fields to update".into()));
        }
        if update
            .requirements
            .as_deref()
            .is_some_and(|r| r.trim().is_empty())
        {
            return Err(FunnelError::Validation("requirements cannot be empty".into()));
        }
        if !self.db.update_request_fields(id, &update).await? {
            return Err(not_found(id));
        }
        self.get(id).await
    }

    /// Called after a quotation for this request was emailed. Idempotent.
    pub async fn on_quotation_sent(&self, id: &str) -> Result<Request, FunnelError> {
        let request = self.get(id).await?;
        if request.funnel_stage == FunnelStage::Quoted {
            return Ok(request);
        }
        self.set_stage(id, FunnelStage::Quoted).await
    }

    pub async fn history(&self, id: &str) -> Result<Vec<AssignmentHistoryEntry>, FunnelError> {
        self.get(id).await?;
        Ok(self.db.list_assignments(id).await?)
    }

    pub async fn stats(&self) -> Result<RequestStats, FunnelError> {
        Ok(self.db.request_stats().await?)
    }

    /// Headers for threading a reply into the customer's original conversation.
    pub async fn thread_info(&self, id: &str) -> Result<ThreadInfo, FunnelError> {
        let request = self.get(id).await?;
        let references = request
            .email_references
            .clone()
            .or_else(|| request.email_message_id.clone());
        Ok(ThreadInfo {
            in_reply_to: request.email_message_id,
            references,
        })
    }
}

fn not_found(id: &str) -> FunnelError {
    FunnelError::NotFound {
        entity: "request".into(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::model::Priority;
    use crate::store::LibSqlBackend;
    use crate::testing::sample_request;

    async fn machine_with(request: &Request) -> FunnelStateMachine {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(db.insert_request(request).await.unwrap());
        FunnelStateMachine::new(Arc::new(db))
    }

    // ── Assignment tests ────────────────────────────────────────────

    #[tokio::test]
    async fn assign_sets_stage_and_records_history() {
        let request = sample_request("REQ-001", None);
        let machine = machine_with(&request).await;

        let assigned = machine
            .assign(&request.id, "user-1", "manager", Some("handle this".into()))
            .await
            .unwrap();
        assert_eq!(assigned.funnel_stage, FunnelStage::Assigned);
        assert_eq!(assigned.assigned_user_id.as_deref(), Some("user-1"));

        let history = machine.history(&request.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].assigned_from, None);
        assert_eq!(history[0].assigned_to, "user-1");
        assert_eq!(history[0].notes.as_deref(), Some("handle this"));
    }

    #[tokio::test]
    async fn reassign_from_quoted_appends_history() {
        let request = sample_request("REQ-002", None);
        let machine = machine_with(&request).await;

        machine.assign(&request.id, "user-1", "manager", None).await.unwrap();
        machine.update_stage(&request.id, "Quoted").await.unwrap();
        let reassigned = machine
            .assign(&request.id, "user-2", "manager", None)
            .await
            .unwrap();

        assert_eq!(reassigned.funnel_stage, FunnelStage::Assigned);
        let history = machine.history(&request.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].assigned_from.as_deref(), Some("user-1"));
        assert_eq!(history[1].assigned_to, "user-2");
    }

    #[tokio::test]
    async fn assign_validates_before_side_effects() {
        let request = sample_request("REQ-003", None);
        let machine = machine_with(&request).await;

        let err = machine.assign(&request.id, "  ", "manager", None).await.unwrap_err();
        assert!(matches!(err, FunnelError::Validation(_)));
        assert!(machine.history(&request.id).await.unwrap().is_empty());
        assert_eq!(
            machine.get(&request.id).await.unwrap().funnel_stage,
            FunnelStage::New
        );
    }

    #[tokio::test]
    async fn assign_missing_request_is_not_found() {
        let machine = machine_with(&sample_request("REQ-004", None)).await;
        let err = machine.assign("nope", "user-1", "manager", None).await.unwrap_err();
        assert!(matches!(err, FunnelError::NotFound { .. }));
    }

    // ── Stage tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn update_stage_is_permissive() {
        let request = sample_request("REQ-005", None);
        let machine = machine_with(&request).await;

        machine.update_stage(&request.id, "closed").await.unwrap();
        let reverted = machine.update_stage(&request.id, "New").await.unwrap();
        assert_eq!(reverted.funnel_stage, FunnelStage::New);
    }

    #[tokio::test]
    async fn invalid_stage_is_rejected() {
        let request = sample_request("REQ-006", None);
        let machine = machine_with(&request).await;
        let err = machine.update_stage(&request.id, "Won").await.unwrap_err();
        assert!(matches!(err, FunnelError::Validation(_)));
    }

    #[tokio::test]
    async fn quotation_sent_is_idempotent() {
        let request = sample_request("REQ-007", None);
        let machine = machine_with(&request).await;

        let first = machine.on_quotation_sent(&request.id).await.unwrap();
        assert_eq!(first.funnel_stage, FunnelStage::Quoted);
        let second = machine.on_quotation_sent(&request.id).await.unwrap();
        assert_eq!(second.funnel_stage, FunnelStage::Quoted);
        assert_eq!(second.updated_at, first.updated_at);
    }

    // ── Updates and threading ───────────────────────────────────────

    #[tokio::test]
    async fn update_changes_only_given_fields() {
        let request = sample_request("REQ-008", None);
        let machine = machine_with(&request).await;

        let updated = machine
            .update(
                &request.id,
                RequestUpdate {
                    priority: Some(Priority::High),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, Priority::High);
        assert_eq!(updated.requirements, request.requirements);

        let err = machine
            .update(&request.id, RequestUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FunnelError::Validation(_)));
    }

    #[tokio::test]
    async fn thread_info_falls_back_to_message_id() {
        let mut request = sample_request("REQ-009", None);
        request.email_message_id = Some("<orig@acme.test>".into());
        request.email_references = None;
        let machine = machine_with(&request).await;

        let info = machine.thread_info(&request.id).await.unwrap();
        assert_eq!(info.in_reply_to.as_deref(), Some("<orig@acme.test>"));
        assert_eq!(info.references.as_deref(), Some("<orig@acme.test>"));
    }
}
