//! Funnel request types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FunnelError;

/// Stage of a request in the sales funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunnelStage {
    New,
    Assigned,
    Quoted,
    Closed,
}

impl FunnelStage {
    pub const ALL: [FunnelStage; 4] = [
        FunnelStage::New,
        FunnelStage::Assigned,
        FunnelStage::Quoted,
        FunnelStage::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStage::New => "New",
            FunnelStage::Assigned => "Assigned",
            FunnelStage::Quoted => "Quoted",
            FunnelStage::Closed => "Closed",
        }
    }
}

impl fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunnelStage {
    type Err = FunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                FunnelError::Validation(format!(
                    "invalid funnel stage '{s}', expected one of New, Assigned, Quoted, Closed"
                ))
            })
    }
}

/// Request priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = FunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                FunnelError::Validation(format!(
                    "invalid priority '{s}', expected one of Low, Medium, High, Urgent"
                ))
            })
    }
}

/// A sales request derived from one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    /// Human-readable code, `REQ-001` and up.
    pub code: String,
    /// Inbound message this request was derived from.
    pub message_id: Option<String>,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub subject: Option<String>,
    pub requirements: String,
    pub original_content: String,
    pub source: String,
    pub funnel_stage: FunnelStage,
    pub priority: Priority,
    pub assigned_user_id: Option<String>,
    /// Message-ID of the inbound mail, for threading replies.
    pub email_message_id: Option<String>,
    pub email_references: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row, one per assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentHistoryEntry {
    pub id: String,
    pub request_id: String,
    pub assigned_from: Option<String>,
    pub assigned_to: String,
    pub assigned_by: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filters for listing requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilter {
    pub funnel_stage: Option<FunnelStage>,
    pub assigned_user_id: Option<String>,
    pub priority: Option<Priority>,
    /// Substring match on the customer address.
    pub customer_email: Option<String>,
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

/// Partial update of a request's editable fields.
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub requirements: Option<String>,
    pub priority: Option<Priority>,
    pub funnel_stage: Option<FunnelStage>,
}

impl RequestUpdate {
    pub fn is_empty(&self) -> bool {
        self.requirements.is_none() && self.priority.is_none() && self.funnel_stage.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub total: i64,
    pub new: i64,
    pub assigned: i64,
    pub quoted: i64,
    pub closed: i64,
    pub by_stage: BTreeMap<String, i64>,
    pub by_priority: BTreeMap<String, i64>,
}

impl RequestStats {
    /// Build from per-stage and per-priority counts.
    pub fn from_counts(
        by_stage: BTreeMap<String, i64>,
        by_priority: BTreeMap<String, i64>,
    ) -> Self {
        let count = |stage: FunnelStage| by_stage.get(stage.as_str()).copied().unwrap_or(0);
        Self {
            total: by_stage.values().sum(),
            new: count(FunnelStage::New),
            assigned: count(FunnelStage::Assigned),
            quoted: count(FunnelStage::Quoted),
            closed: count(FunnelStage::Closed),
            by_stage,
            by_priority,
        }
    }
}

/// Threading headers for replying to the customer about a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}
