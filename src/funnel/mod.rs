//! Sales funnel: request types and stage transitions.

pub mod machine;
pub mod model;

pub use machine::FunnelStateMachine;
pub use model::{
    AssignmentHistoryEntry, FunnelStage, Priority, Request, RequestFilter, RequestStats,
    RequestUpdate, ThreadInfo,
};
