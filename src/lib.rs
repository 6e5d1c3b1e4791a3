//! Funnel Intake: turns inbound department mail into tracked sales requests.

pub mod api;
pub mod config;
pub mod error;
pub mod funnel;
pub mod mail;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
