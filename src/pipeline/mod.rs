//! Email-to-request ingestion pipeline.
//!
//! Every fetched message flows through:
//! 1. `MessageIngestor::ingest()`, which parses and deduplicates on Message-ID
//! 2. `Extractor::extract()` and `ForwardingOrchestrator::forward()`, concurrently
//! 3. `RequestDeriver::derive()`, which creates the funnel request
//!
//! `PollingScheduler` drives this per account on a timer.

pub mod attachments;
pub mod deriver;
pub mod extraction;
pub mod forwarding;
pub mod parser;
pub mod poller;
pub mod processor;
pub mod types;

pub use attachments::AttachmentStore;
pub use deriver::RequestDeriver;
pub use extraction::{DisabledExtractor, Extractor, HttpExtractor, extractor_from_config};
pub use forwarding::ForwardingOrchestrator;
pub use parser::{Ingested, MessageIngestor};
pub use poller::{PollingScheduler, PollingStatus, SchedulerHandle, SweepReport};
pub use processor::{IntakePipeline, MessageOutcome};
