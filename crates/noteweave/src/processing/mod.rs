//! Background ingestion: queue, worker pool and document lifecycle

mod documents;
mod pipeline;
mod queue;
mod worker;

pub use documents::{DocumentContent, DocumentService, Upload};
pub use pipeline::{IngestOutcome, IngestPipeline};
pub use queue::{IngestProgress, IngestQueue, IngestStage, QueueStats};
pub use worker::IngestionWorker;
