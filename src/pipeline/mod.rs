//! Upload pipeline.

pub mod ingest;
pub mod sanitize;

pub use ingest::{ByteSource, ChoiceOutcome, IngestOutcome, IngestPipeline, PipelineDeps};
pub use sanitize::sanitize_file_name;
