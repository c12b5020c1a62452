pub mod config;
pub mod pipeline;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{ConfigError, PageFailurePolicy, PipelineConfig, RenderOrder, StagingMode};
pub use pipeline::{
    DocumentSource, FailureKind, LoadHandle, LoadOutcome, LoadPipeline, LoadSummary, PageImage,
    PageLookup, PageStore, PipelineError, PipelineEvent, ProgressEvent, ProgressSink,
};
