//! Pretrained image classifiers from a model hub: fetch, preprocess, infer, trace-export.

pub mod config;
pub mod export;
pub mod fetch;
pub mod hub;
pub mod inference;
pub mod labels;
pub mod pipeline;
pub mod preprocess;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{ModelSource, PipelineConfig};
pub use export::{Exported, Exporter, TraceRecord};
pub use fetch::{AssetFetcher, FetchError, Fetched, Retrieve, RetrieveError};
pub use hub::{HubCache, HubEntry, HubError, ModelHub};
pub use inference::{Prediction, PretrainedModel, Scores};
pub use labels::Synset;
pub use pipeline::{PipelineContext, PipelineReport, Step};
pub use preprocess::Preprocess;
