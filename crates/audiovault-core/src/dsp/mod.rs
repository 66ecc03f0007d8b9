//! DSP pipeline: filtering, feature analysis, and per-chunk processing

pub mod analyzer;
pub mod filters;
pub mod processor;

pub use analyzer::{AudioAnalyzer, AudioMetrics};
pub use filters::{FilterChain, FilterKind};
pub use processor::{AudioProcessor, ProcessingResult, ProcessingStage};
