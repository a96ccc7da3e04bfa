pub mod cache;
pub mod client;
pub mod stage;

pub use cache::ResultCache;
pub use client::{GeminiAnalyzer, GeminiConfig};
pub use stage::{AnalysisStage, StageOutcome};
