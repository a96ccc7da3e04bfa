use std::path::PathBuf;

use crate::cluster::SalienceWeights;

/// Tunable policy for one pipeline instance. Defaults follow the shipped
/// configuration; every field is operator-adjustable, none is a contract.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Cosine similarity threshold for joining a cluster.
    pub similarity_threshold: f32,
    /// Concurrent analysis calls against the external service.
    pub workers: usize,
    /// Maximum articles selected per run.
    pub batch_limit: usize,
    /// Number of insight lines at the top of the brief.
    pub top_insights: usize,
    /// Lookback window for read-only clustering history; 0 disables it.
    pub history_hours: i64,
    pub output_path: PathBuf,
    pub weights: SalienceWeights,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            workers: 5,
            batch_limit: 60,
            top_insights: 5,
            history_hours: 0,
            output_path: PathBuf::from("news_brief.md"),
            weights: SalienceWeights::default(),
        }
    }
}
