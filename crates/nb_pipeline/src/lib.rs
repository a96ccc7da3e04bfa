pub mod brief;
pub mod cluster;
pub mod config;
pub mod gate;
pub mod run;

pub use brief::BriefCompiler;
pub use cluster::{ClusteringEngine, SalienceWeights};
pub use config::PipelineConfig;
pub use run::{Pipeline, RunReport};
