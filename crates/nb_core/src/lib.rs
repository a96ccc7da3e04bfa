pub mod analysis;
pub mod error;
pub mod store;
pub mod types;
pub mod vector;

pub use analysis::{AnalysisError, Analyzer};
pub use error::Error;
pub use store::{ArticleStore, RunStore};
pub use types::{
    AnalysisResult, Article, ArticleId, ArticleStatus, Brief, BriefCluster, BriefMember, Cluster,
    FailureReport, RunRecord, RunStats, RunStatus,
};
pub use vector::{cosine_similarity, dot, normalize};

pub type Result<T> = std::result::Result<T, Error>;
