use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{AnalysisResult, Article, ArticleId, ArticleStatus, Brief, RunRecord};
use crate::Result;

/// Persistent article table. The pipeline's write surface is limited to
/// per-article status transitions and analysis results; no cross-article
/// locking is needed.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn upsert_article(&self, article: &Article) -> Result<()>;

    async fn get_article(&self, id: &ArticleId) -> Result<Option<Article>>;

    /// Articles awaiting analysis, ordered by (published_at, id) ascending.
    /// Returns `Extracted` rows plus stale `Claimed` ones so a crashed run
    /// never strands work.
    async fn select_unanalyzed(&self, limit: usize) -> Result<Vec<Article>>;

    /// Atomically transition the given articles to `Claimed`.
    async fn claim(&self, ids: &[ArticleId]) -> Result<()>;

    /// The durable commit point for one article: write the result and
    /// transition to `Analyzed` together.
    async fn commit_analysis(&self, id: &ArticleId, result: &AnalysisResult) -> Result<()>;

    async fn mark_failed(&self, id: &ArticleId) -> Result<()>;

    async fn get_analysis(&self, id: &ArticleId) -> Result<Option<AnalysisResult>>;

    /// Analyzed articles with `published_at` at or after the cutoff, with
    /// their results; read-only history input for clustering.
    async fn analyzed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Article, AnalysisResult)>>;

    async fn count_by_status(&self, status: ArticleStatus) -> Result<usize>;

    /// Keep the rendered brief alongside its structured form.
    async fn store_brief(&self, brief: &Brief, rendered: &str) -> Result<()>;
}

/// Run metadata. `begin_run` doubles as the run-level mutual exclusion
/// guard: it must refuse while another record is still in progress.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn begin_run(&self, record: &RunRecord) -> Result<()>;

    async fn finish_run(&self, record: &RunRecord) -> Result<()>;

    async fn last_completed_run(&self) -> Result<Option<RunRecord>>;
}
