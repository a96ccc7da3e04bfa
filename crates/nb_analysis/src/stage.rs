use std::sync::Arc;

use futures::future::join_all;
use nb_core::{
    AnalysisResult, Analyzer, Article, ArticleStore, Error, FailureReport, Result,
};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// What the Analysis Stage hands to the Clustering Engine: committed
/// results in canonical (published_at, id) order, plus the per-article
/// failure report.
pub struct StageOutcome {
    pub analyzed: Vec<(Article, AnalysisResult)>,
    pub failures: Vec<FailureReport>,
}

/// Drives the Analysis Client over a claimed batch with bounded
/// concurrency. One article's terminal failure never aborts the batch;
/// store failures do.
pub struct AnalysisStage {
    analyzer: Arc<dyn Analyzer>,
    store: Arc<dyn ArticleStore>,
    semaphore: Arc<Semaphore>,
}

impl AnalysisStage {
    pub fn new(analyzer: Arc<dyn Analyzer>, store: Arc<dyn ArticleStore>, workers: usize) -> Self {
        Self {
            analyzer,
            store,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn execute(&self, batch: Vec<Article>) -> Result<StageOutcome> {
        info!("analyzing {} articles with {}", batch.len(), self.analyzer.name());

        let article_futures: Vec<_> = batch
            .into_iter()
            .map(|article| {
                let analyzer = self.analyzer.clone();
                let store = self.store.clone();
                let semaphore = self.semaphore.clone();
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| Error::External(e.into()))?;
                    match analyzer.analyze(&article).await {
                        Ok(result) => {
                            store.commit_analysis(&article.id, &result).await?;
                            Ok::<_, Error>(Ok((article, result)))
                        }
                        Err(e) => {
                            warn!("analysis failed for {} ({}): {}", article.id, article.title, e);
                            store.mark_failed(&article.id).await?;
                            Ok(Err(FailureReport {
                                article_id: article.id.clone(),
                                reason: e.to_string(),
                            }))
                        }
                    }
                }
            })
            .collect();

        let mut analyzed = Vec::new();
        let mut failures = Vec::new();
        for outcome in join_all(article_futures).await {
            match outcome? {
                Ok(pair) => analyzed.push(pair),
                Err(report) => failures.push(report),
            }
        }

        // Completion order is nondeterministic under concurrency; downstream
        // clustering requires the canonical order.
        analyzed.sort_by(|(a, _), (b, _)| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        failures.sort_by(|a, b| a.article_id.cmp(&b.article_id));

        info!("analysis stage done: {} analyzed, {} failed", analyzed.len(), failures.len());
        Ok(StageOutcome { analyzed, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use nb_core::{AnalysisError, ArticleId, ArticleStatus};
    use nb_store::MemoryStore;
    use std::collections::HashSet;

    struct MockAnalyzer {
        fail: HashSet<ArticleId>,
    }

    #[async_trait]
    impl Analyzer for MockAnalyzer {
        fn name(&self) -> &str {
            "mock"
        }

        async fn analyze(&self, article: &Article) -> std::result::Result<AnalysisResult, AnalysisError> {
            if self.fail.contains(&article.id) {
                return Err(AnalysisError::Timeout);
            }
            Ok(AnalysisResult {
                article_id: article.id.clone(),
                summary: format!("Summary of {}", article.title),
                sentiment: 0.1,
                topics: vec!["testing".to_string()],
                entities: vec![],
                embedding: vec![1.0, 0.0, 0.0],
            })
        }
    }

    fn article(n: u32) -> Article {
        let url = format!("https://example.com/story/{}", n);
        Article {
            id: ArticleId::from_url(&url).unwrap(),
            url,
            source: "example".to_string(),
            title: format!("Story {}", n),
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, n, 0, 0).unwrap(),
            extracted_text: Some("Body".to_string()),
            status: ArticleStatus::Claimed,
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let store = Arc::new(MemoryStore::new());
        let articles: Vec<Article> = (1..=5).map(article).collect();
        for a in &articles {
            store.upsert_article(a).await.unwrap();
        }

        let fail: HashSet<ArticleId> = [articles[1].id.clone(), articles[3].id.clone()]
            .into_iter()
            .collect();
        let stage = AnalysisStage::new(
            Arc::new(MockAnalyzer { fail: fail.clone() }),
            store.clone() as Arc<dyn ArticleStore>,
            2,
        );

        let outcome = stage.execute(articles.clone()).await.unwrap();
        assert_eq!(outcome.analyzed.len(), 3);
        assert_eq!(outcome.failures.len(), 2);
        for report in &outcome.failures {
            assert!(fail.contains(&report.article_id));
        }

        assert_eq!(store.count_by_status(ArticleStatus::Analyzed).await.unwrap(), 3);
        assert_eq!(store.count_by_status(ArticleStatus::Failed).await.unwrap(), 2);
        assert_eq!(store.count_by_status(ArticleStatus::Claimed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_results_come_back_in_canonical_order() {
        let store = Arc::new(MemoryStore::new());
        // Insert out of order; publication hour encodes the expected order.
        let articles: Vec<Article> = [4, 1, 3, 2].into_iter().map(article).collect();
        for a in &articles {
            store.upsert_article(a).await.unwrap();
        }

        let stage = AnalysisStage::new(
            Arc::new(MockAnalyzer { fail: HashSet::new() }),
            store as Arc<dyn ArticleStore>,
            4,
        );
        let outcome = stage.execute(articles).await.unwrap();

        use chrono::Timelike;
        let hours: Vec<u32> = outcome
            .analyzed
            .iter()
            .map(|(a, _)| a.published_at.hour())
            .collect();
        assert_eq!(hours, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let store = Arc::new(MemoryStore::new());
        let stage = AnalysisStage::new(
            Arc::new(MockAnalyzer { fail: HashSet::new() }),
            store as Arc<dyn ArticleStore>,
            2,
        );
        let outcome = stage.execute(Vec::new()).await.unwrap();
        assert!(outcome.analyzed.is_empty());
        assert!(outcome.failures.is_empty());
    }
}
