use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nb_core::{
    AnalysisResult, Article, ArticleId, ArticleStatus, ArticleStore, Brief, Error, Result,
    RunRecord, RunStatus, RunStore,
};
use std::sync::Arc;
use tokio::sync::RwLock;

struct Inner {
    articles: Vec<(Article, Option<AnalysisResult>)>,
    runs: Vec<RunRecord>,
    briefs: Vec<(Brief, String)>,
}

impl Inner {
    fn new() -> Self {
        Self {
            articles: Vec::new(),
            runs: Vec::new(),
            briefs: Vec::new(),
        }
    }

    fn entry_mut(&mut self, id: &ArticleId) -> Result<&mut (Article, Option<AnalysisResult>)> {
        self.articles
            .iter_mut()
            .find(|(a, _)| &a.id == id)
            .ok_or_else(|| Error::Store(format!("unknown article: {}", id)))
    }
}

/// In-memory Article Store and RunRecord store. The default backend for
/// tests and single-shot runs.
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::new())),
        }
    }

    pub async fn last_brief(&self) -> Option<(Brief, String)> {
        self.inner.read().await.briefs.last().cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn upsert_article(&self, article: &Article) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some((existing, _)) = inner.articles.iter_mut().find(|(a, _)| a.id == article.id) {
            *existing = article.clone();
        } else {
            inner.articles.push((article.clone(), None));
        }
        Ok(())
    }

    async fn get_article(&self, id: &ArticleId) -> Result<Option<Article>> {
        let inner = self.inner.read().await;
        Ok(inner
            .articles
            .iter()
            .find(|(a, _)| &a.id == id)
            .map(|(a, _)| a.clone()))
    }

    async fn select_unanalyzed(&self, limit: usize) -> Result<Vec<Article>> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<Article> = inner
            .articles
            .iter()
            .filter(|(a, _)| {
                matches!(a.status, ArticleStatus::Extracted | ArticleStatus::Claimed)
            })
            .map(|(a, _)| a.clone())
            .collect();
        candidates.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim(&self, ids: &[ArticleId]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for id in ids {
            let (article, _) = inner.entry_mut(id)?;
            match article.status {
                ArticleStatus::Extracted | ArticleStatus::Claimed => {
                    article.status = ArticleStatus::Claimed;
                }
                other => {
                    return Err(Error::Store(format!(
                        "cannot claim article {} in status {}",
                        id,
                        other.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn commit_analysis(&self, id: &ArticleId, result: &AnalysisResult) -> Result<()> {
        let mut inner = self.inner.write().await;
        let (article, analysis) = inner.entry_mut(id)?;
        article.status = ArticleStatus::Analyzed;
        *analysis = Some(result.clone());
        Ok(())
    }

    async fn mark_failed(&self, id: &ArticleId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let (article, _) = inner.entry_mut(id)?;
        article.status = ArticleStatus::Failed;
        Ok(())
    }

    async fn get_analysis(&self, id: &ArticleId) -> Result<Option<AnalysisResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .articles
            .iter()
            .find(|(a, _)| &a.id == id)
            .and_then(|(_, r)| r.clone()))
    }

    async fn analyzed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Article, AnalysisResult)>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<(Article, AnalysisResult)> = inner
            .articles
            .iter()
            .filter(|(a, r)| {
                a.status == ArticleStatus::Analyzed && a.published_at >= cutoff && r.is_some()
            })
            .map(|(a, r)| (a.clone(), r.clone().unwrap()))
            .collect();
        rows.sort_by(|(a, _), (b, _)| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn count_by_status(&self, status: ArticleStatus) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner.articles.iter().filter(|(a, _)| a.status == status).count())
    }

    async fn store_brief(&self, brief: &Brief, rendered: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.briefs.push((brief.clone(), rendered.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn begin_run(&self, record: &RunRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.runs.iter().any(|r| r.status == RunStatus::InProgress) {
            return Err(Error::RunInProgress);
        }
        inner.runs.push(record.clone());
        Ok(())
    }

    async fn finish_run(&self, record: &RunRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .runs
            .iter_mut()
            .find(|r| r.run_id == record.run_id)
            .ok_or_else(|| Error::Store(format!("unknown run: {}", record.run_id)))?;
        *existing = record.clone();
        Ok(())
    }

    async fn last_completed_run(&self) -> Result<Option<RunRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .max_by_key(|r| r.started_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nb_core::RunStats;

    fn article(n: u32, status: ArticleStatus) -> Article {
        let url = format!("https://example.com/story/{}", n);
        Article {
            id: ArticleId::from_url(&url).unwrap(),
            url,
            source: "example".to_string(),
            title: format!("Story {}", n),
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, n, 0, 0).unwrap(),
            extracted_text: Some(format!("Body of story {}", n)),
            status,
        }
    }

    fn result_for(article: &Article) -> AnalysisResult {
        AnalysisResult {
            article_id: article.id.clone(),
            summary: format!("Summary of {}", article.title),
            sentiment: 0.2,
            topics: vec!["testing".to_string()],
            entities: vec![],
            embedding: vec![1.0, 0.0, 0.0],
        }
    }

    #[tokio::test]
    async fn test_selection_is_idempotent() {
        let store = MemoryStore::new();
        for n in 0..3 {
            store.upsert_article(&article(n, ArticleStatus::Extracted)).await.unwrap();
        }

        let first = store.select_unanalyzed(10).await.unwrap();
        let second = store.select_unanalyzed(10).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
            second.iter().map(|a| a.id.clone()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_claimed_articles_are_reoffered() {
        let store = MemoryStore::new();
        let a = article(1, ArticleStatus::Extracted);
        store.upsert_article(&a).await.unwrap();
        store.claim(&[a.id.clone()]).await.unwrap();

        // A crashed run leaves claims behind; the next selection sees them.
        let batch = store.select_unanalyzed(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, ArticleStatus::Claimed);
    }

    #[tokio::test]
    async fn test_commit_is_the_only_durable_transition() {
        let store = MemoryStore::new();
        let a = article(1, ArticleStatus::Extracted);
        store.upsert_article(&a).await.unwrap();
        store.claim(&[a.id.clone()]).await.unwrap();
        store.commit_analysis(&a.id, &result_for(&a)).await.unwrap();

        assert!(store.select_unanalyzed(10).await.unwrap().is_empty());
        assert_eq!(store.count_by_status(ArticleStatus::Analyzed).await.unwrap(), 1);
        assert!(store.get_analysis(&a.id).await.unwrap().is_some());

        // Committed articles can no longer be claimed.
        assert!(store.claim(&[a.id.clone()]).await.is_err());
    }

    #[tokio::test]
    async fn test_selection_order_is_canonical() {
        let store = MemoryStore::new();
        for n in [3, 1, 2] {
            store.upsert_article(&article(n, ArticleStatus::Extracted)).await.unwrap();
        }
        let batch = store.select_unanalyzed(10).await.unwrap();
        let hours: Vec<u32> = batch
            .iter()
            .map(|a| {
                use chrono::Timelike;
                a.published_at.hour()
            })
            .collect();
        assert_eq!(hours, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_rejected() {
        let store = MemoryStore::new();
        let mut first = RunRecord::begin(Utc::now());
        store.begin_run(&first).await.unwrap();

        let second = RunRecord::begin(Utc::now());
        assert!(matches!(
            store.begin_run(&second).await,
            Err(Error::RunInProgress)
        ));

        first.status = RunStatus::Completed;
        first.ended_at = Some(Utc::now());
        store.finish_run(&first).await.unwrap();
        store.begin_run(&second).await.unwrap();

        let last = store.last_completed_run().await.unwrap().unwrap();
        assert_eq!(last.run_id, first.run_id);
    }

    #[tokio::test]
    async fn test_last_brief_tracks_latest_render() {
        let store = MemoryStore::new();
        assert!(store.last_brief().await.is_none());

        let brief = Brief {
            generated_at: Utc::now(),
            stats: RunStats::default(),
            insights: vec![],
            clusters: vec![],
        };
        store.store_brief(&brief, "# first").await.unwrap();
        store.store_brief(&brief, "# second").await.unwrap();

        let (_, rendered) = store.last_brief().await.unwrap();
        assert_eq!(rendered, "# second");
    }
}
