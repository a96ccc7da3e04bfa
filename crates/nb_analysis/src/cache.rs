use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nb_core::{AnalysisResult, Article, ArticleId, ArticleStore, Result};

type CanonicalKey = (DateTime<Utc>, ArticleId);

/// Per-run holding area for analysis results, keyed by article identity and
/// iterated in canonical (published_at, id) order. Lets the Clustering
/// Engine work without touching the analysis service again.
#[derive(Default)]
pub struct ResultCache {
    entries: BTreeMap<CanonicalKey, (Article, AnalysisResult)>,
    index: HashMap<ArticleId, CanonicalKey>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, article: Article, result: AnalysisResult) {
        let key = (article.published_at, article.id.clone());
        self.index.insert(article.id.clone(), key.clone());
        self.entries.insert(key, (article, result));
    }

    pub fn contains(&self, id: &ArticleId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ArticleId) -> Option<&(Article, AnalysisResult)> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    pub fn ordered(&self) -> impl Iterator<Item = &(Article, AnalysisResult)> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seed already-analyzed articles published since `cutoff` as read-only
    /// history, so ongoing stories cluster together with today's batch.
    /// Entries already in the cache win; history is never rewritten.
    pub async fn seed_history(
        &mut self,
        store: &Arc<dyn ArticleStore>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let mut added = 0;
        for (article, result) in store.analyzed_since(cutoff).await? {
            if !self.contains(&article.id) {
                self.insert(article, result);
                added += 1;
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nb_core::ArticleStatus;
    use nb_store::MemoryStore;

    fn entry(n: u32) -> (Article, AnalysisResult) {
        let url = format!("https://example.com/story/{}", n);
        let id = ArticleId::from_url(&url).unwrap();
        (
            Article {
                id: id.clone(),
                url,
                source: "example".to_string(),
                title: format!("Story {}", n),
                published_at: Utc.with_ymd_and_hms(2024, 5, 1, n, 0, 0).unwrap(),
                extracted_text: Some("Body".to_string()),
                status: ArticleStatus::Analyzed,
            },
            AnalysisResult {
                article_id: id,
                summary: format!("Summary {}", n),
                sentiment: 0.0,
                topics: vec![],
                entities: vec![],
                embedding: vec![1.0, 0.0],
            },
        )
    }

    #[test]
    fn test_ordered_iteration() {
        let mut cache = ResultCache::new();
        for n in [3, 1, 2] {
            let (a, r) = entry(n);
            cache.insert(a, r);
        }
        let titles: Vec<&str> = cache.ordered().map(|(a, _)| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Story 1", "Story 2", "Story 3"]);
    }

    #[tokio::test]
    async fn test_history_does_not_overwrite_run_entries() {
        let store = Arc::new(MemoryStore::new());
        let (article, result) = entry(1);
        store.upsert_article(&article).await.unwrap();
        store.commit_analysis(&article.id, &result).await.unwrap();

        let mut cache = ResultCache::new();
        let mut fresh = result.clone();
        fresh.summary = "Fresh summary".to_string();
        cache.insert(article.clone(), fresh);

        let store: Arc<dyn ArticleStore> = store;
        let added = cache
            .seed_history(&store, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(cache.get(&article.id).unwrap().1.summary, "Fresh summary");
    }

    #[tokio::test]
    async fn test_history_seeding_adds_missing_articles() {
        let store = Arc::new(MemoryStore::new());
        for n in 1..=2 {
            let (article, result) = entry(n);
            store.upsert_article(&article).await.unwrap();
            store.commit_analysis(&article.id, &result).await.unwrap();
        }

        let mut cache = ResultCache::new();
        let store: Arc<dyn ArticleStore> = store;
        let added = cache
            .seed_history(&store, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(cache.len(), 2);
    }
}
