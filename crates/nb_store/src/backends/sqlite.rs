use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nb_core::{
    AnalysisResult, Article, ArticleId, ArticleStatus, ArticleStore, Brief, Error, Result,
    RunRecord, RunStats, RunStatus, RunStore,
};
use sqlx::{sqlite::SqlitePool, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        source TEXT NOT NULL,
        title TEXT NOT NULL,
        published_at TEXT NOT NULL,
        extracted_text TEXT,
        status TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analyses (
        article_id TEXT PRIMARY KEY,
        summary TEXT NOT NULL,
        sentiment REAL NOT NULL,
        topics TEXT NOT NULL,
        entities TEXT NOT NULL,
        embedding TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        status TEXT NOT NULL,
        watermark TEXT,
        fetched INTEGER NOT NULL,
        analyzed INTEGER NOT NULL,
        failed INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS briefs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        generated_at TEXT NOT NULL,
        content TEXT NOT NULL,
        article_count INTEGER NOT NULL,
        cluster_count INTEGER NOT NULL
    )
    "#,
    // Add future migrations here
];

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    pub async fn new_with_path(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .await
            .map_err(|e| Error::Store(format!("failed to connect to database: {}", e)))?;

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            sqlx::query(migration)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to run migration {}: {}", i, e)))?;
        }

        // Opening the database takes over the run-level mutex. Any
        // in_progress row left behind belongs to a dead process; its claims
        // are re-offered by select_unanalyzed, so finalize it as failed
        // instead of refusing every future run.
        let recovered = sqlx::query(
            "UPDATE runs SET status = 'failed', ended_at = ? WHERE status = 'in_progress'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .map_err(|e| Error::Store(format!("failed to recover abandoned runs: {}", e)))?;
        if recovered.rows_affected() > 0 {
            warn!("marked {} abandoned run(s) as failed", recovered.rows_affected());
        }

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn row_to_article(row: &sqlx::sqlite::SqliteRow) -> Result<Article> {
        let published_at: String = row.get("published_at");
        let status: String = row.get("status");
        Ok(Article {
            id: ArticleId(row.get("id")),
            url: row.get("url"),
            source: row.get("source"),
            title: row.get("title"),
            published_at: DateTime::parse_from_rfc3339(&published_at)
                .map_err(|e| Error::Store(format!("failed to parse date: {}", e)))?
                .with_timezone(&Utc),
            extracted_text: row.get::<Option<String>, _>("extracted_text"),
            status: ArticleStatus::parse(&status)?,
        })
    }

    fn row_to_analysis(row: &sqlx::sqlite::SqliteRow) -> Result<AnalysisResult> {
        let topics: String = row.get("topics");
        let entities: String = row.get("entities");
        let embedding: String = row.get("embedding");
        Ok(AnalysisResult {
            article_id: ArticleId(row.get("article_id")),
            summary: row.get("summary"),
            sentiment: row.get::<f64, _>("sentiment") as f32,
            topics: serde_json::from_str(&topics)?,
            entities: serde_json::from_str(&entities)?,
            embedding: serde_json::from_str(&embedding)?,
        })
    }
}

#[async_trait]
impl ArticleStore for SqliteStore {
    async fn upsert_article(&self, article: &Article) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO articles
            (id, url, source, title, published_at, extracted_text, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.id.0)
        .bind(&article.url)
        .bind(&article.source)
        .bind(&article.title)
        .bind(article.published_at.to_rfc3339())
        .bind(article.extracted_text.as_deref())
        .bind(article.status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to upsert article: {}", e)))?;
        Ok(())
    }

    async fn get_article(&self, id: &ArticleId) -> Result<Option<Article>> {
        let row = sqlx::query("SELECT * FROM articles WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Store(format!("failed to get article: {}", e)))?;
        row.as_ref().map(Self::row_to_article).transpose()
    }

    async fn select_unanalyzed(&self, limit: usize) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM articles
            WHERE status IN ('extracted', 'claimed')
            ORDER BY published_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to select articles: {}", e)))?;
        rows.iter().map(Self::row_to_article).collect()
    }

    async fn claim(&self, ids: &[ArticleId]) -> Result<()> {
        for id in ids {
            let outcome = sqlx::query(
                r#"
                UPDATE articles SET status = 'claimed'
                WHERE id = ? AND status IN ('extracted', 'claimed')
                "#,
            )
            .bind(&id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Store(format!("failed to claim article: {}", e)))?;
            if outcome.rows_affected() == 0 {
                return Err(Error::Store(format!("cannot claim article {}", id)));
            }
        }
        Ok(())
    }

    async fn commit_analysis(&self, id: &ArticleId, result: &AnalysisResult) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Store(format!("failed to begin transaction: {}", e)))?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO analyses
            (article_id, summary, sentiment, topics, entities, embedding)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id.0)
        .bind(&result.summary)
        .bind(result.sentiment as f64)
        .bind(serde_json::to_string(&result.topics)?)
        .bind(serde_json::to_string(&result.entities)?)
        .bind(serde_json::to_string(&result.embedding)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Store(format!("failed to store analysis: {}", e)))?;

        sqlx::query("UPDATE articles SET status = 'analyzed' WHERE id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Store(format!("failed to update status: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Store(format!("failed to commit analysis: {}", e)))?;
        Ok(())
    }

    async fn mark_failed(&self, id: &ArticleId) -> Result<()> {
        sqlx::query("UPDATE articles SET status = 'failed' WHERE id = ?")
            .bind(&id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Store(format!("failed to mark article failed: {}", e)))?;
        Ok(())
    }

    async fn get_analysis(&self, id: &ArticleId) -> Result<Option<AnalysisResult>> {
        let row = sqlx::query("SELECT * FROM analyses WHERE article_id = ?")
            .bind(&id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Store(format!("failed to get analysis: {}", e)))?;
        row.as_ref().map(Self::row_to_analysis).transpose()
    }

    async fn analyzed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Article, AnalysisResult)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.*, n.article_id, n.summary, n.sentiment, n.topics, n.entities, n.embedding
            FROM articles a JOIN analyses n ON n.article_id = a.id
            WHERE a.status = 'analyzed' AND a.published_at >= ?
            ORDER BY a.published_at ASC, a.id ASC
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to load analyzed articles: {}", e)))?;

        rows.iter()
            .map(|row| Ok((Self::row_to_article(row)?, Self::row_to_analysis(row)?)))
            .collect()
    }

    async fn count_by_status(&self, status: ArticleStatus) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM articles WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| Error::Store(format!("failed to count articles: {}", e)))?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn store_brief(&self, brief: &Brief, rendered: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO briefs (generated_at, content, article_count, cluster_count)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(brief.generated_at.to_rfc3339())
        .bind(rendered)
        .bind(brief.stats.analyzed as i64)
        .bind(brief.clusters.len() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to store brief: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn begin_run(&self, record: &RunRecord) -> Result<()> {
        // Guard and insert in one statement so two concurrent callers can
        // never both pass the check.
        let outcome = sqlx::query(
            r#"
            INSERT INTO runs (run_id, started_at, ended_at, status, watermark, fetched, analyzed, failed)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM runs WHERE status = 'in_progress')
            "#,
        )
        .bind(&record.run_id)
        .bind(record.started_at.to_rfc3339())
        .bind(record.ended_at.map(|t| t.to_rfc3339()))
        .bind(record.status.as_str())
        .bind(record.watermark.map(|t| t.to_rfc3339()))
        .bind(record.stats.fetched as i64)
        .bind(record.stats.analyzed as i64)
        .bind(record.stats.failed as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to record run: {}", e)))?;
        if outcome.rows_affected() == 0 {
            return Err(Error::RunInProgress);
        }
        Ok(())
    }

    async fn finish_run(&self, record: &RunRecord) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            UPDATE runs SET ended_at = ?, status = ?, watermark = ?,
                fetched = ?, analyzed = ?, failed = ?
            WHERE run_id = ?
            "#,
        )
        .bind(record.ended_at.map(|t| t.to_rfc3339()))
        .bind(record.status.as_str())
        .bind(record.watermark.map(|t| t.to_rfc3339()))
        .bind(record.stats.fetched as i64)
        .bind(record.stats.analyzed as i64)
        .bind(record.stats.failed as i64)
        .bind(&record.run_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to finish run: {}", e)))?;
        if outcome.rows_affected() == 0 {
            return Err(Error::Store(format!("unknown run: {}", record.run_id)));
        }
        Ok(())
    }

    async fn last_completed_run(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM runs WHERE status = 'completed'
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to load last run: {}", e)))?;

        let Some(row) = row else { return Ok(None) };
        let started_at: String = row.get("started_at");
        let ended_at: Option<String> = row.get("ended_at");
        let status: String = row.get("status");
        let watermark: Option<String> = row.get("watermark");

        let parse = |s: &str| -> Result<DateTime<Utc>> {
            Ok(DateTime::parse_from_rfc3339(s)
                .map_err(|e| Error::Store(format!("failed to parse date: {}", e)))?
                .with_timezone(&Utc))
        };

        Ok(Some(RunRecord {
            run_id: row.get("run_id"),
            started_at: parse(&started_at)?,
            ended_at: ended_at.as_deref().map(parse).transpose()?,
            status: RunStatus::parse(&status)?,
            watermark: watermark.as_deref().map(parse).transpose()?,
            stats: RunStats {
                fetched: row.get::<i64, _>("fetched") as usize,
                analyzed: row.get::<i64, _>("analyzed") as usize,
                failed: row.get::<i64, _>("failed") as usize,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_lifecycle() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new_with_path(&db_path).await.unwrap();

        let article = Article {
            id: ArticleId::from_url("https://example.com/story/1").unwrap(),
            url: "https://example.com/story/1".to_string(),
            source: "example".to_string(),
            title: "Story 1".to_string(),
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            extracted_text: Some("Body".to_string()),
            status: ArticleStatus::Extracted,
        };
        store.upsert_article(&article).await.unwrap();

        let batch = store.select_unanalyzed(10).await.unwrap();
        assert_eq!(batch.len(), 1);

        store.claim(&[article.id.clone()]).await.unwrap();
        let reoffered = store.select_unanalyzed(10).await.unwrap();
        assert_eq!(reoffered.len(), 1);
        assert_eq!(reoffered[0].status, ArticleStatus::Claimed);

        let result = AnalysisResult {
            article_id: article.id.clone(),
            summary: "Summary".to_string(),
            sentiment: -0.4,
            topics: vec!["economy".to_string()],
            entities: vec!["Example Corp".to_string()],
            embedding: vec![0.1, 0.2, 0.3],
        };
        store.commit_analysis(&article.id, &result).await.unwrap();

        assert!(store.select_unanalyzed(10).await.unwrap().is_empty());
        let loaded = store.get_analysis(&article.id).await.unwrap().unwrap();
        assert_eq!(loaded.topics, result.topics);
        assert_eq!(loaded.embedding, result.embedding);

        let history = store
            .analyzed_since(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_run_records() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("runs.db");
        let store = SqliteStore::new_with_path(&db_path).await.unwrap();

        let mut record = RunRecord::begin(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        store.begin_run(&record).await.unwrap();
        assert!(matches!(
            store.begin_run(&RunRecord::begin(Utc::now())).await,
            Err(Error::RunInProgress)
        ));

        record.status = RunStatus::Completed;
        record.ended_at = Some(Utc::now());
        record.watermark = Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap());
        record.stats.analyzed = 3;
        store.finish_run(&record).await.unwrap();

        let last = store.last_completed_run().await.unwrap().unwrap();
        assert_eq!(last.run_id, record.run_id);
        assert_eq!(last.stats.analyzed, 3);
        assert_eq!(last.watermark, record.watermark);
    }

    #[tokio::test]
    async fn test_reopening_recovers_abandoned_run() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("crash.db");
        {
            let store = SqliteStore::new_with_path(&db_path).await.unwrap();
            let abandoned = RunRecord::begin(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
            store.begin_run(&abandoned).await.unwrap();
            // Dropped without finish_run, as after a crash.
        }

        let store = SqliteStore::new_with_path(&db_path).await.unwrap();
        let mut record = RunRecord::begin(Utc::now());
        store.begin_run(&record).await.unwrap();
        record.status = RunStatus::Completed;
        record.ended_at = Some(Utc::now());
        store.finish_run(&record).await.unwrap();

        // The abandoned run was finalized as failed, not completed.
        let last = store.last_completed_run().await.unwrap().unwrap();
        assert_eq!(last.run_id, record.run_id);
    }
}
