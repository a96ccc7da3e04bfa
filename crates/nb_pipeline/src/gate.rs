use std::sync::Arc;

use chrono::{DateTime, Utc};
use nb_core::{Article, ArticleId, ArticleStatus, ArticleStore, Result};
use tracing::{debug, info};

/// Ingestion Gate: select the run's delta and claim it atomically. The
/// claim transition is the only side effect; a crashed run's claims are
/// re-offered by the next selection.
pub async fn select_batch(
    store: &Arc<dyn ArticleStore>,
    watermark: Option<DateTime<Utc>>,
    limit: usize,
) -> Result<Vec<Article>> {
    match watermark {
        Some(w) => debug!("selecting delta; last watermark {}", w),
        None => debug!("selecting delta; no prior watermark"),
    }

    let mut batch = store.select_unanalyzed(limit).await?;
    if batch.is_empty() {
        info!("no articles awaiting analysis");
        return Ok(batch);
    }

    let ids: Vec<ArticleId> = batch.iter().map(|a| a.id.clone()).collect();
    store.claim(&ids).await?;
    for article in &mut batch {
        article.status = ArticleStatus::Claimed;
    }
    info!("claimed {} articles for this run", batch.len());
    Ok(batch)
}
