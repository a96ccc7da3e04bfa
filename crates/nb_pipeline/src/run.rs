use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use nb_analysis::{AnalysisStage, ResultCache};
use nb_core::{
    Analyzer, ArticleStore, Brief, FailureReport, Result, RunRecord, RunStats, RunStatus, RunStore,
};
use tracing::{error, info};

use crate::brief::BriefCompiler;
use crate::cluster::ClusteringEngine;
use crate::config::PipelineConfig;
use crate::gate;

/// What one run produced, alongside the finalized RunRecord.
pub struct RunReport {
    pub record: RunRecord,
    pub brief: Option<Brief>,
    pub failures: Vec<FailureReport>,
}

/// Sequences Selecting → Analyzing → Clustering → Compiling for one run.
/// The in-progress RunRecord doubles as the mutual exclusion flag; an
/// external timer is expected to call `run_once` and nothing else.
pub struct Pipeline {
    store: Arc<dyn ArticleStore>,
    runs: Arc<dyn RunStore>,
    analyzer: Arc<dyn Analyzer>,
    config: PipelineConfig,
}

struct StageResults {
    stats: RunStats,
    watermark: Option<DateTime<Utc>>,
    brief: Option<Brief>,
    failures: Vec<FailureReport>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        runs: Arc<dyn RunStore>,
        analyzer: Arc<dyn Analyzer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            runs,
            analyzer,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<RunReport> {
        let previous = self.runs.last_completed_run().await?;
        let inherited = previous.as_ref().and_then(|r| r.watermark);

        let mut record = RunRecord::begin(Utc::now());
        self.runs.begin_run(&record).await?;
        info!("run {} started", record.run_id);

        match self.execute_stages(inherited).await {
            Ok(results) => {
                record.status = RunStatus::Completed;
                record.ended_at = Some(Utc::now());
                record.stats = results.stats;
                record.watermark = results.watermark.or(inherited);
                self.runs.finish_run(&record).await?;
                info!(
                    "run {} completed: {} fetched, {} analyzed, {} failed",
                    record.run_id, record.stats.fetched, record.stats.analyzed, record.stats.failed
                );
                Ok(RunReport {
                    record,
                    brief: results.brief,
                    failures: results.failures,
                })
            }
            Err(e) => {
                error!("run {} failed: {}", record.run_id, e);
                record.status = RunStatus::Failed;
                record.ended_at = Some(Utc::now());
                record.watermark = inherited;
                if let Err(finish_err) = self.runs.finish_run(&record).await {
                    error!("could not finalize failed run {}: {}", record.run_id, finish_err);
                }
                Err(e)
            }
        }
    }

    async fn execute_stages(&self, watermark: Option<DateTime<Utc>>) -> Result<StageResults> {
        let batch = gate::select_batch(&self.store, watermark, self.config.batch_limit).await?;
        if batch.is_empty() {
            return Ok(StageResults {
                stats: RunStats::default(),
                watermark: None,
                brief: None,
                failures: Vec::new(),
            });
        }
        let fetched = batch.len();

        let stage = AnalysisStage::new(self.analyzer.clone(), self.store.clone(), self.config.workers);
        let outcome = stage.execute(batch).await?;
        let stats = RunStats {
            fetched,
            analyzed: outcome.analyzed.len(),
            failed: outcome.failures.len(),
        };
        // Canonical order means the last analyzed article carries the
        // newest publication timestamp.
        let watermark = outcome.analyzed.last().map(|(a, _)| a.published_at);

        if outcome.analyzed.is_empty() {
            info!("nothing analyzed this run; skipping brief");
            return Ok(StageResults {
                stats,
                watermark,
                brief: None,
                failures: outcome.failures,
            });
        }

        let mut cache = ResultCache::new();
        for (article, result) in &outcome.analyzed {
            cache.insert(article.clone(), result.clone());
        }
        if self.config.history_hours > 0 {
            let cutoff = Utc::now() - Duration::hours(self.config.history_hours);
            let seeded = cache.seed_history(&self.store, cutoff).await?;
            info!("seeded {} history articles for clustering", seeded);
        }

        let engine = ClusteringEngine::new(
            self.config.similarity_threshold,
            self.config.weights.clone(),
        );
        let clusters = engine.cluster(&cache)?;

        let compiler = BriefCompiler::new(self.config.top_insights);
        let brief = compiler.compile(Utc::now(), stats, &clusters, &cache)?;
        let rendered = compiler.render(&brief);
        compiler.write_brief(&self.config.output_path, &rendered)?;
        self.store.store_brief(&brief, &rendered).await?;

        Ok(StageResults {
            stats,
            watermark,
            brief: Some(brief),
            failures: outcome.failures,
        })
    }
}
