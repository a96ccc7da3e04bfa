use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nb_analysis::{GeminiAnalyzer, GeminiConfig};
use nb_core::{Analyzer, ArticleStore, Error, Result, RunStore};
use nb_pipeline::{Pipeline, PipelineConfig, SalienceWeights};
use nb_store::MemoryStore;
use tracing::{error, info};

#[derive(Debug, Clone)]
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    /// Accepts compound durations like "1h30m" or "90s"; a bare number is
    /// taken as seconds.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut total_seconds = 0u64;
        let mut current_number = String::new();
        let mut has_value = false;

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_number.push(c);
            } else if c.is_whitespace() {
                continue;
            } else {
                let num: u64 = current_number
                    .parse()
                    .map_err(|_| format!("expected a number before '{}'", c))?;
                total_seconds += match c {
                    's' => num,
                    'm' => num * 60,
                    'h' => num * 3600,
                    'd' => num * 86400,
                    other => return Err(format!("invalid duration unit: {}", other)),
                };
                current_number.clear();
                has_value = true;
            }
        }

        if !current_number.is_empty() {
            total_seconds += current_number
                .parse::<u64>()
                .map_err(|_| "invalid number in duration".to_string())?;
            has_value = true;
        }

        if !has_value {
            return Err("duration must include a number".to_string());
        }
        Ok(HumanDuration(Duration::from_secs(total_seconds)))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "News analysis, clustering and brief pipeline", long_about = None)]
struct Cli {
    /// Storage backend to use. Available: memory, sqlite
    #[arg(long, default_value = "sqlite")]
    storage: String,
    #[arg(long, default_value = "feeder.db")]
    db_path: PathBuf,
    /// Destination for the rendered brief (overwritten each run)
    #[arg(long, default_value = "news_brief.md")]
    output: PathBuf,
    /// Gemini API key; falls back to the GEMINI_API_KEY environment variable
    #[arg(long)]
    api_key: Option<String>,
    /// Cosine similarity threshold for joining a cluster
    #[arg(long, default_value_t = 0.75)]
    similarity_threshold: f32,
    /// Concurrent analysis calls against the external service
    #[arg(long, default_value_t = 5)]
    workers: usize,
    /// Attempts per analysis request, including the first
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
    /// Number of insight lines at the top of the brief
    #[arg(long, default_value_t = 5)]
    top_insights: usize,
    /// Maximum articles selected per run
    #[arg(long, default_value_t = 60)]
    batch_limit: usize,
    /// Hours of already-analyzed history to include in clustering (0 = off)
    #[arg(long, default_value_t = 0)]
    history_hours: i64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Execute the pipeline
    Run {
        /// Run a single pipeline pass and exit
        #[arg(long)]
        once: bool,
        /// Interval between scheduled runs (e.g. 1h, 30m, 1h15m30s)
        #[arg(long, default_value = "1h")]
        interval: HumanDuration,
    },
}

async fn create_stores(cli: &Cli) -> Result<(Arc<dyn ArticleStore>, Arc<dyn RunStore>)> {
    match cli.storage.as_str() {
        "memory" => {
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let store = Arc::new(nb_store::SqliteStore::new_with_path(&cli.db_path).await?);
            Ok((store.clone(), store))
        }
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => Err(Error::Store(
            "this binary was built without sqlite support".to_string(),
        )),
        other => Err(Error::Store(format!("unknown storage backend: {}", other))),
    }
}

fn create_analyzer(cli: &Cli) -> Result<Arc<dyn Analyzer>> {
    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var("GEMINI_API_KEY").ok())
        .unwrap_or_default();
    let mut config = GeminiConfig::new(api_key);
    config.max_attempts = cli.max_attempts;
    Ok(Arc::new(GeminiAnalyzer::new(config)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let (articles, runs) = create_stores(&cli).await?;
    info!("storage initialized (using {})", cli.storage);

    let analyzer = create_analyzer(&cli)?;
    info!("analysis client initialized (using {})", analyzer.name());

    let config = PipelineConfig {
        similarity_threshold: cli.similarity_threshold,
        workers: cli.workers,
        batch_limit: cli.batch_limit,
        top_insights: cli.top_insights,
        history_hours: cli.history_hours,
        output_path: cli.output.clone(),
        weights: SalienceWeights::default(),
    };
    let pipeline = Pipeline::new(articles, runs, analyzer, config);

    match cli.command {
        Commands::Run { once, interval } => {
            if once {
                let report = pipeline.run_once().await?;
                info!(
                    "run {}: {} analyzed, {} failed",
                    report.record.run_id, report.record.stats.analyzed, report.record.stats.failed
                );
            } else {
                info!("running every {}s", interval.0.as_secs());
                loop {
                    match pipeline.run_once().await {
                        Ok(report) => info!(
                            "run {}: {} analyzed, {} failed",
                            report.record.run_id,
                            report.record.stats.analyzed,
                            report.record.stats.failed
                        ),
                        Err(e) => error!("pipeline run failed: {}", e),
                    }
                    info!("waiting {}s before next run", interval.0.as_secs());
                    tokio::time::sleep(interval.0).await;
                }
            }
        }
    }

    Ok(())
}
