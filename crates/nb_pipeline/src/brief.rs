use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use nb_analysis::ResultCache;
use nb_core::{
    Brief, BriefCluster, BriefMember, Cluster, Error, Result, RunStats,
};
use tracing::info;

/// Renders ranked clusters into the brief document. Compilation and
/// rendering are pure; writing the file is an idempotent overwrite.
pub struct BriefCompiler {
    top_insights: usize,
}

impl BriefCompiler {
    pub fn new(top_insights: usize) -> Self {
        Self { top_insights }
    }

    pub fn compile(
        &self,
        generated_at: DateTime<Utc>,
        stats: RunStats,
        clusters: &[Cluster],
        cache: &ResultCache,
    ) -> Result<Brief> {
        let mut brief_clusters = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let (rep_article, rep_result) = cache.get(&cluster.representative).ok_or_else(|| {
                Error::Clustering(format!(
                    "representative {} missing from result cache",
                    cluster.representative
                ))
            })?;

            let mut sentiment_sum = 0.0f32;
            let mut sources = BTreeSet::new();
            let mut members = Vec::with_capacity(cluster.members.len());
            for id in &cluster.members {
                let (article, result) = cache.get(id).ok_or_else(|| {
                    Error::Clustering(format!("member {} missing from result cache", id))
                })?;
                sentiment_sum += result.sentiment;
                sources.insert(article.source.clone());
                members.push(BriefMember {
                    title: article.title.clone(),
                    source: article.source.clone(),
                    url: article.url.clone(),
                    summary: result.summary.clone(),
                });
            }
            let mean_sentiment = sentiment_sum / cluster.members.len() as f32;

            brief_clusters.push(BriefCluster {
                title: rep_article.title.clone(),
                label: cluster.label.clone(),
                tone: tone_word(mean_sentiment).to_string(),
                summary: rep_result.summary.clone(),
                sources: sources.into_iter().collect(),
                members,
            });
        }

        let insights = brief_clusters
            .iter()
            .take(self.top_insights)
            .map(insight_line)
            .collect();

        Ok(Brief {
            generated_at,
            stats,
            insights,
            clusters: brief_clusters,
        })
    }

    pub fn render(&self, brief: &Brief) -> String {
        let mut out = String::new();
        out.push_str("# Daily News Brief\n\n");
        out.push_str(&format!(
            "**{}** — {} fetched, {} analyzed, {} failed\n\n",
            brief.generated_at.format("%Y-%m-%d %H:%M UTC"),
            brief.stats.fetched,
            brief.stats.analyzed,
            brief.stats.failed
        ));

        if !brief.insights.is_empty() {
            out.push_str("## Key Insights\n\n");
            for insight in &brief.insights {
                out.push_str(&format!("- {}\n", insight));
            }
            out.push('\n');
        }

        out.push_str("## Top Stories\n\n");
        for (i, cluster) in brief.clusters.iter().enumerate() {
            out.push_str(&format!("### {}\n\n", cluster.title));
            out.push_str(&format!(
                "*{} sentiment • {}*\n\n",
                capitalize(&cluster.tone),
                cluster.label
            ));
            if !cluster.summary.is_empty() {
                out.push_str(&format!("{}\n\n", cluster.summary));
            }
            for member in &cluster.members {
                out.push_str(&format!(
                    "- [{}]({}) — {}\n",
                    member.title, member.url, member.source
                ));
            }
            out.push('\n');
            out.push_str(&format!("*Sources: {}*\n\n", cluster.sources.join(", ")));
            if i + 1 < brief.clusters.len() {
                out.push_str("---\n\n");
            }
        }

        out
    }

    pub fn write_brief(&self, path: &Path, rendered: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, rendered)?;
        info!("brief written to {}", path.display());
        Ok(())
    }
}

fn insight_line(cluster: &BriefCluster) -> String {
    let count = cluster.members.len();
    if count == 1 {
        format!("One {} story on {}: {}", cluster.tone, cluster.label, cluster.summary)
    } else {
        format!(
            "{} related {} stories on {}: {}",
            count, cluster.tone, cluster.label, cluster.summary
        )
    }
}

fn tone_word(sentiment: f32) -> &'static str {
    if sentiment > 0.3 {
        "positive"
    } else if sentiment < -0.3 {
        "negative"
    } else {
        "neutral"
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusteringEngine, SalienceWeights};
    use chrono::TimeZone;
    use nb_core::{AnalysisResult, Article, ArticleId, ArticleStatus};

    fn entry(n: u32, embedding: Vec<f32>, sentiment: f32) -> (Article, AnalysisResult) {
        let url = format!("https://example.com/story/{}", n);
        let id = ArticleId::from_url(&url).unwrap();
        (
            Article {
                id: id.clone(),
                url,
                source: format!("feed-{}", n % 2),
                title: format!("Story {}", n),
                published_at: Utc.with_ymd_and_hms(2024, 5, 1, n, 0, 0).unwrap(),
                extracted_text: Some("Body".to_string()),
                status: ArticleStatus::Analyzed,
            },
            AnalysisResult {
                article_id: id,
                summary: format!("Summary {}.", n),
                sentiment,
                topics: vec!["economy".to_string()],
                entities: vec![],
                embedding,
            },
        )
    }

    fn compiled() -> (Brief, String) {
        let mut cache = ResultCache::new();
        for (a, r) in [
            entry(1, vec![1.0, 0.0], 0.6),
            entry(2, vec![0.99, 0.141], 0.6),
            entry(3, vec![0.0, 1.0], -0.8),
        ] {
            cache.insert(a, r);
        }
        let clusters = ClusteringEngine::new(0.75, SalienceWeights::default())
            .cluster(&cache)
            .unwrap();
        let compiler = BriefCompiler::new(5);
        let stats = RunStats { fetched: 3, analyzed: 3, failed: 0 };
        let generated_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let brief = compiler.compile(generated_at, stats, &clusters, &cache).unwrap();
        let rendered = compiler.render(&brief);
        (brief, rendered)
    }

    #[test]
    fn test_render_structure() {
        let (brief, rendered) = compiled();
        assert_eq!(brief.clusters.len(), 2);
        assert!(rendered.starts_with("# Daily News Brief\n"));
        assert!(rendered.contains("3 fetched, 3 analyzed, 0 failed"));
        assert!(rendered.contains("## Key Insights"));
        assert!(rendered.contains("## Top Stories"));
        assert!(rendered.contains("Positive sentiment"));
        assert!(rendered.contains("*Sources: "));
        // One divider between two clusters.
        assert_eq!(rendered.matches("---").count(), 1);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let (_, a) = compiled();
        let (_, b) = compiled();
        assert_eq!(a, b);
    }

    #[test]
    fn test_insights_bounded_by_top_n() {
        let mut cache = ResultCache::new();
        for n in 1..=4 {
            // Orthogonalish singleton clusters.
            let mut embedding = vec![0.0; 4];
            embedding[(n - 1) as usize] = 1.0;
            let (a, r) = entry(n, embedding, 0.0);
            cache.insert(a, r);
        }
        let clusters = ClusteringEngine::new(0.75, SalienceWeights::default())
            .cluster(&cache)
            .unwrap();
        let compiler = BriefCompiler::new(2);
        let brief = compiler
            .compile(Utc::now(), RunStats::default(), &clusters, &cache)
            .unwrap();
        assert_eq!(brief.clusters.len(), 4);
        assert_eq!(brief.insights.len(), 2);
    }

    #[test]
    fn test_write_is_idempotent_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brief.md");
        let compiler = BriefCompiler::new(5);
        compiler.write_brief(&path, "first").unwrap();
        compiler.write_brief(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }
}
