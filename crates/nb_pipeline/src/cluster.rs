use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nb_analysis::ResultCache;
use nb_core::{dot, normalize, ArticleId, Cluster, Error, Result};
use tracing::{debug, info};

/// Salience term weights. Member count and recency must stay positive so
/// larger, fresher clusters always rank higher.
#[derive(Debug, Clone)]
pub struct SalienceWeights {
    pub count: f64,
    pub recency: f64,
    pub sentiment: f64,
}

impl Default for SalienceWeights {
    fn default() -> Self {
        Self {
            count: 2.0,
            recency: 1.5,
            sentiment: 0.5,
        }
    }
}

struct BuildingCluster {
    members: Vec<ArticleId>,
    /// Running sum of unit member embeddings; the comparison centroid is
    /// this sum re-normalized.
    sum: Vec<f32>,
    centroid: Vec<f32>,
    newest: DateTime<Utc>,
    representative: ArticleId,
    max_abs_sentiment: f32,
    topic_counts: HashMap<String, usize>,
}

impl BuildingCluster {
    fn add_topics(&mut self, topics: &[String]) {
        for topic in topics {
            let topic = topic.trim();
            if !topic.is_empty() {
                *self.topic_counts.entry(topic.to_string()).or_insert(0) += 1;
            }
        }
    }

    fn label(&self) -> String {
        let mut counted: Vec<(&String, &usize)> = self.topic_counts.iter().collect();
        // Frequency first, alphabetical tie-break, so labels are stable.
        counted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top: Vec<&str> = counted.iter().take(3).map(|(t, _)| t.as_str()).collect();
        if top.is_empty() {
            "general".to_string()
        } else {
            top.join(" / ")
        }
    }
}

/// Greedy single-link agglomeration against cluster centroids with a fixed
/// similarity threshold. Input order is the cache's canonical order, so
/// identical inputs always produce identical clusters.
pub struct ClusteringEngine {
    tau: f32,
    weights: SalienceWeights,
}

impl ClusteringEngine {
    pub fn new(tau: f32, weights: SalienceWeights) -> Self {
        Self { tau, weights }
    }

    pub fn cluster(&self, cache: &ResultCache) -> Result<Vec<Cluster>> {
        let mut dim: Option<usize> = None;
        let mut building: Vec<BuildingCluster> = Vec::new();

        for (article, result) in cache.ordered() {
            if result.embedding.is_empty() {
                return Err(Error::Clustering(format!(
                    "article {} reached clustering without an embedding",
                    article.id
                )));
            }
            match dim {
                None => dim = Some(result.embedding.len()),
                Some(d) if d != result.embedding.len() => {
                    return Err(Error::Clustering(format!(
                        "article {} embedding dimension {} differs from {}",
                        article.id,
                        result.embedding.len(),
                        d
                    )));
                }
                _ => {}
            }
            let unit = normalize(&result.embedding)?;

            // Join the first cluster (in creation order) whose centroid is
            // close enough, otherwise start a new one.
            let joined = building.iter().position(|c| dot(&unit, &c.centroid) > self.tau);
            match joined {
                Some(i) => {
                    let cluster = &mut building[i];
                    cluster.members.push(article.id.clone());
                    for (s, u) in cluster.sum.iter_mut().zip(unit.iter()) {
                        *s += u;
                    }
                    cluster.centroid = normalize(&cluster.sum)?;
                    if article.published_at > cluster.newest {
                        cluster.newest = article.published_at;
                        cluster.representative = article.id.clone();
                    }
                    cluster.max_abs_sentiment =
                        cluster.max_abs_sentiment.max(result.sentiment.abs());
                    cluster.add_topics(&result.topics);
                }
                None => {
                    let mut fresh = BuildingCluster {
                        members: vec![article.id.clone()],
                        sum: unit.clone(),
                        centroid: unit,
                        newest: article.published_at,
                        representative: article.id.clone(),
                        max_abs_sentiment: result.sentiment.abs(),
                        topic_counts: HashMap::new(),
                    };
                    fresh.add_topics(&result.topics);
                    building.push(fresh);
                }
            }
        }

        if building.is_empty() {
            return Ok(Vec::new());
        }

        // Recency is measured against the newest article in the batch, not
        // the wall clock, so re-running over the same input is byte-stable.
        let reference = building.iter().map(|c| c.newest).max().unwrap_or_default();

        let mut clusters: Vec<Cluster> = building
            .into_iter()
            .map(|c| {
                let salience = self.salience(c.members.len(), c.newest, reference, c.max_abs_sentiment);
                debug!(
                    "cluster of {} ({}): salience {:.3}",
                    c.members.len(),
                    c.label(),
                    salience
                );
                Cluster {
                    label: c.label(),
                    members: c.members,
                    centroid: c.centroid,
                    salience,
                    representative: c.representative,
                    newest_published_at: c.newest,
                }
            })
            .collect();

        clusters.sort_by(|a, b| {
            b.salience
                .partial_cmp(&a.salience)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.members[0].cmp(&b.members[0]))
        });

        info!("clustered {} articles into {} clusters", cache.len(), clusters.len());
        Ok(clusters)
    }

    fn salience(
        &self,
        member_count: usize,
        newest: DateTime<Utc>,
        reference: DateTime<Utc>,
        max_abs_sentiment: f32,
    ) -> f64 {
        let age_hours = (reference - newest).num_seconds().max(0) as f64 / 3600.0;
        let recency = (-age_hours / 24.0).exp();
        self.weights.count * ((1 + member_count) as f64).ln()
            + self.weights.recency * recency
            + self.weights.sentiment * max_abs_sentiment as f64
    }
}
