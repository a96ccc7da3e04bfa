use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Stable article identity: hex SHA-256 of the canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleId(pub String);

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ArticleId {
    /// Derive the id from a URL. Scheme and host are lowercased, default
    /// ports and trailing slashes dropped, so trivially different spellings
    /// of the same link hash identically.
    pub fn from_url(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?;
        let mut canonical = format!(
            "{}://{}",
            parsed.scheme().to_lowercase(),
            parsed.host_str().unwrap_or_default().to_lowercase()
        );
        if let Some(port) = parsed.port() {
            canonical.push_str(&format!(":{}", port));
        }
        canonical.push_str(parsed.path().trim_end_matches('/'));
        if let Some(query) = parsed.query() {
            canonical.push('?');
            canonical.push_str(query);
        }
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(Self(format!("{:x}", digest)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Fetched,
    Extracted,
    /// In-flight sub-state of `Extracted`: selected for the current run but
    /// not yet committed. Stale claims are re-offered after a crash.
    Claimed,
    Analyzed,
    Failed,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Extracted => "extracted",
            Self::Claimed => "claimed",
            Self::Analyzed => "analyzed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fetched" => Ok(Self::Fetched),
            "extracted" => Ok(Self::Extracted),
            "claimed" => Ok(Self::Claimed),
            "analyzed" => Ok(Self::Analyzed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Store(format!("unknown article status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub url: String,
    pub source: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub extracted_text: Option<String>,
    pub status: ArticleStatus,
}

/// AI-derived analysis for one article. Immutable once committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub article_id: ArticleId,
    pub summary: String,
    /// Bounded to [-1, 1].
    pub sentiment: f32,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub embedding: Vec<f32>,
}

/// One topic cluster produced by a run. Members are ordered by
/// (published_at, id); the centroid is the unit-normalized mean of member
/// embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub members: Vec<ArticleId>,
    pub centroid: Vec<f32>,
    pub salience: f64,
    /// Most recent member, used for the headline and summary.
    pub representative: ArticleId,
    /// Most common member topics, joined with " / ".
    pub label: String,
    pub newest_published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub fetched: usize,
    pub analyzed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub article_id: ArticleId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefMember {
    pub title: String,
    pub source: String,
    pub url: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefCluster {
    pub title: String,
    pub label: String,
    pub tone: String,
    pub summary: String,
    pub sources: Vec<String>,
    pub members: Vec<BriefMember>,
}

/// The output document of a run, ranked by descending cluster salience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brief {
    pub generated_at: DateTime<Utc>,
    pub stats: RunStats,
    pub insights: Vec<String>,
    pub clusters: Vec<BriefCluster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Store(format!("unknown run status: {}", other))),
        }
    }
}

/// The only cross-run state the pipeline keeps besides article statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Latest published_at among articles analyzed by this run, inherited
    /// from the previous completed run when nothing was analyzed.
    pub watermark: Option<DateTime<Utc>>,
    pub stats: RunStats,
}

impl RunRecord {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: format!("run-{}", started_at.timestamp_millis()),
            started_at,
            ended_at: None,
            status: RunStatus::InProgress,
            watermark: None,
            stats: RunStats::default(),
        }
    }
}
