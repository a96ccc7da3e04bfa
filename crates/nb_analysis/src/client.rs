use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nb_core::{AnalysisError, AnalysisResult, Analyzer, Article};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-1.5-pro";
const DEFAULT_EMBEDDING_MODEL: &str = "models/embedding-001";
const MAX_TOPICS: usize = 5;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Input longer than this is truncated, not rejected.
    pub max_text_chars: usize,
}

impl GeminiConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_text_chars: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    sentiment_score: f32,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    entities: Vec<String>,
}

/// Analysis Client over the Gemini HTTP API: one generateContent call for
/// summary/sentiment/topics/entities, one embedContent call for the vector.
pub struct GeminiAnalyzer {
    client: Arc<Client>,
    config: GeminiConfig,
}

impl fmt::Debug for GeminiAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiAnalyzer")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl GeminiAnalyzer {
    pub fn new(config: GeminiConfig) -> nb_core::Result<Self> {
        if config.api_key.is_empty() {
            return Err(nb_core::Error::Analysis("Gemini API key is required".to_string()));
        }
        Ok(Self {
            client: Arc::new(Client::new()),
            config,
        })
    }

    async fn generate_once(&self, prompt: &str) -> Result<String, AnalysisError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                max_output_tokens: 1024,
            },
        };

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent?key={}",
                self.config.base_url, self.config.model, self.config.api_key
            ))
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Malformed(e.to_string()))?;

        let text: String = body
            .candidates
            .first()
            .map(|c| c.content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(AnalysisError::Malformed("empty model reply".to_string()));
        }
        Ok(text)
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, AnalysisError> {
        let request = EmbedRequest {
            model: self.config.embedding_model.clone(),
            content: Content {
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(format!(
                "{}/{}:embedContent?key={}",
                self.config.base_url, self.config.embedding_model, self.config.api_key
            ))
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Malformed(e.to_string()))?;
        if body.embedding.values.is_empty() {
            return Err(AnalysisError::Malformed("empty embedding".to_string()));
        }
        Ok(body.embedding.values)
    }

    async fn generate_with_retry(&self, prompt: &str) -> Result<String, AnalysisError> {
        let mut attempt = 0;
        loop {
            match self.generate_once(prompt).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    let delay = self.config.base_delay * 2u32.pow(attempt);
                    tracing::warn!(
                        "analysis call failed ({}), retrying {}/{} after {:?}",
                        e,
                        attempt + 1,
                        self.config.max_attempts,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, AnalysisError> {
        let mut attempt = 0;
        loop {
            match self.embed_once(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    let delay = self.config.base_delay * 2u32.pow(attempt);
                    tracing::warn!(
                        "embedding call failed ({}), retrying {}/{} after {:?}",
                        e,
                        attempt + 1,
                        self.config.max_attempts,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn analyze(&self, article: &Article) -> Result<AnalysisResult, AnalysisError> {
        let text = article.extracted_text.as_deref().unwrap_or("").trim();
        if text.is_empty() {
            return Err(AnalysisError::InvalidInput(
                "article has no extracted text".to_string(),
            ));
        }
        let text = truncate_chars(text, self.config.max_text_chars);

        let prompt = build_prompt(&article.title, text);
        let reply = self.generate_with_retry(&prompt).await?;
        let raw = parse_analysis_payload(&reply)?;
        let embedding = self.embed_with_retry(text).await?;

        Ok(AnalysisResult {
            article_id: article.id.clone(),
            summary: raw.summary.trim().to_string(),
            sentiment: raw.sentiment_score.clamp(-1.0, 1.0),
            topics: raw.topics.into_iter().take(MAX_TOPICS).collect(),
            entities: raw.entities,
            embedding,
        })
    }
}

fn build_prompt(title: &str, text: &str) -> String {
    format!(
        r#"Analyze the following news article:

Title: {}

Content: {}

Provide:
1. A concise summary (1-2 sentences)
2. Sentiment score (a single float from -1.0 to 1.0)
3. Main topics (a JSON list of up to 5 keywords or phrases)
4. Key entities mentioned (a JSON list of people, organizations, places)

Respond strictly as a JSON object with keys: "summary", "sentiment_score", "topics", "entities"."#,
        title, text
    )
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Models tend to wrap JSON replies in markdown fences or prose; take the
/// outermost brace pair rather than insisting on a bare object.
fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

fn parse_analysis_payload(reply: &str) -> Result<RawAnalysis, AnalysisError> {
    let block = extract_json_block(reply)
        .ok_or_else(|| AnalysisError::Malformed("no JSON object in reply".to_string()))?;
    serde_json::from_str(block).map_err(|e| AnalysisError::Malformed(e.to_string()))
}

fn classify_transport(e: reqwest::Error) -> AnalysisError {
    if e.is_timeout() {
        AnalysisError::Timeout
    } else {
        // Connection refused/reset: retryable, same as a gateway error.
        AnalysisError::Server(e.status().map(|s| s.as_u16()).unwrap_or(503))
    }
}

fn classify_status(status: StatusCode) -> AnalysisError {
    match status.as_u16() {
        429 => AnalysisError::RateLimited,
        403 => AnalysisError::QuotaExhausted,
        code if status.is_client_error() => {
            AnalysisError::InvalidInput(format!("request rejected with status {}", code))
        }
        code => AnalysisError::Server(code),
    }
}
