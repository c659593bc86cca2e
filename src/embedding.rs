use crate::error::{RagError, RagResult};
use crate::llm::ApiFlavor;
use crate::vector_db::Embedding;
use async_trait::async_trait;
use lazy_static::lazy_static;
use ndarray::Array1;
use regex::Regex;
use rustc_hash::{FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use std::time::Duration;
use unicode_normalization::UnicodeNormalization;

/// Dimension of the sentence embeddings used by the reference deployment.
pub const DEFAULT_DIMENSION: usize = 384;

/// Turns text into fixed-dimension vectors, one per input and in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Embedding>>;
}

lazy_static! {
    static ref STOP_WORDS: FxHashSet<&'static str> = {
        let words = vec![
            "a", "an", "and", "are", "as", "at", "be", "by", "for", "from",
            "has", "he", "in", "is", "it", "its", "of", "on", "that", "the",
            "to", "was", "were", "will", "with"
        ];
        words.into_iter().collect()
    };
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").expect("valid regex");
}

/// Normalizes, lowercases and splits text, dropping punctuation and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.nfc().collect::<String>().to_lowercase();
    let text = NON_WORD.replace_all(&text, " ");

    text.split_whitespace()
        .filter(|&token| !STOP_WORDS.contains(token))
        .map(|token| token.to_string())
        .collect()
}

/// Offline embedder: hashed bag-of-words, L2-normalized.
///
/// Deterministic across runs and platforms, so indexes built with it can be
/// reopened by later processes.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashingEmbedder { dimension }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write(token.as_bytes());
        (hasher.finish() % self.dimension as u64) as usize
    }

    pub fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = Array1::<f32>::zeros(self.dimension);
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }

        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector /= norm;
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Embedding>> {
        if self.dimension == 0 {
            return Err(RagError::ModelUnavailable("hashing embedder has zero dimension".into()));
        }
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    http: reqwest::Client,
    endpoint: String,
    api_version: String,
    flavor: ApiFlavor,
    model: String,
    api_key: String,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_version: impl Into<String>,
        flavor: ApiFlavor,
        model: impl Into<String>,
        api_key: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> RagResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::ModelUnavailable(format!("could not build HTTP client: {e}")))?;

        Ok(RemoteEmbedder {
            http,
            endpoint: endpoint.into(),
            api_version: api_version.into(),
            flavor,
            model: model.into(),
            api_key: api_key.into(),
            dimension,
        })
    }
}

/// Orders a batch response by input position, rejecting incomplete batches.
fn collect_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> RagResult<Vec<Embedding>> {
    if data.len() != expected {
        return Err(RagError::ModelUnavailable(format!(
            "requested {expected} embeddings, received {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);
    if data.iter().enumerate().any(|(i, d)| d.index != i) {
        return Err(RagError::ModelUnavailable("embedding response indices are not contiguous".into()));
    }
    Ok(data.into_iter().map(|d| Array1::from(d.embedding)).collect())
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = self
            .flavor
            .url(&self.endpoint, &self.model, "embeddings", &self.api_version);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .flavor
            .authorize(self.http.post(&url), &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::ModelUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::ModelUnavailable(format!("embedding endpoint returned {status}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::ModelUnavailable(format!("malformed embedding response: {e}")))?;

        tracing::debug!(count = parsed.data.len(), model = %self.model, "received embeddings");
        collect_embeddings(parsed.data, texts.len())
    }
}
