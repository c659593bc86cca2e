use crate::assistant::{AnswerSettings, MissingSnapshotPolicy};
use crate::embedding::{DEFAULT_DIMENSION, Embedder, HashingEmbedder, RemoteEmbedder};
use crate::error::{RagError, RagResult};
use crate::llm::CompletionConfig;
use crate::retriever::DEFAULT_TOP_K;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub const CONFIG_FILE_NAME: &str = "fomc_rag";
pub const ENV_PREFIX: &str = "FOMC_RAG";
pub const API_KEY_VAR: &str = "FOMC_RAG_API_KEY";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// Local hashed bag-of-words embeddings; no network needed.
    #[default]
    Hashing,
    /// The `/embeddings` endpoint of the completion service.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub snapshot_dir: PathBuf,
    pub dimension: usize,
    pub top_k: usize,
    pub embedder: EmbedderKind,
    pub embedding_model: String,
    pub missing_snapshot: MissingSnapshotPolicy,
    pub include_context: bool,
    pub paragraph_max_chars: usize,
    pub completion: CompletionConfig,
}

fn default_snapshot_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fomc-rag")
        .join("snapshot")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            dimension: DEFAULT_DIMENSION,
            top_k: DEFAULT_TOP_K,
            embedder: EmbedderKind::default(),
            embedding_model: "text-embedding-3-small".to_string(),
            missing_snapshot: MissingSnapshotPolicy::default(),
            include_context: true,
            paragraph_max_chars: 1000,
            completion: CompletionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads `fomc_rag.{toml,json,yaml}` if present, then `FOMC_RAG_*` variables.
    ///
    /// Nested completion settings use a double underscore, e.g.
    /// `FOMC_RAG_COMPLETION__MODEL`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(ConfigFile::with_name(CONFIG_FILE_NAME).required(false))
    }

    pub fn load_from(file: ConfigFile<config::FileSourceFile, config::FileFormat>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::Message("dimension must be positive".into()));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Message("top_k must be positive".into()));
        }
        if self.paragraph_max_chars == 0 {
            return Err(ConfigError::Message("paragraph_max_chars must be positive".into()));
        }
        Ok(())
    }

    pub fn answer_settings(&self) -> AnswerSettings {
        AnswerSettings {
            top_k: self.top_k,
            model: self.completion.model.clone(),
            max_retries: self.completion.max_retries,
            retry_backoff: self.completion.retry_backoff(),
            missing_snapshot: self.missing_snapshot,
            include_context: self.include_context,
        }
    }

    /// Builds the configured embedder. The remote embedder needs an API key.
    pub fn build_embedder(&self, api_key: Option<&str>) -> RagResult<Arc<dyn Embedder>> {
        match self.embedder {
            EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(self.dimension))),
            EmbedderKind::Remote => {
                let key = api_key
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| RagError::ModelUnavailable(format!("remote embeddings need {API_KEY_VAR}")))?;
                let embedder = RemoteEmbedder::new(
                    self.completion.endpoint.clone(),
                    self.completion.api_version.clone(),
                    self.completion.flavor,
                    self.embedding_model.clone(),
                    key,
                    self.dimension,
                    self.completion.timeout(),
                )?;
                Ok(Arc::new(embedder))
            }
        }
    }

    pub fn print_config(&self) {
        print!("{self}");
    }
}

/// One `key=value` line per setting. The API key is not part of the configuration.
impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "snapshot_dir={}", self.snapshot_dir.display())?;
        writeln!(f, "dimension={}", self.dimension)?;
        writeln!(f, "top_k={}", self.top_k)?;
        writeln!(f, "embedder={:?}", self.embedder)?;
        writeln!(f, "embedding_model={}", self.embedding_model)?;
        writeln!(f, "missing_snapshot={:?}", self.missing_snapshot)?;
        writeln!(f, "include_context={}", self.include_context)?;
        writeln!(f, "paragraph_max_chars={}", self.paragraph_max_chars)?;
        writeln!(f, "completion.endpoint={}", self.completion.endpoint)?;
        writeln!(f, "completion.api_version={}", self.completion.api_version)?;
        writeln!(f, "completion.flavor={:?}", self.completion.flavor)?;
        writeln!(f, "completion.model={}", self.completion.model)?;
        writeln!(f, "completion.timeout_secs={}", self.completion.timeout_secs)?;
        writeln!(f, "completion.max_retries={}", self.completion.max_retries)?;
        writeln!(f, "completion.retry_backoff_ms={}", self.completion.retry_backoff_ms)
    }
}
