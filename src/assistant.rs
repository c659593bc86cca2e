use crate::error::{AnswerError, RagError, Stage};
use crate::llm::{self, CompletionBackend, DEFAULT_MODEL};
use crate::retriever::{DEFAULT_TOP_K, Retriever};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_INSTRUCTION: &str = "You are an assistant providing insights on FOMC meetings.";
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// What `answer` does when nothing has ever been stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSnapshotPolicy {
    /// Report "no data indexed yet" to the caller.
    #[default]
    Fail,
    /// Ask the model anyway, with an empty Context block.
    EmptyContext,
}

#[derive(Debug, Clone)]
pub struct AnswerSettings {
    pub top_k: usize,
    pub model: String,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub missing_snapshot: MissingSnapshotPolicy,
    pub include_context: bool,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            model: DEFAULT_MODEL.to_string(),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            missing_snapshot: MissingSnapshotPolicy::default(),
            include_context: true,
        }
    }
}

/// Answers questions by retrieving context, composing a prompt and asking the model.
pub struct Assistant {
    retriever: Arc<Retriever>,
    backend: Arc<dyn CompletionBackend>,
    settings: AnswerSettings,
}

impl Assistant {
    pub fn new(retriever: Arc<Retriever>, backend: Arc<dyn CompletionBackend>, settings: AnswerSettings) -> Self {
        Assistant {
            retriever,
            backend,
            settings,
        }
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    pub fn settings(&self) -> &AnswerSettings {
        &self.settings
    }

    async fn context_for(&self, question: &str) -> Result<Vec<String>, AnswerError> {
        if !self.settings.include_context {
            return Ok(Vec::new());
        }

        match self.retriever.retrieve(question, self.settings.top_k).await {
            Ok(results) => {
                if results.is_empty() {
                    tracing::warn!("index is empty, answering without context");
                }
                Ok(results.into_iter().map(|r| r.text).collect())
            }
            Err(RagError::SnapshotNotFound(path))
                if self.settings.missing_snapshot == MissingSnapshotPolicy::EmptyContext =>
            {
                tracing::warn!(path = %path.display(), "no snapshot yet, answering without context");
                Ok(Vec::new())
            }
            Err(e) => Err(AnswerError::new(Stage::Retrieval, e)),
        }
    }

    pub async fn answer(&self, question: &str, instruction: &str, temperature: f32) -> Result<String, AnswerError> {
        if question.trim().is_empty() {
            return Err(AnswerError::new(
                Stage::Request,
                RagError::InvalidArgument("question cannot be empty".into()),
            ));
        }
        llm::validate_temperature(temperature).map_err(|e| AnswerError::new(Stage::Request, e))?;

        let context = self.context_for(question).await?;
        let prompt = llm::compose(question, &context, instruction);
        tracing::debug!(context_paragraphs = context.len(), "composed prompt");

        let mut attempt = 0;
        loop {
            match self
                .backend
                .complete(&prompt, instruction, &self.settings.model, temperature)
                .await
            {
                Ok(completion) => {
                    if let Some(usage) = completion.usage {
                        tracing::info!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            total_tokens = usage.total_tokens,
                            "token usage"
                        );
                    }
                    return Ok(completion.text);
                }
                Err(RagError::CompletionUnavailable(reason)) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, %reason, "completion failed, retrying");
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                Err(e) => return Err(AnswerError::new(Stage::Completion, e)),
            }
        }
    }
}
