use crate::error::{RagError, RagResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://hkust.azure-api.net";
pub const DEFAULT_API_VERSION: &str = "2024-06-01";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const ANSWER_DIRECTIVE: &str = "Answer the question using the context provided.";

/// Wire dialect of the chat/embedding service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    /// Deployment-scoped URLs with an `api-key` header.
    #[default]
    Azure,
    /// `/v1`-style URLs with bearer authentication.
    #[serde(rename = "openai")]
    OpenAi,
}

impl ApiFlavor {
    pub fn url(&self, endpoint: &str, model: &str, operation: &str, api_version: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        match self {
            ApiFlavor::Azure => format!(
                "{endpoint}/openai/deployments/{model}/{operation}?api-version={api_version}"
            ),
            ApiFlavor::OpenAi => format!("{endpoint}/{operation}"),
        }
    }

    pub fn authorize(&self, request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        match self {
            ApiFlavor::Azure => request.header("api-key", api_key),
            ApiFlavor::OpenAi => request.bearer_auth(api_key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_version: String,
    pub flavor: ApiFlavor,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            flavor: ApiFlavor::default(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: 60,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Builds the user prompt from retrieved context, the instruction and the question.
///
/// An empty `context` still produces the Context block, just with nothing in it.
pub fn compose(question: &str, context: &[String], instruction: &str) -> String {
    let context = context.join("\n");
    format!(
        "{instruction}\n\nContext:\n{context}\n\nQuestion:\n{question}\n\n{ANSWER_DIRECTIVE}"
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// A language-model completion capability.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        instruction: &str,
        model: &str,
        temperature: f32,
    ) -> RagResult<Completion>;
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub fn validate_temperature(temperature: f32) -> RagResult<()> {
    if !(0.0..=2.0).contains(&temperature) {
        return Err(RagError::InvalidArgument(format!(
            "temperature must be within [0.0, 2.0], got {temperature}"
        )));
    }
    Ok(())
}

fn chat_request<'a>(prompt: &'a str, instruction: &'a str, model: &'a str, temperature: f32) -> ChatRequest<'a> {
    ChatRequest {
        model,
        temperature,
        messages: vec![
            ChatMessage {
                role: "system",
                content: instruction,
            },
            ChatMessage {
                role: "user",
                content: prompt,
            },
        ],
    }
}

fn into_completion(response: ChatResponse) -> RagResult<Completion> {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| RagError::CompletionUnavailable("response carried no content".into()))?;
    Ok(Completion {
        text,
        usage: response.usage,
    })
}

/// HTTP client for a chat-completions endpoint.
pub struct CompletionClient {
    http: reqwest::Client,
    config: CompletionConfig,
    api_key: String,
}

impl CompletionClient {
    pub fn new(config: CompletionConfig, api_key: impl Into<String>) -> RagResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(RagError::InvalidArgument("API key cannot be empty".into()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RagError::CompletionUnavailable(format!("could not build HTTP client: {e}")))?;

        Ok(CompletionClient { http, config, api_key })
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete(
        &self,
        prompt: &str,
        instruction: &str,
        model: &str,
        temperature: f32,
    ) -> RagResult<Completion> {
        validate_temperature(temperature)?;

        let url = self.config.flavor.url(
            &self.config.endpoint,
            model,
            "chat/completions",
            &self.config.api_version,
        );
        let body = chat_request(prompt, instruction, model, temperature);

        let response = self
            .config
            .flavor
            .authorize(self.http.post(&url), &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::CompletionUnavailable(format!("request timed out after {}s", self.config.timeout_secs))
                } else {
                    RagError::CompletionUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RagError::CompletionUnavailable(format!("authentication rejected ({status})")));
        }
        if !status.is_success() {
            return Err(RagError::CompletionUnavailable(format!("completion endpoint returned {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::CompletionUnavailable(format!("malformed completion response: {e}")))?;
        into_completion(parsed)
    }
}
