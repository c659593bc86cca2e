//! Retrieval-augmented question answering over FOMC meeting documents.
//!
//! Paragraphs are embedded and appended to an on-disk [`vector_db::VectorIndex`]
//! snapshot; questions are answered by retrieving the nearest paragraphs and
//! passing them to a chat-completion model as context.

pub mod assistant;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fomc;
pub mod llm;
pub mod retriever;
pub mod snapshot;
pub mod utils;
pub mod vector_db;

pub use assistant::{AnswerSettings, Assistant, MissingSnapshotPolicy};
pub use config::AppConfig;
pub use embedding::{Embedder, HashingEmbedder, RemoteEmbedder};
pub use error::{AnswerError, FailureKind, RagError, RagResult, Stage};
pub use llm::{CompletionBackend, CompletionClient};
pub use retriever::{RetrievedParagraph, Retriever};
