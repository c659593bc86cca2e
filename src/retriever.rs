use crate::embedding::Embedder;
use crate::error::{RagError, RagResult};
use crate::snapshot::SnapshotDir;
use crate::vector_db::{Embedding, MetadataStore, VectorIndex};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_TOP_K: usize = 5;

/// A retrieved paragraph and its squared Euclidean distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedParagraph {
    pub text: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub entries: usize,
    pub dimension: usize,
}

/// Stores paragraphs into a persisted snapshot and answers nearest-paragraph queries.
///
/// Every call reads the snapshot from disk under the snapshot directory's file
/// lock, so any number of retrievers, in this process or others, can share one
/// directory. Stores are serialized; reads never see a partial commit.
pub struct Retriever {
    dir: SnapshotDir,
    embedder: Arc<dyn Embedder>,
}

/// Runs blocking snapshot I/O off the async worker threads.
async fn blocking<T, F>(f: F) -> RagResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RagResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RagError::Storage(io::Error::other(e)))?
}

/// Loads the committed snapshot, or an empty one of `dimension` before the first commit.
/// The flag is true when a snapshot already existed.
fn load_or_create(dir: &SnapshotDir, dimension: usize) -> RagResult<(VectorIndex, MetadataStore, bool)> {
    match dir.load() {
        Ok((index, metadata)) => Ok((index, metadata, true)),
        Err(RagError::SnapshotNotFound(_)) => Ok((VectorIndex::new(dimension), MetadataStore::new(), false)),
        Err(e) => Err(e),
    }
}

impl Retriever {
    /// Opens (creating if needed) a snapshot directory.
    pub fn open(dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> RagResult<Self> {
        Ok(Retriever {
            dir: SnapshotDir::open(dir)?,
            embedder,
        })
    }

    pub fn snapshot_dir(&self) -> &SnapshotDir {
        &self.dir
    }

    pub fn close(self) {
        tracing::debug!(dir = %self.dir.root().display(), "retriever closed");
    }

    async fn embed_checked(&self, texts: &[String]) -> RagResult<Vec<Embedding>> {
        let vectors = self.embedder.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(RagError::ModelUnavailable(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    /// Embeds `paragraphs` and appends them to the snapshot. Returns the number stored.
    pub async fn store(&self, paragraphs: Vec<String>) -> RagResult<usize> {
        if let Some(pos) = paragraphs.iter().position(|p| p.trim().is_empty()) {
            return Err(RagError::InvalidArgument(format!("paragraph {pos} is blank")));
        }

        let vectors = self.embed_checked(&paragraphs).await?;
        let dimension = self.embedder.dimension();
        let dir = self.dir.clone();

        let (stored, total) = blocking(move || {
            dir.write_locked(|dir| {
                let (mut index, mut metadata, existed) = load_or_create(dir, dimension)?;
                if index.dimension() != dimension {
                    return Err(RagError::DimensionMismatch {
                        expected: index.dimension(),
                        actual: dimension,
                    });
                }
                if paragraphs.is_empty() && existed {
                    return Ok((0, index.len()));
                }

                index.insert(&vectors)?;
                let stored = paragraphs.len();
                metadata.append(paragraphs);
                dir.commit(&index, &metadata)?;
                Ok((stored, index.len()))
            })
        })
        .await?;

        tracing::info!(stored, total, "stored paragraphs");
        Ok(stored)
    }

    async fn load(&self) -> RagResult<(VectorIndex, MetadataStore)> {
        let dir = self.dir.clone();
        blocking(move || dir.read_locked(|dir| dir.load())).await
    }

    /// Returns up to `top_k` stored paragraphs nearest to `query`, nearest first.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> RagResult<Vec<RetrievedParagraph>> {
        if top_k == 0 {
            return Err(RagError::InvalidArgument("top_k must be at least 1".into()));
        }
        if query.trim().is_empty() {
            return Err(RagError::InvalidArgument("query cannot be empty".into()));
        }

        let (index, metadata) = self.load().await?;

        let query_vector = self
            .embed_checked(&[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RagError::ModelUnavailable("no query embedding returned".into()))?;

        let neighbors = index.search(&query_vector, top_k)?;
        tracing::debug!(hits = neighbors.len(), entries = index.len(), "searched index");

        neighbors
            .into_iter()
            .map(|n| match metadata.get(n.id) {
                Ok(text) => Ok(RetrievedParagraph {
                    text: text.to_string(),
                    distance: n.distance,
                }),
                Err(e) => Err(RagError::SnapshotCorrupt(e.to_string())),
            })
            .collect()
    }

    /// Dashboard-facing name for [`Retriever::retrieve`].
    pub async fn query(&self, text: &str, top_k: usize) -> RagResult<Vec<RetrievedParagraph>> {
        self.retrieve(text, top_k).await
    }

    pub async fn stats(&self) -> RagResult<SnapshotStats> {
        let (index, _) = self.load().await?;
        Ok(SnapshotStats {
            entries: index.len(),
            dimension: index.dimension(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::snapshot::SnapshotPaths;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::tempdir;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed(&self, _texts: &[String]) -> RagResult<Vec<Embedding>> {
            Err(RagError::ModelUnavailable("offline".into()))
        }
    }

    fn hashing() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::default())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn current_paths(retriever: &Retriever) -> SnapshotPaths {
        retriever.snapshot_dir().current().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_store_then_query_returns_closest_paragraph() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        retriever
            .store(strings(&["The Fed raised rates.", "Inflation eased in Q2."]))
            .await
            .unwrap();

        let results = retriever.query("Did the Fed change rates?", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "The Fed raised rates.");
        assert!(results[0].distance >= 0.0);
    }

    #[tokio::test]
    async fn test_query_before_any_store_is_not_found() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        assert!(matches!(
            retriever.query("anything", 3).await,
            Err(RagError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_top_k_is_invalid() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        retriever.store(strings(&["The Fed raised rates."])).await.unwrap();
        assert!(matches!(
            retriever.retrieve("rates", 0).await,
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_snapshot_yields_no_results() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        assert_eq!(retriever.store(Vec::new()).await.unwrap(), 0);
        assert!(retriever.retrieve("rates", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_store_appends_and_stays_aligned() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        retriever.store(strings(&["one rate", "two rates"])).await.unwrap();
        retriever.store(strings(&["three inflation"])).await.unwrap();

        let (index, metadata) = retriever.snapshot_dir().load().unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.get(2).unwrap(), "three inflation");

        let all = retriever.retrieve("rates", 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let first = Retriever::open(dir.path(), hashing()).unwrap();
        first.store(strings(&["GDP growth was revised downward."])).await.unwrap();
        first.close();

        let second = Retriever::open(dir.path(), hashing()).unwrap();
        let results = second.retrieve("GDP growth", 5).await.unwrap();
        assert_eq!(results[0].text, "GDP growth was revised downward.");
        assert_eq!(second.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_forced_divergence_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        retriever.store(strings(&["a rate", "b rate"])).await.unwrap();

        let paths = current_paths(&retriever);
        let mut document: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.metadata).unwrap()).unwrap();
        document["paragraphs"].as_array_mut().unwrap().push("extra".into());
        fs::write(&paths.metadata, document.to_string()).unwrap();

        assert!(matches!(
            retriever.retrieve("rate", 1).await,
            Err(RagError::SnapshotCorrupt(_))
        ));
        assert!(matches!(
            retriever.store(strings(&["c rate"])).await,
            Err(RagError::SnapshotCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_orphaned_artifact_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        retriever.store(strings(&["a rate"])).await.unwrap();
        let paths = current_paths(&retriever);
        fs::remove_file(&paths.metadata).unwrap();

        assert!(matches!(
            retriever.store(strings(&["b rate"])).await,
            Err(RagError::SnapshotCorrupt(_))
        ));
        assert!(paths.index.exists());
        assert_eq!(current_paths(&retriever), paths);
    }

    #[tokio::test]
    async fn test_embedder_failure_leaves_snapshot_untouched() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), Arc::new(FailingEmbedder)).unwrap();
        assert!(matches!(
            retriever.store(strings(&["a"])).await,
            Err(RagError::ModelUnavailable(_))
        ));
        assert!(retriever.snapshot_dir().current().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dimension_change_is_rejected() {
        let dir = tempdir().unwrap();
        Retriever::open(dir.path(), hashing())
            .unwrap()
            .store(strings(&["The Fed raised rates."]))
            .await
            .unwrap();

        let smaller = Retriever::open(dir.path(), Arc::new(HashingEmbedder::new(8))).unwrap();
        assert!(matches!(
            smaller.retrieve("rates", 1).await,
            Err(RagError::DimensionMismatch { expected: 384, actual: 8 })
        ));
    }

    #[tokio::test]
    async fn test_blank_inputs_are_invalid() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        assert!(matches!(
            retriever.store(strings(&["ok", "   "])).await,
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            retriever.retrieve("  ", 1).await,
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_stores_do_not_lose_updates() {
        let dir = tempdir().unwrap();
        let retriever = Arc::new(Retriever::open(dir.path(), hashing()).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let retriever = Arc::clone(&retriever);
            handles.push(tokio::spawn(async move {
                retriever.store(vec![format!("paragraph number {i}")]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(retriever.stats().await.unwrap().entries, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_retrievers_on_one_directory_do_not_lose_updates() {
        let dir = tempdir().unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let path = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                let retriever = Retriever::open(path, hashing()).unwrap();
                retriever.store(vec![format!("paragraph number {i}")]).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }

        let reader = Retriever::open(dir.path(), hashing()).unwrap();
        assert_eq!(reader.stats().await.unwrap().entries, 8);
        assert_eq!(reader.retrieve("paragraph number", 10).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_empty_store_checks_dimension_and_keeps_snapshot() {
        let dir = tempdir().unwrap();
        let retriever = Retriever::open(dir.path(), hashing()).unwrap();
        retriever.store(strings(&["The Fed raised rates."])).await.unwrap();
        let before = current_paths(&retriever);

        assert_eq!(retriever.store(Vec::new()).await.unwrap(), 0);
        assert_eq!(current_paths(&retriever), before);

        let smaller = Retriever::open(dir.path(), Arc::new(HashingEmbedder::new(8))).unwrap();
        assert!(matches!(
            smaller.store(Vec::new()).await,
            Err(RagError::DimensionMismatch { expected: 384, actual: 8 })
        ));
        assert_eq!(current_paths(&retriever), before);
    }
}
