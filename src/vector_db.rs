use crate::error::{RagError, RagResult};
use ndarray::{Array1, Array2, ArrayView1};

pub type Embedding = Array1<f32>;

/// A single search hit: the entry's identifier and its squared Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: usize,
    pub distance: f32,
}

/// Exact nearest-neighbor index over fixed-dimension vectors.
///
/// Entries are append-only; the row number of a vector is its identifier.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Array2<f32>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        VectorIndex {
            dimension,
            vectors: Array2::zeros((0, dimension)),
        }
    }

    /// Rebuilds an index from row-major vector data.
    pub(crate) fn from_raw(dimension: usize, data: Vec<f32>) -> RagResult<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(RagError::SnapshotCorrupt(format!(
                "{} values cannot form rows of dimension {}",
                data.len(),
                dimension
            )));
        }
        let rows = data.len() / dimension;
        let vectors = Array2::from_shape_vec((rows, dimension), data)
            .map_err(|e| RagError::SnapshotCorrupt(e.to_string()))?;
        Ok(VectorIndex { dimension, vectors })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = ArrayView1<'_, f32>> {
        self.vectors.outer_iter()
    }

    fn check_dimension(&self, actual: usize) -> RagResult<()> {
        if actual != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }

    /// Appends every vector, or none of them if any has the wrong length.
    pub fn insert(&mut self, vectors: &[Embedding]) -> RagResult<()> {
        for vector in vectors {
            self.check_dimension(vector.len())?;
        }
        for vector in vectors {
            self.vectors
                .push_row(vector.view())
                .map_err(|e| RagError::InvalidArgument(e.to_string()))?;
        }
        Ok(())
    }

    /// Returns the `k` nearest entries, nearest first. Equal distances keep insertion order.
    pub fn search(&self, query: &Embedding, k: usize) -> RagResult<Vec<Neighbor>> {
        self.check_dimension(query.len())?;

        let mut neighbors: Vec<Neighbor> = self
            .vectors
            .outer_iter()
            .enumerate()
            .map(|(id, row)| {
                let diff = &row - query;
                Neighbor {
                    id,
                    distance: diff.dot(&diff),
                }
            })
            .collect();

        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        neighbors.truncate(k);
        Ok(neighbors)
    }
}

/// Paragraph texts, positionally aligned with the entries of a [`VectorIndex`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataStore {
    paragraphs: Vec<String>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_paragraphs(paragraphs: Vec<String>) -> Self {
        MetadataStore { paragraphs }
    }

    pub fn append(&mut self, paragraphs: impl IntoIterator<Item = String>) {
        self.paragraphs.extend(paragraphs);
    }

    pub fn get(&self, id: usize) -> RagResult<&str> {
        self.paragraphs
            .get(id)
            .map(String::as_str)
            .ok_or(RagError::IdentifierOutOfRange {
                id,
                len: self.paragraphs.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    pub(crate) fn paragraphs(&self) -> &[String] {
        &self.paragraphs
    }
}
