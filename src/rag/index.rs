//! On-disk vector index and brute-force similarity search.
//!
//! The artifact is a directory holding `index.json`:
//!
//! ```text
//! {"dimension": n, "entries": [{"content": "...", "metadata": {...}, "embedding": [f32; n]}]}
//! ```
//!
//! Embeddings are L2-normalised once at load time, so a search is a single
//! matrix-vector product followed by a stable sort.

use std::path::Path;

use ndarray::{Array1, Array2};
use serde::Deserialize;

use super::Passage;
use crate::error::IndexError;

/// File name of the index artifact inside the index directory.
pub const INDEX_FILE: &str = "index.json";

/// Default index directory.
pub const DEFAULT_INDEX_DIR: &str = "./data/faiss_index";

#[derive(Debug, Deserialize)]
struct IndexFile {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    content: String,
    #[serde(default)]
    metadata: serde_json::Value,
    embedding: Vec<f32>,
}

/// A passage returned by a search, with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// In-memory vector index loaded from disk.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    passages: Vec<Passage>,
    /// One unit-length row per passage.
    vectors: Array2<f32>,
}

impl VectorIndex {
    /// Loads `<dir>/index.json`.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::NotFound` when the file does not exist and
    /// `IndexError::DimensionMismatch` when an entry's vector length differs
    /// from the declared dimension.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = dir.as_ref().join(INDEX_FILE);
        if !path.is_file() {
            return Err(IndexError::NotFound(path));
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| IndexError::Read {
            path: path.clone(),
            source,
        })?;
        let file: IndexFile = serde_json::from_str(&raw).map_err(|source| IndexError::Parse {
            path: path.clone(),
            source,
        })?;

        Self::from_entries(file)
    }

    fn from_entries(file: IndexFile) -> Result<Self, IndexError> {
        let dimension = file.dimension;
        let mut vectors = Array2::<f32>::zeros((file.entries.len(), dimension));
        let mut passages = Vec::with_capacity(file.entries.len());

        for (row, entry) in file.entries.into_iter().enumerate() {
            if entry.embedding.len() != dimension {
                return Err(IndexError::DimensionMismatch {
                    index: row,
                    expected: dimension,
                    actual: entry.embedding.len(),
                });
            }
            let mut vector = Array1::from(entry.embedding);
            normalize(&mut vector);
            vectors.row_mut(row).assign(&vector);
            passages.push(Passage::new(entry.content, entry.metadata));
        }

        Ok(Self {
            dimension,
            passages,
            vectors,
        })
    }

    /// Builds an index directly from passages and raw vectors.
    pub fn from_passages(
        dimension: usize,
        items: Vec<(Passage, Vec<f32>)>,
    ) -> Result<Self, IndexError> {
        let file = IndexFile {
            dimension,
            entries: items
                .into_iter()
                .map(|(p, embedding)| IndexEntry {
                    content: p.content,
                    metadata: p.metadata,
                    embedding,
                })
                .collect(),
        };
        Self::from_entries(file)
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed passages.
    pub fn len(&self) -> usize {
        self.passages.len()
    }

    /// Whether the index holds no passages.
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Returns the `k` passages most similar to `query`, best first.
    ///
    /// Equal scores keep index order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredPassage>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::QueryDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.passages.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = Array1::from(query.to_vec());
        normalize(&mut query);
        let scores = self.vectors.dot(&query);

        let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredPassage {
                passage: self.passages[i].clone(),
                score,
            })
            .collect())
    }
}

/// Normalizes a vector to unit length (L2 norm). Zero vectors stay zero.
fn normalize(v: &mut Array1<f32>) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.mapv_inplace(|x| x / norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_index(dir: &Path, value: serde_json::Value) {
        std::fs::write(dir.join(INDEX_FILE), value.to_string()).unwrap();
    }

    fn sample_index() -> VectorIndex {
        VectorIndex::from_passages(
            2,
            vec![
                (Passage::new("east", json!({"n": 0})), vec![1.0, 0.0]),
                (Passage::new("north", json!({"n": 1})), vec![0.0, 3.0]),
                (Passage::new("north-east", json!({"n": 2})), vec![1.0, 1.0]),
                (Passage::new("east again", json!({"n": 3})), vec![5.0, 0.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_load_from_directory() {
        let dir = TempDir::new().unwrap();
        write_index(
            dir.path(),
            json!({
                "dimension": 3,
                "entries": [
                    {"content": "Refunds are accepted within 30 days.", "metadata": {"source": "policy.md"}, "embedding": [1.0, 0.0, 0.0]},
                    {"content": "Shipping takes 5 days.", "embedding": [0.0, 1.0, 0.0]}
                ]
            }),
        );

        let index = VectorIndex::load(dir.path()).unwrap();
        assert_eq!(index.dimension(), 3);
        assert_eq!(index.len(), 2);

        let hits = index.search(&[0.9, 0.1, 0.0], 1).unwrap();
        assert_eq!(hits[0].passage.content, "Refunds are accepted within 30 days.");
        assert_eq!(hits[0].passage.metadata["source"], "policy.md");
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = VectorIndex::load(dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::NotFound(p) if p.ends_with(INDEX_FILE)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        write_index(
            dir.path(),
            json!({"dimension": 2, "entries": [{"content": "x", "embedding": [1.0, 2.0, 3.0]}]}),
        );

        let err = VectorIndex::load(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn test_malformed_artifact_is_parse_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "{not json").unwrap();
        assert!(matches!(
            VectorIndex::load(dir.path()).unwrap_err(),
            IndexError::Parse { .. }
        ));
    }

    #[test]
    fn test_search_ranks_by_cosine_and_keeps_ties_in_order() {
        let index = sample_index();
        let hits = index.search(&[2.0, 0.0], 3).unwrap();

        let contents: Vec<&str> = hits.iter().map(|h| h.passage.content.as_str()).collect();
        assert_eq!(contents, vec!["east", "east again", "north-east"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[2].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_search_truncates_to_available() {
        let index = sample_index();
        assert_eq!(index.search(&[0.0, 1.0], 10).unwrap().len(), 4);
        assert!(index.search(&[0.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_query_dimension_checked() {
        let err = sample_index().search(&[1.0, 0.0, 0.0], 2).unwrap_err();
        assert!(matches!(
            err,
            IndexError::QueryDimension { expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index = VectorIndex::from_passages(4, Vec::new()).unwrap();
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 4).unwrap().is_empty());
    }
}
