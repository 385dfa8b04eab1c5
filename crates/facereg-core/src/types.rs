use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector produced by the embedding primitive.
///
/// Immutable once stored; the store persists `values` bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Opaque reference to one stored embedding blob.
///
/// Uniquely and permanently identifies a blob inside the store's directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingRef(String);

impl EmbeddingRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmbeddingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of the durable index. Names are not unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub name: String,
    pub embedding_ref: EmbeddingRef,
}

/// In-memory set of known faces, rebuilt wholesale from the store.
///
/// `names[i]` labels `embeddings[i]`; the two sequences never diverge in length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownFaceSet {
    names: Vec<String>,
    embeddings: Vec<Embedding>,
}

impl KnownFaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, embedding: Embedding) {
        self.names.push(name.into());
        self.embeddings.push(embedding);
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Embedding)> for KnownFaceSet {
    fn from_iter<I: IntoIterator<Item = (S, Embedding)>>(iter: I) -> Self {
        let mut set = KnownFaceSet::new();
        for (name, embedding) in iter {
            set.push(name, embedding);
        }
        set
    }
}

/// Whether the cached [`KnownFaceSet`] reflects every durable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Staleness {
    Fresh,
    Stale,
}
