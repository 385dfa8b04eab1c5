//! facereg-core — Face encoding store and recognition engine.
//!
//! Photos are decoded to RGB, faces found with SCRFD and embedded with
//! ArcFace (ONNX Runtime), embeddings persisted as blob files behind a
//! SQLite index, and query faces matched by gated nearest neighbour.

pub mod alignment;
pub mod decode;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use decode::DecodeError;
pub use matcher::{Matcher, MatchResult, NearestNeighborMatcher, DEFAULT_TOLERANCE, UNKNOWN_LABEL};
pub use pipeline::{FacePipeline, OnnxPipeline, PipelineError};
pub use recognizer::{Recognizer, RecognizerConfig, RecognizerError};
pub use store::{EncodingStore, StoreError};
pub use types::{BoundingBox, Embedding, EmbeddingRef, KnownFaceSet, PersonRecord, Staleness};
