//! Face registry: ingestion into the encoding store and recognition against
//! an in-memory cache of known faces.
//!
//! The cache is rebuilt wholesale off to the side and swapped in under a
//! short write lock. Detection and embedding never run under that lock.

use crate::decode::{decode_rgb, DecodeError};
use crate::matcher::{Matcher, NearestNeighborMatcher, DEFAULT_TOLERANCE};
use crate::pipeline::{FacePipeline, PipelineError};
use crate::store::{EncodingStore, StoreError};
use crate::types::{KnownFaceSet, Staleness};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("face pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("no known people in the registry")]
    NoKnownFaces,
}

/// Tunables for matching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognizerConfig {
    /// Maximum Euclidean distance for a nearest neighbour to be accepted.
    pub tolerance: f32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Cached face set and the flag describing it, always updated together.
struct CacheState {
    known: Arc<KnownFaceSet>,
    staleness: Staleness,
    /// Bumped by every successful ingest.
    generation: u64,
    /// Generation the current `known` set was built at; `None` before the first build.
    built: Option<u64>,
}

/// The registry callers talk to.
pub struct Recognizer<P> {
    store: EncodingStore,
    pipeline: P,
    config: RecognizerConfig,
    cache: RwLock<CacheState>,
}

impl<P: FacePipeline> Recognizer<P> {
    /// Wrap an opened store. The cache starts `Stale`, so the first
    /// [`refresh_if_stale`](Self::refresh_if_stale) loads existing records.
    pub fn new(store: EncodingStore, pipeline: P, config: RecognizerConfig) -> Self {
        Self {
            store,
            pipeline,
            config,
            cache: RwLock::new(CacheState {
                known: Arc::new(KnownFaceSet::new()),
                staleness: Staleness::Stale,
                generation: 0,
                built: None,
            }),
        }
    }

    pub fn store(&self) -> &EncodingStore {
        &self.store
    }

    /// Register `name` from a photo.
    ///
    /// Returns `Ok(false)` without touching the store unless the photo shows
    /// exactly one face.
    pub fn ingest(&self, name: &str, raw_image: &[u8]) -> Result<bool, RecognizerError> {
        let image = decode_rgb(raw_image)?;
        let faces = self.pipeline.detect_faces(&image)?;
        if faces.len() != 1 {
            tracing::info!(name, faces = faces.len(), "ingest rejected: need exactly one face");
            return Ok(false);
        }

        let embedding = self.pipeline.embed(&image, &faces[0])?;
        self.store.append(name, &embedding)?;

        let mut cache = self.write_cache();
        cache.staleness = Staleness::Stale;
        cache.generation += 1;
        tracing::debug!(generation = cache.generation, "known faces marked stale");
        Ok(true)
    }

    /// Rebuild the known-face cache if an ingest happened since the last build.
    ///
    /// On failure the previous cache and the `Stale` flag are left in place,
    /// so the call can simply be repeated.
    pub fn refresh_if_stale(&self) -> Result<(), RecognizerError> {
        let generation = {
            let cache = self.read_cache();
            if cache.staleness == Staleness::Fresh {
                return Ok(());
            }
            cache.generation
        };

        let known = self.load_known_faces()?;
        self.install(generation, known);
        Ok(())
    }

    /// Swap in a set built from the index as of `generation`.
    ///
    /// A set older than the installed one is dropped. The cache becomes
    /// `Fresh` only if no ingest happened since `generation` was read.
    fn install(&self, generation: u64, known: KnownFaceSet) {
        let mut cache = self.write_cache();
        if cache.built.is_some_and(|built| built > generation) {
            tracing::debug!(generation, "discarding rebuild older than the cached set");
            return;
        }
        cache.known = Arc::new(known);
        cache.built = Some(generation);
        if cache.generation == generation {
            cache.staleness = Staleness::Fresh;
        } else {
            tracing::debug!(
                generation,
                current = cache.generation,
                "ingest landed during rebuild; cache stays stale"
            );
        }
        tracing::info!(known = cache.known.len(), "known faces rebuilt");
    }

    /// Name every face in the photo against the cached known faces.
    ///
    /// Does not refresh the cache. One label per detected face, in detection
    /// order; faces without an accepted match are labelled `"Unknown"`.
    pub fn query(&self, raw_image: &[u8]) -> Result<Vec<String>, RecognizerError> {
        let known = self.known_faces();
        if known.is_empty() {
            return Err(RecognizerError::NoKnownFaces);
        }

        let image = decode_rgb(raw_image)?;
        let faces = self.pipeline.detect_faces(&image)?;

        let matcher = NearestNeighborMatcher;
        faces
            .iter()
            .map(|face| {
                let embedding = self.pipeline.embed(&image, face)?;
                let result = matcher.compare(&embedding, &known, self.config.tolerance);
                if !result.matched {
                    if let Some(idx) = result.best_index {
                        tracing::debug!(
                            nearest = %known.names()[idx],
                            distance = result.distance,
                            "nearest neighbour beyond tolerance"
                        );
                    }
                }
                Ok(result.label().to_string())
            })
            .collect()
    }

    /// Names in the cache, in insertion order. Does not refresh.
    pub fn list_known_names(&self) -> Vec<String> {
        self.read_cache().known.names().to_vec()
    }

    /// Snapshot of the cached set.
    pub fn known_faces(&self) -> Arc<KnownFaceSet> {
        Arc::clone(&self.read_cache().known)
    }

    pub fn staleness(&self) -> Staleness {
        self.read_cache().staleness
    }

    /// Replay the durable index. Any unreadable blob aborts the whole load.
    fn load_known_faces(&self) -> Result<KnownFaceSet, StoreError> {
        let records = self.store.list_all()?;
        let mut known = KnownFaceSet::new();
        for record in records {
            let embedding = self.store.read(&record.embedding_ref)?;
            known.push(record.name, embedding);
        }
        Ok(known)
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, CacheState> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}
