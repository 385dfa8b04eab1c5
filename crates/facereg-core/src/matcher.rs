//! Nearest-neighbour matching of a probe embedding against the known faces.

use crate::types::{Embedding, KnownFaceSet};

/// Label given to a face with no acceptable match.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Default maximum embedding-space distance for two faces to be the same person.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Outcome of matching one probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest known embedding (`+inf` if none).
    pub distance: f32,
    /// Position of the nearest known embedding in the set.
    pub best_index: Option<usize>,
    /// Name at `best_index`, only when `matched`.
    pub name: Option<String>,
}

impl MatchResult {
    /// The name to report for this face.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for comparing a probe embedding against the known faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, known: &KnownFaceSet, tolerance: f32) -> MatchResult;
}

/// Global nearest neighbour, gated by a tolerance.
///
/// The nearest known embedding is always selected first; the tolerance can
/// only veto it, never pick a different candidate. Ties go to the earliest
/// index.
pub struct NearestNeighborMatcher;

impl NearestNeighborMatcher {
    /// Distance from `probe` to every known embedding, in set order.
    pub fn distances(probe: &Embedding, known: &KnownFaceSet) -> Vec<f32> {
        known
            .embeddings()
            .iter()
            .map(|k| probe.euclidean_distance(k))
            .collect()
    }
}

impl Matcher for NearestNeighborMatcher {
    fn compare(&self, probe: &Embedding, known: &KnownFaceSet, tolerance: f32) -> MatchResult {
        let distances = Self::distances(probe, known);

        // `min_by` keeps the first of equal elements; `total_cmp` puts NaN last.
        let best = distances
            .iter()
            .copied()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.total_cmp(b));

        match best {
            Some((idx, distance)) if distance <= tolerance => MatchResult {
                matched: true,
                distance,
                best_index: Some(idx),
                name: Some(known.names()[idx].clone()),
            },
            Some((idx, distance)) => MatchResult {
                matched: false,
                distance,
                best_index: Some(idx),
                name: None,
            },
            None => MatchResult {
                matched: false,
                distance: f32::INFINITY,
                best_index: None,
                name: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(entries: &[(&str, &[f32])]) -> KnownFaceSet {
        entries
            .iter()
            .map(|(name, values)| (*name, Embedding::new(values.to_vec())))
            .collect()
    }

    #[test]
    fn test_match_within_tolerance() {
        let set = known(&[("alice", &[0.0, 0.0])]);
        let probe = Embedding::new(vec![0.3, 0.4]); // distance 0.5

        let result = NearestNeighborMatcher.compare(&probe, &set, DEFAULT_TOLERANCE);
        assert!(result.matched);
        assert_eq!(result.label(), "alice");
        assert!((result.distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_beyond_tolerance_is_unknown() {
        let set = known(&[("alice", &[0.0, 0.0])]);
        let probe = Embedding::new(vec![0.6, 0.8]); // distance 1.0

        let result = NearestNeighborMatcher.compare(&probe, &set, DEFAULT_TOLERANCE);
        assert!(!result.matched);
        assert_eq!(result.best_index, Some(0));
        assert_eq!(result.label(), UNKNOWN_LABEL);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let set = known(&[("alice", &[0.0])]);
        let probe = Embedding::new(vec![0.5]);
        assert!(NearestNeighborMatcher.compare(&probe, &set, 0.5).matched);
    }

    #[test]
    fn test_nearest_wins_over_first_candidate() {
        // Both are under tolerance; the second is nearer and must win.
        let set = known(&[("far", &[0.5]), ("near", &[0.1])]);
        let probe = Embedding::new(vec![0.0]);

        let result = NearestNeighborMatcher.compare(&probe, &set, DEFAULT_TOLERANCE);
        assert_eq!(result.label(), "near");
        assert_eq!(result.best_index, Some(1));
    }

    #[test]
    fn test_tie_goes_to_earliest_index() {
        let set = known(&[("first", &[1.0]), ("second", &[-1.0]), ("third", &[1.0])]);
        let probe = Embedding::new(vec![0.0]);

        let result = NearestNeighborMatcher.compare(&probe, &set, 2.0);
        assert_eq!(result.best_index, Some(0));
        assert_eq!(result.label(), "first");
    }

    #[test]
    fn test_nan_distance_never_selected() {
        let set = known(&[("broken", &[f32::NAN]), ("ok", &[0.2])]);
        let probe = Embedding::new(vec![0.0]);

        let result = NearestNeighborMatcher.compare(&probe, &set, DEFAULT_TOLERANCE);
        assert_eq!(result.label(), "ok");
    }

    #[test]
    fn test_dimension_mismatch_is_unknown() {
        let set = known(&[("alice", &[0.0, 0.0, 0.0])]);
        let probe = Embedding::new(vec![0.0, 0.0]);

        let result = NearestNeighborMatcher.compare(&probe, &set, DEFAULT_TOLERANCE);
        assert!(!result.matched);
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_empty_set() {
        let result =
            NearestNeighborMatcher.compare(&Embedding::new(vec![1.0]), &KnownFaceSet::new(), 0.6);
        assert!(!result.matched);
        assert_eq!(result.best_index, None);
        assert_eq!(result.label(), UNKNOWN_LABEL);
    }
}
