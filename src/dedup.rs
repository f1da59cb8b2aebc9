//! Near-duplicate frame suppression.
//!
//! Consecutive captures of a static scene embed almost identically; only the
//! last accepted vector is kept and each new frame is compared against it.

use edgesync_core::cosine_similarity;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DedupDecision {
    /// `similarity` is `None` for the first frame.
    Accept { similarity: Option<f32> },
    Drop { similarity: f32 },
}

impl DedupDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, DedupDecision::Accept { .. })
    }
}

pub struct DedupFilter {
    threshold: f32,
    last_accepted: Option<Vec<f32>>,
}

impl DedupFilter {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            last_accepted: None,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Accept iff similarity to the last accepted vector is strictly below the
    /// threshold. Accepted vectors become the new comparison point.
    pub fn check(&mut self, vector: &[f32]) -> DedupDecision {
        let similarity = match &self.last_accepted {
            Some(last) if last.len() == vector.len() => Some(cosine_similarity(last, vector)),
            _ => None,
        };
        match similarity {
            Some(s) if s >= self.threshold => DedupDecision::Drop { similarity: s },
            _ => {
                self.last_accepted = Some(vector.to_vec());
                DedupDecision::Accept { similarity }
            }
        }
    }

    /// Forget the last accepted vector (e.g. after a camera switch).
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit vector whose cosine with `[1, 0]` is exactly `cos`.
    fn at_cosine(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn first_frame_is_always_accepted() {
        let mut filter = DedupFilter::new(0.0);
        assert_eq!(
            filter.check(&[1.0, 0.0]),
            DedupDecision::Accept { similarity: None }
        );
    }

    #[test]
    fn drops_frame_above_threshold() {
        let mut filter = DedupFilter::new(0.98);
        assert!(filter.check(&[1.0, 0.0]).is_accept());
        match filter.check(&at_cosine(0.995)) {
            DedupDecision::Drop { similarity } => assert!((similarity - 0.995).abs() < 1e-4),
            other => panic!("expected drop, got {other:?}"),
        }
    }

    #[test]
    fn accepts_frame_below_threshold_and_moves_reference() {
        let mut filter = DedupFilter::new(0.98);
        filter.check(&[1.0, 0.0]);
        assert!(filter.check(&at_cosine(0.5)).is_accept());
        // compared against the newly accepted frame now, not the first one
        assert!(!filter.check(&at_cosine(0.5)).is_accept());
    }

    #[test]
    fn dropped_frames_do_not_move_reference() {
        let mut filter = DedupFilter::new(0.9);
        filter.check(&[1.0, 0.0]);
        // each step drifts ~0.95 from [1,0] but is measured against [1,0] only
        assert!(!filter.check(&at_cosine(0.95)).is_accept());
        assert!(!filter.check(&at_cosine(0.95)).is_accept());
        assert!(filter.check(&at_cosine(0.85)).is_accept());
    }

    #[test]
    fn similarity_equal_to_threshold_is_dropped() {
        let mut filter = DedupFilter::new(1.0);
        filter.check(&[0.0, 1.0]);
        assert!(!filter.check(&[0.0, 1.0]).is_accept());
    }

    #[test]
    fn reset_forgets_reference() {
        let mut filter = DedupFilter::new(0.5);
        filter.check(&[1.0, 0.0]);
        filter.reset();
        assert!(filter.check(&[1.0, 0.0]).is_accept());
    }
}
