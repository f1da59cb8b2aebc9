//! Maximal Marginal Relevance (MMR) re-ranking.
//!
//! Each round picks the candidate maximising
//! `lambda * relevance - (1 - lambda) * max_sim_to_selected`:
//! - `lambda = 1.0` is pure relevance order.
//! - `lambda = 0.0` maximises diversity among selected results.
//!
//! Relevance is taken as given (the merged, authoritative score) rather than
//! recomputed, and candidate vectors are expected to be unit length so the
//! pairwise similarity is a plain dot product.

use std::cmp::Ordering;

use crate::simd::dot_product;

/// One re-ranking input.
#[derive(Debug, Clone, Copy)]
pub struct MmrCandidate<'a> {
    pub relevance: f32,
    pub vector: &'a [f32],
    /// Unix milliseconds; newer wins ties.
    pub captured_at: u64,
}

/// Re-ranks candidates using Maximal Marginal Relevance.
#[derive(Debug, Clone, Copy)]
pub struct MmrReranker {
    lambda: f32,
}

impl MmrReranker {
    /// `lambda` is clamped to `[0, 1]`.
    pub fn new(lambda: f32) -> Self {
        let lambda = if lambda.is_nan() { 1.0 } else { lambda.clamp(0.0, 1.0) };
        Self { lambda }
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// Select up to `k` candidates, returning `(index, mmr_score)` in pick order.
    ///
    /// Equal MMR scores go to the most recent `captured_at`, then to the lower
    /// index, so callers that pre-sort candidates get deterministic output.
    pub fn select(&self, candidates: &[MmrCandidate<'_>], k: usize) -> Vec<(usize, f32)> {
        let n = candidates.len().min(k);
        let mut picked = vec![false; candidates.len()];
        // running max similarity of each candidate to anything already selected
        let mut max_sim = vec![f32::NEG_INFINITY; candidates.len()];
        let mut out = Vec::with_capacity(n);

        for _ in 0..n {
            let mut best: Option<(usize, f32)> = None;
            for (i, c) in candidates.iter().enumerate() {
                if picked[i] {
                    continue;
                }
                let penalty = if out.is_empty() { 0.0 } else { max_sim[i] };
                let score = self.lambda * c.relevance - (1.0 - self.lambda) * penalty;
                best = match best {
                    None => Some((i, score)),
                    Some((j, best_score)) => match score.partial_cmp(&best_score) {
                        Some(Ordering::Greater) => Some((i, score)),
                        Some(Ordering::Equal) if c.captured_at > candidates[j].captured_at => {
                            Some((i, score))
                        }
                        _ => Some((j, best_score)),
                    },
                };
            }

            let Some((chosen, score)) = best else { break };
            picked[chosen] = true;
            out.push((chosen, score));

            let chosen_vec = candidates[chosen].vector;
            for (i, c) in candidates.iter().enumerate() {
                if !picked[i] {
                    max_sim[i] = max_sim[i].max(dot_product(c.vector, chosen_vec));
                }
            }
        }

        out
    }
}

impl Default for MmrReranker {
    fn default() -> Self {
        Self::new(0.8)
    }
}
