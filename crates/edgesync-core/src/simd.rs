//! Similarity kernels
//!
//! Every vector that enters a store is L2-normalized first, so the hot path only
//! ever needs a dot product:
//! ```text
//! cos(θ) = A · B  when ||A|| = ||B|| = 1
//! ```
//!
//! | Platform     | ISA      | Width           | Intrinsics                              |
//! |--------------|----------|-----------------|-----------------------------------------|
//! | aarch64      | NEON     | 128-bit (4×f32) | `vld1q_f32`, `vfmaq_f32`, `vaddvq_f32`  |
//! | x86_64+AVX2  | AVX2+FMA | 256-bit (8×f32) | `_mm256_loadu_ps`, `_mm256_fmadd_ps`    |
//! | other        | scalar   | 1×f32           | auto-vectorized iterator                |

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let lanes = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    let (pa, pb) = (a.as_ptr(), b.as_ptr());

    for i in 0..lanes {
        let va = vld1q_f32(pa.add(i * 4));
        let vb = vld1q_f32(pb.add(i * 4));
        acc = vfmaq_f32(acc, va, vb);
    }

    let mut sum = vaddvq_f32(acc);
    for i in lanes * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let lanes = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    let (pa, pb) = (a.as_ptr(), b.as_ptr());

    for i in 0..lanes {
        let va = _mm256_loadu_ps(pa.add(i * 8));
        let vb = _mm256_loadu_ps(pb.add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    // 8 → 4 → 2 → 1
    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let quad = _mm_add_ps(lo, hi);
    let pair = _mm_add_ps(quad, _mm_movehdup_ps(quad));
    let single = _mm_add_ss(pair, _mm_movehl_ps(pair, pair));
    let mut sum = _mm_cvtss_f32(single);

    for i in lanes * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[inline(always)]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Dot product of two equal-length vectors.
///
/// Slices of different length are compared over their common prefix; callers
/// validate dimensions before reaching this point.
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector length mismatch");
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    dot_scalar(a, b)
}

/// Euclidean norm.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    dot_product(v, v).sqrt()
}

/// L2 normalize a vector in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// L2 normalize a vector, returning a new vector
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    l2_normalize(&mut out);
    out
}

/// Check if a vector is L2 normalized (unit length)
#[inline]
pub fn is_normalized(v: &[f32], tolerance: f32) -> bool {
    (dot_product(v, v) - 1.0).abs() < tolerance
}

/// Cosine similarity for vectors of arbitrary length.
///
/// Returns 0.0 when either side has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = l2_norm(a) * l2_norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot_product(a, b) / denom
}

/// True when every component is finite.
#[inline]
pub fn is_finite(v: &[f32]) -> bool {
    v.iter().all(|x| x.is_finite())
}
