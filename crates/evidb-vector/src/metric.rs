//! Scores accumulate in `f64`: squares of large finite `f32` components
//! overflow an `f32` sum long before the norm itself does.

use evidb_core::Metric;

pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt()
}

/// Higher is closer for every metric. A zero vector has cosine similarity 0
/// with everything.
#[allow(clippy::cast_possible_truncation)]
pub fn similarity(metric: Metric, query: &[f32], query_norm: f64, stored: &[f32], stored_norm: f64) -> f32 {
    match metric {
        Metric::Cosine => {
            if query_norm == 0.0 || stored_norm == 0.0 {
                return 0.0;
            }
            let dot: f64 = query.iter().zip(stored).map(|(&a, &b)| f64::from(a) * f64::from(b)).sum();
            ((dot / query_norm) / stored_norm) as f32
        }
        Metric::L2 => {
            let dist = query
                .iter()
                .zip(stored)
                .map(|(&a, &b)| {
                    let d = f64::from(a) - f64::from(b);
                    d * d
                })
                .sum::<f64>()
                .sqrt();
            -dist as f32
        }
    }
}
