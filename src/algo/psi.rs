//! Population Stability Index over quantile bins.
//!
//! Bin edges come from the reference (baseline) distribution so that every
//! bin holds roughly the same share of the baseline. Both samples are bucketed
//! with the same edges; empty bins are floored at `epsilon`.
//!
//! PSI < 0.1: no significant change
//! PSI 0.1-0.2: moderate change
//! PSI > 0.2: significant change

/// Linear-interpolated quantile of an ascending slice. `q` in [0, 1].
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Interior bin edges at the `i / bins` quantiles of the baseline.
///
/// Duplicate edges (from discrete or constant data) are collapsed, so the
/// number of effective bins is `edges.len() + 1 <= bins`.
pub fn quantile_edges(sorted_baseline: &[f64], bins: usize) -> Vec<f64> {
    let mut edges: Vec<f64> = Vec::with_capacity(bins.saturating_sub(1));
    for i in 1..bins {
        let edge = quantile(sorted_baseline, i as f64 / bins as f64);
        if edges.last().is_none_or(|&last| edge > last) {
            edges.push(edge);
        }
    }
    edges
}

/// Fraction of `values` falling in each bin. A value equal to an edge belongs
/// to the lower bin.
pub fn bin_proportions(values: &[f64], edges: &[f64]) -> Vec<f64> {
    let mut counts = vec![0usize; edges.len() + 1];
    let mut total = 0usize;
    for &v in values {
        if !v.is_finite() {
            continue;
        }
        let idx = edges.partition_point(|&e| e < v);
        counts[idx] += 1;
        total += 1;
    }
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    counts
        .into_iter()
        .map(|c| c as f64 / total as f64)
        .collect()
}

/// PSI = sum((cur - base) * ln(cur / base)) with both proportions floored.
pub fn psi_from_proportions(base_pct: &[f64], cur_pct: &[f64], epsilon: f64) -> f64 {
    base_pct
        .iter()
        .zip(cur_pct)
        .map(|(&b, &c)| {
            let b = b.max(epsilon);
            let c = c.max(epsilon);
            (c - b) * (c / b).ln()
        })
        .sum()
}

/// PSI of `current` against an ascending `sorted_baseline`.
pub fn population_stability_index(
    sorted_baseline: &[f64],
    current: &[f64],
    bins: usize,
    epsilon: f64,
) -> f64 {
    if sorted_baseline.is_empty() || current.is_empty() {
        return 0.0;
    }
    let edges = quantile_edges(sorted_baseline, bins);
    let base_pct = bin_proportions(sorted_baseline, &edges);
    let cur_pct = bin_proportions(current, &edges);
    psi_from_proportions(&base_pct, &cur_pct, epsilon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<f64>) -> Vec<f64> {
        v.sort_by(f64::total_cmp);
        v
    }

    #[test]
    fn test_quantile_interpolation() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&data, 0.0), 1.0);
        assert_eq!(quantile(&data, 0.5), 3.0);
        assert_eq!(quantile(&data, 1.0), 5.0);
        assert!((quantile(&data, 0.125) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_edges_collapse_for_constant_data() {
        let data = vec![7.0; 100];
        assert_eq!(quantile_edges(&data, 10), vec![7.0]);
    }

    #[test]
    fn test_identical_distributions_score_zero() {
        let base = sorted((0..1_000).map(|i| (i % 97) as f64 * 1.3).collect());
        let psi = population_stability_index(&base, &base, 10, 1e-4);
        assert!(psi.abs() < 1e-12, "psi = {}", psi);
    }

    #[test]
    fn test_shifted_distribution_is_significant() {
        let base = sorted((0..1_000).map(|i| i as f64 / 10.0).collect());
        let current: Vec<f64> = (0..500).map(|i| 60.0 + i as f64 / 10.0).collect();
        let psi = population_stability_index(&base, &current, 10, 1e-4);
        assert!(psi > 0.2, "psi = {}", psi);
    }

    #[test]
    fn test_constant_baseline_detects_any_change() {
        let base = vec![10.0; 200];
        let current = vec![12.0; 50];
        let psi = population_stability_index(&base, &current, 10, 1e-4);
        assert!(psi > 1.0);
    }

    #[test]
    fn test_psi_is_non_negative() {
        let base = [0.5, 0.3, 0.2];
        let cur = [0.2, 0.3, 0.5];
        assert!(psi_from_proportions(&base, &cur, 1e-4) > 0.0);
        assert!(psi_from_proportions(&cur, &base, 1e-4) > 0.0);
    }
}
