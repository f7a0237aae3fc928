//! Two-sample Kolmogorov-Smirnov test.
//!
//! The statistic is the largest vertical gap between the two empirical CDFs.
//! The p-value uses the asymptotic Kolmogorov distribution with the
//! Stephens small-sample correction on the effective sample size.

/// KS statistic for two ascending samples. Returns 0.0 if either is empty.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;

    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        // Advance past ties on both sides before comparing the CDFs.
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n - j as f64 / m).abs());
    }
    d
}

/// Survival function of the Kolmogorov distribution,
/// Q(l) = 2 * sum_{k>=1} (-1)^(k-1) exp(-2 k^2 l^2).
pub fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda < 0.27 {
        return 1.0;
    }
    let a2 = -2.0 * lambda * lambda;
    let mut sum = 0.0;
    let mut sign = 1.0;
    let mut prev = 0.0f64;
    for k in 1..=100 {
        let kf = k as f64;
        let term = sign * 2.0 * (a2 * kf * kf).exp();
        sum += term;
        if term.abs() <= 1e-3 * prev || term.abs() <= 1e-8 * sum.abs() {
            return sum.clamp(0.0, 1.0);
        }
        sign = -sign;
        prev = term.abs();
    }
    // Series failed to converge, which only happens for tiny lambda.
    1.0
}

/// Asymptotic p-value for statistic `d` with sample sizes `n` and `m`.
pub fn ks_p_value(d: f64, n: usize, m: usize) -> f64 {
    if n == 0 || m == 0 {
        return 1.0;
    }
    let (n, m) = (n as f64, m as f64);
    let en = (n * m / (n + m)).sqrt();
    kolmogorov_survival((en + 0.12 + 0.11 / en) * d)
}

/// Statistic and p-value for two ascending samples.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> (f64, f64) {
    let d = ks_statistic(a, b);
    (d, ks_p_value(d, a.len(), b.len()))
}
