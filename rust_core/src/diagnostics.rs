//! Chain summary statistics: mean, variance, quantiles, split R-hat,
//! and lag autocorrelation.
//!
//! Split R-hat follows Vehtari et al. (2021): each chain is split in
//! half and the halves are compared as if they were separate chains.

/// Arithmetic mean.
pub fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Unbiased sample variance.
pub fn variance(data: &[f64]) -> f64 {
    let m = mean(data);
    data.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / (data.len() - 1) as f64
}

/// Linear-interpolated quantile of an ascending-sorted slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi.min(sorted.len() - 1)] * frac
}

/// Lag-`k` autocorrelation of a series.
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    let n = series.len();
    if lag >= n {
        return f64::NAN;
    }
    let m = mean(series);
    let mut num = 0.0;
    for t in 0..n - lag {
        num += (series[t] - m) * (series[t + lag] - m);
    }
    let denom: f64 = series.iter().map(|&v| (v - m) * (v - m)).sum();
    num / denom
}

/// Split R-hat: split each chain in half, treat the halves as 2M chains,
/// and compare between-chain to within-chain variance.
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len() as f64;
    let n = split[0].len() as f64;

    let chain_means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let grand_mean = chain_means.iter().sum::<f64>() / m;

    let b = n / (m - 1.0)
        * chain_means
            .iter()
            .map(|&cm| (cm - grand_mean).powi(2))
            .sum::<f64>();

    let w = split
        .iter()
        .map(|c| {
            let cm = mean(c);
            c.iter().map(|&x| (x - cm).powi(2)).sum::<f64>() / (n - 1.0)
        })
        .sum::<f64>()
        / m;

    if w < 1e-30 {
        return f64::NAN;
    }

    let var_hat = (n - 1.0) / n * w + b / n;
    (var_hat / w).sqrt()
}

fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut split = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let mid = chain.len() / 2;
        split.push(chain[..mid].to_vec());
        split.push(chain[mid..].to_vec());
    }
    split
}
