use libm::lgamma;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64;

const LN_SQRT_TWO_PI: f64 = 0.918_938_533_204_672_8_f64;

// ln(2/π), normalizing constant of the half-Cauchy
const LN_TWO_OVER_PI: f64 = -0.451_582_705_289_454_9_f64;

pub fn normal_logpdf(μ: f64, σ: f64, x: f64) -> f64 {
    -LN_SQRT_TWO_PI - σ.ln() - ((x - μ) / σ).powi(2) / 2.0
}

// Normal log-likelihood of a group of `n` observations with the given sum and
// sum of squares, all sharing mean μ.
pub fn normal_suffstat_logpdf(μ: f64, σ: f64, n: f64, sum: f64, sumsq: f64) -> f64 {
    let sse = sumsq - 2.0 * μ * sum + n * μ * μ;
    -n * (LN_SQRT_TWO_PI + σ.ln()) - sse / (2.0 * σ * σ)
}

pub fn half_cauchy_logpdf(scale: f64, x: f64) -> f64 {
    LN_TWO_OVER_PI - scale.ln() - (x / scale).powi(2).ln_1p()
}

pub fn inverse_gamma_logpdf(shape: f64, scale: f64, x: f64) -> f64 {
    shape * scale.ln() - lgamma(shape) - (shape + 1.0) * x.ln() - scale / x
}

pub fn exponential_logpdf(rate: f64, x: f64) -> f64 {
    rate.ln() - rate * x
}

pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

pub fn randn<R: Rng>(rng: &mut R) -> f64 {
    rng.sample::<f64, StandardNormal>(StandardNormal)
}

// Population variance (no Bessel correction).
pub fn variance(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let μ = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - μ).powi(2)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffstat_matches_pointwise() {
        let ys = [1.5, 2.0, -0.25, 3.75];
        let (μ, σ) = (1.2, 0.7);
        let pointwise: f64 = ys.iter().map(|&y| normal_logpdf(μ, σ, y)).sum();
        let sum: f64 = ys.iter().sum();
        let sumsq: f64 = ys.iter().map(|y| y * y).sum();
        let grouped = normal_suffstat_logpdf(μ, σ, ys.len() as f64, sum, sumsq);
        assert!((pointwise - grouped).abs() < 1e-10);
    }

    #[test]
    fn test_half_cauchy_normalized_at_zero() {
        // density at zero is 2 / (π s)
        let s = 2.0;
        let expected = (2.0 / (f64::consts::PI * s)).ln();
        assert!((half_cauchy_logpdf(s, 0.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_inverse_gamma_known_value() {
        // InvGamma(1, 1) at x = 1 is exp(-1)
        assert!((inverse_gamma_logpdf(1.0, 1.0, 1.0) - (-1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_log_sum_exp() {
        assert!((log_sum_exp(0.0, 0.0) - 2f64.ln()).abs() < 1e-12);
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert!((log_sum_exp(f64::NEG_INFINITY, 1.5) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_population_variance() {
        assert!((variance(&[1.0, 2.0, 3.0, 4.0]) - 1.25).abs() < 1e-12);
        assert_eq!(variance(&[]), 0.0);
    }
}
