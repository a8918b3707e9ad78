// Convergence diagnostics over multiple chains: split R-hat, effective sample
// size, and per-chain sampler statistics. These are reported, never enforced.

use super::nuts::{ChainOutput, ChainStats};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;

const RHAT_WARN: f64 = 1.05;
const ESS_WARN: f64 = 100.0;
const MAX_AUTOCORRELATION_LAG: usize = 1000;

// Worst-case convergence statistics for one parameter family.
#[derive(Clone, Debug)]
pub struct FamilyDiagnostics {
    pub family: &'static str,
    pub count: usize,
    pub max_rhat: f64,
    pub min_ess: f64,
}

#[derive(Clone, Debug, Default)]
pub struct SamplerDiagnostics {
    pub chains: Vec<ChainStats>,
    pub families: Vec<FamilyDiagnostics>,
}

impl SamplerDiagnostics {
    pub fn from_chains<F>(outputs: &[ChainOutput], family: F) -> SamplerDiagnostics
    where
        F: Fn(usize) -> &'static str + Sync,
    {
        let dim = outputs.first().map(|o| o.draws.shape()[1]).unwrap_or(0);

        let per_coord: Vec<(&'static str, f64, f64)> = (0..dim)
            .into_par_iter()
            .map(|j| {
                let columns: Vec<Vec<f64>> = outputs
                    .iter()
                    .map(|o| o.draws.column(j).to_vec())
                    .collect();
                let columns: Vec<&[f64]> = columns.iter().map(|c| c.as_slice()).collect();
                (family(j), split_rhat(&columns), effective_sample_size(&columns))
            })
            .collect();

        let mut by_family: BTreeMap<&'static str, FamilyDiagnostics> = BTreeMap::new();
        for (name, rhat, ess) in per_coord {
            let entry = by_family.entry(name).or_insert(FamilyDiagnostics {
                family: name,
                count: 0,
                max_rhat: f64::NEG_INFINITY,
                min_ess: f64::INFINITY,
            });
            entry.count += 1;
            if rhat.is_finite() {
                entry.max_rhat = entry.max_rhat.max(rhat);
            }
            entry.min_ess = entry.min_ess.min(ess);
        }

        SamplerDiagnostics {
            chains: outputs.iter().map(|o| o.stats.clone()).collect(),
            families: by_family.into_values().collect(),
        }
    }

    pub fn total_divergences(&self) -> usize {
        self.chains.iter().map(|c| c.ndivergent()).sum()
    }

    pub fn log_summary(&self) {
        for (k, chain) in self.chains.iter().enumerate() {
            info!(
                "chain {}: step size {:.3e}, mean accept stat {:.3}, mean tree depth {:.2}, {} divergences ({} during warmup)",
                k,
                chain.step_size,
                chain.mean_accept_stat(),
                chain.mean_tree_depth(),
                chain.ndivergent(),
                chain.warmup_divergences
            );
            if chain.n_max_treedepth() > 0 {
                warn!(
                    "chain {}: {} transitions hit the maximum tree depth of {}",
                    k,
                    chain.n_max_treedepth(),
                    chain.max_treedepth
                );
            }
        }

        let ndivergent = self.total_divergences();
        if ndivergent > 0 {
            warn!("{} divergent transitions after warmup", ndivergent);
        }

        for family in &self.families {
            info!(
                "{:>10} ({} values): max R-hat {:.3}, min ESS {:.1}",
                family.family, family.count, family.max_rhat, family.min_ess
            );
            if family.max_rhat > RHAT_WARN {
                warn!("{}: R-hat {:.3} suggests chains have not mixed", family.family, family.max_rhat);
            }
            if family.min_ess < ESS_WARN {
                warn!("{}: effective sample size as low as {:.1}", family.family, family.min_ess);
            }
        }
    }
}

// Split every chain in half, discarding the middle draw of odd-length chains.
fn split_halves<'a>(chains: &[&'a [f64]]) -> Vec<&'a [f64]> {
    let mut halves = Vec::with_capacity(2 * chains.len());
    for chain in chains {
        let half = chain.len() / 2;
        halves.push(&chain[..half]);
        halves.push(&chain[chain.len() - half..]);
    }
    halves
}

fn mean_and_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0).max(1.0);
    (mean, var)
}

// Potential scale reduction using split chains. Returns NaN when there are
// fewer than four draws per chain.
pub fn split_rhat(chains: &[&[f64]]) -> f64 {
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0) / 2;
    if chains.is_empty() || n < 2 {
        return f64::NAN;
    }

    let halves = split_halves(chains);
    let m = halves.len() as f64;
    let nf = n as f64;
    let stats: Vec<(f64, f64)> = halves.iter().map(|h| mean_and_var(&h[..n])).collect();

    let w = stats.iter().map(|s| s.1).sum::<f64>() / m;
    let overall = stats.iter().map(|s| s.0).sum::<f64>() / m;
    let b = stats.iter().map(|s| (s.0 - overall).powi(2)).sum::<f64>() * nf / (m - 1.0);

    if w <= 1e-10 {
        return 1.0;
    }
    let var_hat = (nf - 1.0) / nf * w + b / nf;
    (var_hat / w).sqrt()
}

// Effective sample size from split-chain autocovariances combined across
// chains, so disagreement between chains lowers the estimate. The sum of
// autocorrelations is truncated at the first non-positive pair of lags.
pub fn effective_sample_size(chains: &[&[f64]]) -> f64 {
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0) / 2;
    let total_draws = chains.iter().map(|c| c.len()).sum::<usize>().max(1) as f64;
    if chains.is_empty() || n < 4 {
        return total_draws;
    }

    let halves: Vec<&[f64]> = split_halves(chains).into_iter().map(|h| &h[..n]).collect();
    let m = halves.len();
    let nf = n as f64;
    let means: Vec<f64> = halves.iter().map(|h| h.iter().sum::<f64>() / nf).collect();

    // mean over halves of the biased autocovariance at `lag`
    let autocovariance = |lag: usize| -> f64 {
        let mut acov = 0.0;
        for (h, &μ) in halves.iter().zip(&means) {
            acov += (0..n - lag)
                .map(|t| (h[t] - μ) * (h[t + lag] - μ))
                .sum::<f64>()
                / nf;
        }
        acov / m as f64
    };

    let w = autocovariance(0) * nf / (nf - 1.0);
    let overall = means.iter().sum::<f64>() / m as f64;
    let b_over_n = means.iter().map(|μ| (μ - overall).powi(2)).sum::<f64>() / (m as f64 - 1.0);
    let var_plus = (nf - 1.0) / nf * w + b_over_n;
    if !(var_plus > 1e-16) || !var_plus.is_finite() {
        return total_draws;
    }
    let autocorrelation = |lag: usize| 1.0 - (w - autocovariance(lag)) / var_plus;

    let max_lag = (n - 1).min(MAX_AUTOCORRELATION_LAG);
    let mut τ = -1.0;
    let mut lag = 0;
    while lag + 1 < max_lag {
        let pair = autocorrelation(lag) + autocorrelation(lag + 1);
        if !pair.is_finite() || pair <= 0.0 {
            break;
        }
        τ += 2.0 * pair;
        lag += 2;
    }

    let total = (m * n) as f64;
    if !(τ > 0.0) || !τ.is_finite() {
        return total;
    }
    (total / τ).clamp(1.0, total)
}
