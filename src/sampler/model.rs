use super::horseshoe::{horseshoe_gradient, HorseshoeScale};
use super::math::{
    exponential_logpdf, half_cauchy_logpdf, inverse_gamma_logpdf, normal_logpdf,
    normal_suffstat_logpdf, variance,
};
use super::nuts::LogDensity;
use super::observations::ExpressionData;
use super::ModelPriors;
use crate::error::Result;
use crate::posterior::{ALPHA, BETA_TILDE, C2_TILDE, LAMBDA, SIGMA, TAU_TILDE};
use log::info;
use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView2, Axis};
use rayon::prelude::*;

// Layout of one gene's block in the unconstrained parameter vector. Positive
// parameters are stored on the log scale.
const ALPHA_OFFSET: usize = 0;
const LOG_TAU_TILDE_OFFSET: usize = 1;
const LOG_C2_TILDE_OFFSET: usize = 2;
const BETA_TILDE_OFFSET: usize = 3;

// Genes handled per rayon task when evaluating the log density.
const RAYON_GENE_MIN_LEN: usize = 16;

// Hierarchical regression of log2 signal on per-gene intercepts and
// per-gene, per-condition effects under a regularized horseshoe prior:
//
//   α[g]        ~ Normal(μ_α, σ_α)
//   β_tilde[g,c] ~ Normal(0, 1)
//   λ[g,c]      ~ HalfCauchy(1)
//   τ_tilde[g]  ~ HalfCauchy(1)
//   c2_tilde[g] ~ InverseGamma(slab_df/2, slab_df/2)
//   b[g,c]      = finnish_horseshoe(τ_tilde, c2_tilde, λ, β_tilde)
//   σ           ~ Exponential(λ_σ)
//   y[i]        ~ Normal(α[g(i)] + b[g(i), c(i)], σ)
//
// The likelihood is evaluated from per-(gene, condition) sufficient statistics.
pub struct HorseshoeModel {
    pub ngenes: usize,
    pub nconditions: usize,
    pub nobs_per_gene: usize,
    pub priors: ModelPriors,
    pub scale: HorseshoeScale,
    half_slab_df: f64,
    nobs: f64,

    // [ngenes, nconditions] observation count, sum, and sum of squares
    count: Array2<f64>,
    sum: Array2<f64>,
    sumsq: Array2<f64>,
}

impl HorseshoeModel {
    pub fn new(data: &ExpressionData, priors: ModelPriors) -> Result<HorseshoeModel> {
        priors.validate()?;
        let nobs_per_gene = data.observations_per_gene()?;
        let ngenes = data.ngenes();
        let nconditions = data.nconditions();

        let var = variance(&data.values());
        let scale = HorseshoeScale::new(
            nconditions,
            priors.expected_large_effects,
            nobs_per_gene,
            var,
            priors.slab_scale,
        )?;

        let mut count = Array2::zeros((ngenes, nconditions));
        let mut sum = Array2::zeros((ngenes, nconditions));
        let mut sumsq = Array2::zeros((ngenes, nconditions));
        for obs in &data.observations {
            let idx = [obs.gene as usize, obs.condition as usize];
            count[idx] += 1.0;
            sum[idx] += obs.value;
            sumsq[idx] += obs.value * obs.value;
        }

        info!(
            "Model: {} genes, {} conditions, {} observations per gene, var(y) = {:.4}, τ0 = {:.4e}",
            ngenes, nconditions, nobs_per_gene, var, scale.τ0
        );

        Ok(HorseshoeModel {
            ngenes,
            nconditions,
            nobs_per_gene,
            priors,
            scale,
            half_slab_df: priors.slab_df / 2.0,
            nobs: data.observations.len() as f64,
            count,
            sum,
            sumsq,
        })
    }

    pub fn gene_block_len(&self) -> usize {
        BETA_TILDE_OFFSET + 2 * self.nconditions
    }

    fn log_lambda_offset(&self) -> usize {
        BETA_TILDE_OFFSET + self.nconditions
    }

    fn log_sigma_index(&self) -> usize {
        self.ngenes * self.gene_block_len()
    }

    // Name of the parameter family a coordinate of the unconstrained vector
    // belongs to.
    pub fn parameter_family(&self, i: usize) -> &'static str {
        if i == self.log_sigma_index() {
            return SIGMA;
        }
        let j = i % self.gene_block_len();
        match j {
            ALPHA_OFFSET => ALPHA,
            LOG_TAU_TILDE_OFFSET => TAU_TILDE,
            LOG_C2_TILDE_OFFSET => C2_TILDE,
            _ if j < self.log_lambda_offset() => BETA_TILDE,
            _ => LAMBDA,
        }
    }

    // Map unconstrained draws [ndraws, dim] to named parameter arrays with a
    // leading draw axis.
    pub fn constrain_draws(&self, draws: ArrayView2<f64>) -> Vec<(&'static str, ArrayD<f64>)> {
        let ndraws = draws.shape()[0];
        let (ngenes, nconditions) = (self.ngenes, self.nconditions);
        let block = self.gene_block_len();
        let lo = self.log_lambda_offset();

        let mut α = Array2::zeros((ndraws, ngenes));
        let mut τ_tilde = Array3::zeros((ndraws, ngenes, 1));
        let mut c2_tilde = Array3::zeros((ndraws, ngenes, 1));
        let mut β_tilde = Array3::zeros((ndraws, ngenes, nconditions));
        let mut λ = Array3::zeros((ndraws, ngenes, nconditions));
        let mut σ = Array1::zeros(ndraws);

        for (d, q) in draws.axis_iter(Axis(0)).enumerate() {
            for g in 0..ngenes {
                let b = g * block;
                α[[d, g]] = q[b + ALPHA_OFFSET];
                τ_tilde[[d, g, 0]] = q[b + LOG_TAU_TILDE_OFFSET].exp();
                c2_tilde[[d, g, 0]] = q[b + LOG_C2_TILDE_OFFSET].exp();
                for c in 0..nconditions {
                    β_tilde[[d, g, c]] = q[b + BETA_TILDE_OFFSET + c];
                    λ[[d, g, c]] = q[b + lo + c].exp();
                }
            }
            σ[d] = q[self.log_sigma_index()].exp();
        }

        vec![
            (ALPHA, α.into_dyn()),
            (BETA_TILDE, β_tilde.into_dyn()),
            (LAMBDA, λ.into_dyn()),
            (TAU_TILDE, τ_tilde.into_dyn()),
            (C2_TILDE, c2_tilde.into_dyn()),
            (SIGMA, σ.into_dyn()),
        ]
    }

    // Log density and gradient of one gene's block, given σ. Also returns the
    // gene's residual sum of squares, needed for the σ gradient.
    fn gene_logp_and_grad(&self, g: usize, q: &[f64], grad: &mut [f64], σ: f64) -> (f64, f64) {
        let priors = &self.priors;
        let lo = self.log_lambda_offset();
        let σ2 = σ * σ;

        let α = q[ALPHA_OFFSET];
        let log_τ_tilde = q[LOG_TAU_TILDE_OFFSET];
        let log_c2_tilde = q[LOG_C2_TILDE_OFFSET];
        let τ_tilde = log_τ_tilde.exp();
        let c2_tilde = log_c2_tilde.exp();
        let τ = self.scale.τ0 * τ_tilde;
        let c2 = self.scale.slab_scale2 * c2_tilde;

        // priors, with log-Jacobian terms for the log-transformed parameters
        let mut lp = normal_logpdf(priors.μ_α, priors.σ_α, α)
            + half_cauchy_logpdf(1.0, τ_tilde)
            + log_τ_tilde
            + inverse_gamma_logpdf(self.half_slab_df, self.half_slab_df, c2_tilde)
            + log_c2_tilde;

        grad[ALPHA_OFFSET] = -(α - priors.μ_α) / (priors.σ_α * priors.σ_α);
        grad[LOG_TAU_TILDE_OFFSET] = 1.0 - 2.0 * τ_tilde * τ_tilde / (1.0 + τ_tilde * τ_tilde);
        grad[LOG_C2_TILDE_OFFSET] = -self.half_slab_df + self.half_slab_df / c2_tilde;

        let mut sse = 0.0;
        for c in 0..self.nconditions {
            let β_tilde = q[BETA_TILDE_OFFSET + c];
            let log_λ = q[lo + c];
            let λ = log_λ.exp();

            lp += normal_logpdf(0.0, 1.0, β_tilde) + half_cauchy_logpdf(1.0, λ) + log_λ;
            grad[BETA_TILDE_OFFSET + c] = -β_tilde;
            grad[lo + c] = 1.0 - 2.0 * λ * λ / (1.0 + λ * λ);

            let hs = horseshoe_gradient(τ, c2, λ, β_tilde);
            let μ = α + hs.β;
            let n = self.count[[g, c]];
            if n == 0.0 {
                continue;
            }
            let s1 = self.sum[[g, c]];
            let s2 = self.sumsq[[g, c]];
            lp += normal_suffstat_logpdf(μ, σ, n, s1, s2);
            sse += s2 - 2.0 * μ * s1 + n * μ * μ;

            // d loglik / d μ
            let r = (s1 - n * μ) / σ2;
            grad[ALPHA_OFFSET] += r;
            grad[BETA_TILDE_OFFSET + c] += r * hs.d_β_tilde;
            grad[lo + c] += r * hs.d_log_λ;
            grad[LOG_TAU_TILDE_OFFSET] += r * hs.d_log_τ_tilde;
            grad[LOG_C2_TILDE_OFFSET] += r * hs.d_log_c2_tilde;
        }

        (lp, sse)
    }
}

impl LogDensity for HorseshoeModel {
    fn dim(&self) -> usize {
        self.log_sigma_index() + 1
    }

    fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64 {
        let block = self.gene_block_len();
        let isigma = self.log_sigma_index();
        let log_σ = q[isigma];
        let σ = log_σ.exp();

        let (gene_grad, sigma_grad) = grad.split_at_mut(isigma);
        // Per-gene terms are summed in a fixed order so a chain is reproducible
        // from its seed regardless of how rayon splits the work.
        let terms: Vec<(f64, f64)> = gene_grad
            .par_chunks_mut(block)
            .zip(q[..isigma].par_chunks(block))
            .enumerate()
            .with_min_len(RAYON_GENE_MIN_LEN)
            .map(|(g, (grad_g, q_g))| self.gene_logp_and_grad(g, q_g, grad_g, σ))
            .collect();
        let (lp, sse) = terms
            .iter()
            .fold((0.0, 0.0), |(lp, sse), &(a, b)| (lp + a, sse + b));

        let λ_σ = self.priors.λ_σ;
        sigma_grad[0] = -λ_σ * σ + 1.0 - self.nobs + sse / (σ * σ);

        lp + exponential_logpdf(λ_σ, σ) + log_σ
    }
}

// Pack named constrained values into an unconstrained vector. Used to
// evaluate the model at chosen parameter values.
pub fn unconstrain(
    model: &HorseshoeModel,
    α: &Array1<f64>,
    τ_tilde: &Array1<f64>,
    c2_tilde: &Array1<f64>,
    β_tilde: &Array2<f64>,
    λ: &Array2<f64>,
    σ: f64,
) -> Vec<f64> {
    let block = model.gene_block_len();
    let lo = model.log_lambda_offset();
    let mut q = vec![0.0; model.dim()];
    for g in 0..model.ngenes {
        let b = g * block;
        q[b + ALPHA_OFFSET] = α[g];
        q[b + LOG_TAU_TILDE_OFFSET] = τ_tilde[g].ln();
        q[b + LOG_C2_TILDE_OFFSET] = c2_tilde[g].ln();
        for c in 0..model.nconditions {
            q[b + BETA_TILDE_OFFSET + c] = β_tilde[[g, c]];
            q[b + lo + c] = λ[[g, c]].ln();
        }
    }
    q[model.log_sigma_index()] = σ.ln();
    q
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sampler::horseshoe::finnish_horseshoe;
    use crate::sampler::observations::ObservationRecord;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn toy_data(ngenes: usize, nconditions: usize, nreps: usize, seed: u64) -> ExpressionData {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut records = Vec::new();
        for g in 0..ngenes {
            for c in 0..nconditions {
                for r in 0..nreps {
                    let effect = if c == 1 && g == 0 { 2.0 } else { 0.0 };
                    records.push(ObservationRecord {
                        gene_name: format!("gene{}", g),
                        locus_tag: format!("BSU{:05}", g),
                        orientation: (g % 2) as u8,
                        condition: format!("cond{}", c),
                        replicate: r.to_string(),
                        value: 8.0 + g as f64 + effect + 0.3 * (rng.random::<f64>() - 0.5),
                        gene_index: g as i64,
                        condition_index: c as i64,
                    });
                }
            }
        }
        ExpressionData::from_records(&records).unwrap()
    }

    #[test]
    fn test_dimension_and_families() {
        let data = toy_data(3, 4, 2, 1);
        let model = HorseshoeModel::new(&data, ModelPriors { expected_large_effects: 1.0, ..ModelPriors::default() }).unwrap();
        assert_eq!(model.gene_block_len(), 11);
        assert_eq!(model.dim(), 34);
        assert_eq!(model.nobs_per_gene, 8);
        assert_eq!(model.parameter_family(0), ALPHA);
        assert_eq!(model.parameter_family(1), TAU_TILDE);
        assert_eq!(model.parameter_family(2), C2_TILDE);
        assert_eq!(model.parameter_family(3), BETA_TILDE);
        assert_eq!(model.parameter_family(7), LAMBDA);
        assert_eq!(model.parameter_family(11), ALPHA);
        assert_eq!(model.parameter_family(33), SIGMA);
    }

    #[test]
    fn test_rejects_too_many_expected_effects() {
        let data = toy_data(2, 3, 2, 1);
        // default expects 5 large effects but there are only 3 conditions
        assert!(HorseshoeModel::new(&data, ModelPriors::default()).is_err());
    }

    #[test]
    fn test_logp_matches_pointwise() {
        let data = toy_data(2, 3, 3, 2);
        let priors = ModelPriors { expected_large_effects: 1.0, ..ModelPriors::default() };
        let model = HorseshoeModel::new(&data, priors).unwrap();

        let α = array![9.0, 10.5];
        let τ_tilde = array![0.7, 1.9];
        let c2_tilde = array![1.2, 0.4];
        let β_tilde = array![[0.1, 1.5, -0.3], [-1.0, 0.2, 0.0]];
        let λ = array![[0.5, 3.0, 0.2], [1.1, 0.05, 7.0]];
        let σ = 0.8;

        let q = unconstrain(&model, &α, &τ_tilde, &c2_tilde, &β_tilde, &λ, σ);
        let mut grad = vec![0.0; model.dim()];
        let lp = model.logp_and_grad(&q, &mut grad);

        let b = finnish_horseshoe(
            &model.scale,
            τ_tilde.view().insert_axis(Axis(1)),
            c2_tilde.view().insert_axis(Axis(1)),
            λ.view(),
            β_tilde.view(),
        )
        .unwrap();

        let h = priors.slab_df / 2.0;
        let mut expected = exponential_logpdf(1.0, σ) + σ.ln();
        for g in 0..2 {
            expected += normal_logpdf(10.0, 10.0, α[g])
                + half_cauchy_logpdf(1.0, τ_tilde[g])
                + τ_tilde[g].ln()
                + inverse_gamma_logpdf(h, h, c2_tilde[g])
                + c2_tilde[g].ln();
            for c in 0..3 {
                expected += normal_logpdf(0.0, 1.0, β_tilde[[g, c]])
                    + half_cauchy_logpdf(1.0, λ[[g, c]])
                    + λ[[g, c]].ln();
            }
        }
        for obs in &data.observations {
            let (g, c) = (obs.gene as usize, obs.condition as usize);
            expected += normal_logpdf(α[g] + b[[g, c]], σ, obs.value);
        }

        assert!((lp - expected).abs() < 1e-8, "{} != {}", lp, expected);
    }

    #[test]
    fn test_gradient_finite_difference() {
        let data = toy_data(3, 3, 2, 3);
        let model = HorseshoeModel::new(&data, ModelPriors { expected_large_effects: 1.0, ..ModelPriors::default() }).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let q: Vec<f64> = (0..model.dim()).map(|_| rng.random::<f64>() * 2.0 - 1.0).collect();

        let mut grad = vec![0.0; model.dim()];
        model.logp_and_grad(&q, &mut grad);

        let mut scratch = vec![0.0; model.dim()];
        let h = 1e-6;
        for i in 0..model.dim() {
            let mut qp = q.clone();
            qp[i] += h;
            let mut qm = q.clone();
            qm[i] -= h;
            let fd = (model.logp_and_grad(&qp, &mut scratch) - model.logp_and_grad(&qm, &mut scratch))
                / (2.0 * h);
            let tol = 1e-4 * (1.0 + fd.abs());
            assert!(
                (grad[i] - fd).abs() < tol,
                "coordinate {} ({}): analytic {} vs numeric {}",
                i,
                model.parameter_family(i),
                grad[i],
                fd
            );
        }
    }

    #[test]
    fn test_constrain_draws_roundtrip() {
        let data = toy_data(2, 3, 2, 4);
        let model = HorseshoeModel::new(&data, ModelPriors { expected_large_effects: 1.0, ..ModelPriors::default() }).unwrap();
        let α = array![9.0, 10.5];
        let τ_tilde = array![0.7, 1.9];
        let c2_tilde = array![1.2, 0.4];
        let β_tilde = array![[0.1, 1.5, -0.3], [-1.0, 0.2, 0.0]];
        let λ = array![[0.5, 3.0, 0.2], [1.1, 0.05, 7.0]];
        let q = unconstrain(&model, &α, &τ_tilde, &c2_tilde, &β_tilde, &λ, 0.8);

        let draws = Array2::from_shape_vec((1, q.len()), q).unwrap();
        let params = model.constrain_draws(draws.view());
        let get = |name: &str| params.iter().find(|(n, _)| *n == name).unwrap().1.clone();

        assert_eq!(get(ALPHA).shape(), &[1, 2]);
        assert_eq!(get(TAU_TILDE).shape(), &[1, 2, 1]);
        assert_eq!(get(LAMBDA).shape(), &[1, 2, 3]);
        assert_eq!(get(SIGMA).shape(), &[1]);
        assert!((get(LAMBDA)[[0, 1, 2]] - 7.0).abs() < 1e-12);
        assert!((get(C2_TILDE)[[0, 1, 0]] - 0.4).abs() < 1e-12);
        assert_eq!(get(BETA_TILDE)[[0, 0, 1]], 1.5);
        assert!((get(SIGMA)[[0]] - 0.8).abs() < 1e-12);
    }
}
