// Regularized ("Finnish") horseshoe shrinkage of per-gene condition effects.
//
// Piironen, J. and Vehtari, A. (2017) Sparsity information and regularization
// in the horseshoe and other shrinkage priors. Electron. J. Statist., 11(2),
// 5018-5051.

use crate::error::{Error, Result};
use ndarray::{Array2, Array3, ArrayView, ArrayView2, ArrayView3, Dimension, Zip};

// Data-dependent constants of the transform, fixed for the whole fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HorseshoeScale {
    // global scale anchoring the expected number of large effects
    pub τ0: f64,
    // squared slab scale
    pub slab_scale2: f64,
}

impl HorseshoeScale {
    // `m` total number of conditions, `m0` the expected number of conditions
    // with a non-negligible effect, `n` observations per gene, `var` the
    // variance of the whole response.
    pub fn new(m: usize, m0: f64, n: usize, var: f64, slab_scale: f64) -> Result<HorseshoeScale> {
        if !(m0 > 0.0 && m0 < m as f64) {
            return Err(Error::InvalidConfig(format!(
                "expected number of large effects ({}) must lie strictly between 0 and the number of conditions ({})",
                m0, m
            )));
        }
        if n == 0 {
            return Err(Error::InvalidConfig("no observations per gene".to_string()));
        }
        if !(var > 0.0) || !var.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "response variance must be positive and finite, got {}",
                var
            )));
        }
        if !(slab_scale > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "slab scale must be positive, got {}",
                slab_scale
            )));
        }

        let τ0 = (m0 / (m as f64 - m0)) * var.sqrt() / (n as f64).sqrt();
        Ok(HorseshoeScale {
            τ0,
            slab_scale2: slab_scale * slab_scale,
        })
    }
}

// Local scale capped by the slab: never exceeds sqrt(c2).
#[inline]
pub fn regularized_local_scale(c2: f64, τ: f64, λ: f64) -> f64 {
    (c2 * λ * λ / (c2 + τ * τ + λ * λ)).sqrt()
}

#[inline]
pub fn horseshoe_coefficient(scale: &HorseshoeScale, τ_tilde: f64, c2_tilde: f64, λ: f64, β_tilde: f64) -> f64 {
    let τ = scale.τ0 * τ_tilde;
    let c2 = scale.slab_scale2 * c2_tilde;
    τ * regularized_local_scale(c2, τ, λ) * β_tilde
}

// Coefficient together with its partial derivatives with respect to
// β_tilde and the logs of λ, τ_tilde and c2_tilde.
#[derive(Clone, Copy, Debug)]
pub struct HorseshoeGradient {
    pub β: f64,
    pub d_β_tilde: f64,
    pub d_log_λ: f64,
    pub d_log_τ_tilde: f64,
    pub d_log_c2_tilde: f64,
}

#[inline]
pub fn horseshoe_gradient(τ: f64, c2: f64, λ: f64, β_tilde: f64) -> HorseshoeGradient {
    let d = c2 + τ * τ + λ * λ;
    let d32 = d * d.sqrt();
    let sqrt_c2 = c2.sqrt();
    let λ_tilde = regularized_local_scale(c2, τ, λ);

    let d_λ_tilde_d_λ = sqrt_c2 * (c2 + τ * τ) / d32;
    let d_λ_tilde_d_τ = -sqrt_c2 * λ * τ / d32;
    let d_λ_tilde_d_c2 = λ * (τ * τ + λ * λ) / (2.0 * sqrt_c2 * d32);

    HorseshoeGradient {
        β: τ * λ_tilde * β_tilde,
        d_β_tilde: τ * λ_tilde,
        d_log_λ: τ * β_tilde * d_λ_tilde_d_λ * λ,
        d_log_τ_tilde: β_tilde * (λ_tilde + τ * d_λ_tilde_d_τ) * τ,
        d_log_c2_tilde: τ * β_tilde * d_λ_tilde_d_c2 * c2,
    }
}

// Per-gene condition effects from one set of raw parameters.
// `τ_tilde` and `c2_tilde` are [ngenes, 1], `λ` and `β_tilde` [ngenes, nconditions].
pub fn finnish_horseshoe(
    scale: &HorseshoeScale,
    τ_tilde: ArrayView2<f64>,
    c2_tilde: ArrayView2<f64>,
    λ: ArrayView2<f64>,
    β_tilde: ArrayView2<f64>,
) -> Result<Array2<f64>> {
    let τ_tilde = broadcast_gene_scale("tau_tilde", &τ_tilde, λ.raw_dim())?;
    let c2_tilde = broadcast_gene_scale("c2_tilde", &c2_tilde, λ.raw_dim())?;

    let mut β = Array2::zeros(λ.raw_dim());
    Zip::from(&mut β)
        .and(&τ_tilde)
        .and(&c2_tilde)
        .and(&λ)
        .and(&β_tilde)
        .for_each(|β, &τ_tilde, &c2_tilde, &λ, &β_tilde| {
            *β = horseshoe_coefficient(scale, τ_tilde, c2_tilde, λ, β_tilde);
        });
    Ok(β)
}

// The transform applied independently to every draw, in parallel.
// Per-gene scales are [ndraws, ngenes, 1], everything else [ndraws, ngenes, nconditions].
pub fn finnish_horseshoe_draws(
    scale: &HorseshoeScale,
    τ_tilde: ArrayView3<f64>,
    c2_tilde: ArrayView3<f64>,
    λ: ArrayView3<f64>,
    β_tilde: ArrayView3<f64>,
) -> Result<Array3<f64>> {
    if β_tilde.shape() != λ.shape() {
        return Err(Error::ShapeMismatch {
            context: "beta_tilde".to_string(),
            expected: λ.shape().to_vec(),
            got: β_tilde.shape().to_vec(),
        });
    }
    let τ_tilde = broadcast_gene_scale("tau_tilde", &τ_tilde, λ.raw_dim())?;
    let c2_tilde = broadcast_gene_scale("c2_tilde", &c2_tilde, λ.raw_dim())?;

    let mut β = Array3::zeros(λ.raw_dim());
    Zip::from(&mut β)
        .and(&τ_tilde)
        .and(&c2_tilde)
        .and(&λ)
        .and(&β_tilde)
        .par_for_each(|β, &τ_tilde, &c2_tilde, &λ, &β_tilde| {
            *β = horseshoe_coefficient(scale, τ_tilde, c2_tilde, λ, β_tilde);
        });
    Ok(β)
}

fn broadcast_gene_scale<'b, 'a: 'b, D: Dimension>(
    name: &str,
    x: &'b ArrayView<'a, f64, D>,
    dim: D,
) -> Result<ArrayView<'b, f64, D>> {
    let ncol = x.shape().last().copied().unwrap_or(0);
    let expected = dim.slice().to_vec();
    let leading_ok = x.shape()[..x.ndim().saturating_sub(1)] == expected[..expected.len().saturating_sub(1)];
    if ncol != 1 || !leading_ok {
        let mut want = expected.clone();
        if let Some(last) = want.last_mut() {
            *last = 1;
        }
        return Err(Error::ShapeMismatch {
            context: name.to_string(),
            expected: want,
            got: x.shape().to_vec(),
        });
    }
    x.broadcast(dim.clone()).ok_or(Error::ShapeMismatch {
        context: name.to_string(),
        expected,
        got: x.shape().to_vec(),
    })
}
