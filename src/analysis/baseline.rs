use crate::error::{Error, Result};
use crate::genes::Lookup;
use crate::posterior::{PosteriorDraws, ALPHA, B_CONDITION};
use log::info;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

// Intercepts and condition effects expressed relative to a baseline condition.
pub struct Rebaselined {
    pub baseline: usize,
    // [ndraws, ngenes]
    pub new_alpha: Array2<f64>,
    // [ndraws, ngenes, nconditions], zero at the baseline condition
    pub new_beta: Array3<f64>,
}

// Pick the baseline condition by index or, failing that, by name.
pub fn resolve_baseline(
    conditions: &Lookup,
    name: Option<&str>,
    index: Option<usize>,
) -> Result<usize> {
    match (index, name) {
        (Some(index), _) if index < conditions.len() => Ok(index),
        (Some(index), _) => Err(Error::MissingBaseline(index.to_string())),
        (None, Some(name)) => conditions
            .index_of(name)
            .ok_or_else(|| Error::MissingBaseline(name.to_string())),
        (None, None) => Err(Error::InvalidConfig(
            "a baseline condition name or index is required".to_string(),
        )),
    }
}

// new_alpha = alpha + b[.., .., baseline]
// new_beta  = b - b[.., .., baseline]
//
// Always computed from the sampled `b_condition`, so choosing a different
// baseline is just another call.
pub fn rebaseline(
    alpha: ArrayView2<f64>,
    b_condition: ArrayView3<f64>,
    baseline: usize,
) -> Result<Rebaselined> {
    let (ndraws, ngenes, nconditions) = b_condition.dim();
    if alpha.dim() != (ndraws, ngenes) {
        return Err(Error::ShapeMismatch {
            context: "alpha".to_string(),
            expected: vec![ndraws, ngenes],
            got: alpha.shape().to_vec(),
        });
    }
    if baseline >= nconditions {
        return Err(Error::MissingBaseline(baseline.to_string()));
    }

    let base = b_condition.slice(s![.., .., baseline..baseline + 1]);

    let mut new_alpha = Array2::zeros((ndraws, ngenes));
    Zip::from(&mut new_alpha)
        .and(&alpha)
        .and(&base.index_axis(Axis(2), 0))
        .par_for_each(|y, &α, &b0| *y = α + b0);

    let mut new_beta = Array3::zeros((ndraws, ngenes, nconditions));
    Zip::from(&mut new_beta)
        .and(&b_condition)
        .and_broadcast(&base)
        .par_for_each(|y, &b, &b0| *y = b - b0);

    // exact even when the baseline effect is not finite
    new_beta.index_axis_mut(Axis(2), baseline).fill(0.0);

    Ok(Rebaselined {
        baseline,
        new_alpha,
        new_beta,
    })
}

pub fn rebaseline_draws(draws: &PosteriorDraws, baseline: usize) -> Result<Rebaselined> {
    info!("Reparameterizing condition effects relative to condition {}", baseline);
    rebaseline(draws.get2(ALPHA)?, draws.get3(B_CONDITION)?, baseline)
}
