pub mod diagnostics;
pub mod horseshoe;
pub mod math;
pub mod model;
pub mod nuts;
pub mod observations;

use crate::error::{Error, Result};
use crate::posterior::{PosteriorDraws, B_CONDITION, BETA_TILDE, C2_TILDE, LAMBDA, TAU_TILDE};
use diagnostics::SamplerDiagnostics;
use horseshoe::{finnish_horseshoe_draws, HorseshoeScale};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use model::HorseshoeModel;
use ndarray::{concatenate, Array1, Array3, ArrayView2, Axis};
use nuts::{sample_chain, ChainOutput, LogDensity, NutsConfig};
use observations::ExpressionData;
use rayon::prelude::*;

// Hyperparameters of the hierarchical model.
#[derive(Clone, Copy, Debug)]
pub struct ModelPriors {
    // normal prior on per-gene intercepts
    pub μ_α: f64,
    pub σ_α: f64,

    // slab degrees of freedom and scale
    pub slab_df: f64,
    pub slab_scale: f64,

    // prior guess at how many conditions have a non-negligible effect on a gene
    pub expected_large_effects: f64,

    // rate of the exponential prior on observation noise
    pub λ_σ: f64,
}

impl Default for ModelPriors {
    fn default() -> Self {
        ModelPriors {
            μ_α: 10.0,
            σ_α: 10.0,
            slab_df: 1.0,
            slab_scale: 1.0,
            expected_large_effects: 5.0,
            λ_σ: 1.0,
        }
    }
}

impl ModelPriors {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("alpha prior scale", self.σ_α),
            ("slab degrees of freedom", self.slab_df),
            ("slab scale", self.slab_scale),
            ("expected large effects", self.expected_large_effects),
            ("sigma prior rate", self.λ_σ),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(Error::InvalidConfig(format!("{} must be positive, got {}", name, value)));
            }
        }
        if !self.μ_α.is_finite() {
            return Err(Error::InvalidConfig("alpha prior mean must be finite".to_string()));
        }
        Ok(())
    }
}

// Run sizes and sampler settings.
#[derive(Clone, Debug)]
pub struct SamplerConfig {
    pub nwarmup: usize,
    pub ndraws: usize,
    pub nchains: usize,
    // chain k is seeded with seed + k
    pub seed: u64,
    pub nuts: NutsConfig,
    // keep beta_tilde, lambda, tau_tilde, c2_tilde alongside b_condition
    pub keep_auxiliary: bool,
    pub show_progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            nwarmup: 1000,
            ndraws: 500,
            nchains: 1,
            seed: 0,
            nuts: NutsConfig::default(),
            keep_auxiliary: false,
            show_progress: true,
        }
    }
}

pub struct Fit {
    pub draws: PosteriorDraws,
    pub diagnostics: SamplerDiagnostics,
    pub scale: HorseshoeScale,
}

fn progress_bar(total: u64, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} [{bar:40.cyan/blue}] {pos}/{len} {elapsed_precise} (eta {eta})",
    ) {
        progress.set_style(style);
    }
    progress.set_message("Sampling");
    progress
}

// Recompute `b_condition` for every draw from its sampled local and global
// shrinkage parameters.
pub fn predict_b_condition(scale: &HorseshoeScale, draws: &PosteriorDraws) -> Result<Array3<f64>> {
    finnish_horseshoe_draws(
        scale,
        draws.get3(TAU_TILDE)?,
        draws.get3(C2_TILDE)?,
        draws.get3(LAMBDA)?,
        draws.get3(BETA_TILDE)?,
    )
}

// Sample the posterior of the horseshoe regression model given the data.
//
// Chains run in parallel. Their draws are concatenated in chain order and each
// draw is labeled with its chain. Diagnostics are logged and returned but never
// cause failure.
pub fn sample_posterior(
    data: &ExpressionData,
    priors: ModelPriors,
    config: &SamplerConfig,
) -> Result<Fit> {
    if config.nchains == 0 || config.ndraws == 0 {
        return Err(Error::InvalidConfig(
            "at least one chain and one draw are required".to_string(),
        ));
    }
    config.nuts.validate()?;

    let model = HorseshoeModel::new(data, priors)?;
    info!(
        "Sampling {} chain(s) of {} warmup and {} draws over {} parameters",
        config.nchains,
        config.nwarmup,
        config.ndraws,
        model.dim()
    );

    let total = (config.nchains * (config.nwarmup + config.ndraws)) as u64;
    let progress = progress_bar(total, config.show_progress);
    let outputs = (0..config.nchains)
        .into_par_iter()
        .map(|k| {
            sample_chain(
                &model,
                &config.nuts,
                config.nwarmup,
                config.ndraws,
                config.seed.wrapping_add(k as u64),
                &progress,
            )
        })
        .collect::<Result<Vec<ChainOutput>>>()?;
    progress.finish_with_message("Sampling finished");

    let diagnostics = SamplerDiagnostics::from_chains(&outputs, |j| model.parameter_family(j));
    diagnostics.log_summary();

    let views: Vec<ArrayView2<f64>> = outputs.iter().map(|o| o.draws.view()).collect();
    let unconstrained = concatenate(Axis(0), &views)?;
    let chain = Array1::from_iter(
        (0..config.nchains as u32).flat_map(|k| std::iter::repeat(k).take(config.ndraws)),
    );

    let mut draws = PosteriorDraws::new(chain);
    for (name, values) in model.constrain_draws(unconstrained.view()) {
        draws.insert(name, values)?;
    }
    drop(unconstrained);

    let b_condition = predict_b_condition(&model.scale, &draws)?;
    draws.insert(B_CONDITION, b_condition.into_dyn())?;
    if !config.keep_auxiliary {
        draws.remove_auxiliary();
    }

    Ok(Fit {
        draws,
        diagnostics,
        scale: model.scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::{ALPHA, SIGMA};
    use crate::sampler::horseshoe::finnish_horseshoe;
    use crate::sampler::model::tests::toy_data;

    fn quick_config(nchains: usize, seed: u64) -> SamplerConfig {
        SamplerConfig {
            nwarmup: 150,
            ndraws: 40,
            nchains,
            seed,
            show_progress: false,
            ..SamplerConfig::default()
        }
    }

    fn priors() -> ModelPriors {
        ModelPriors {
            expected_large_effects: 1.0,
            ..ModelPriors::default()
        }
    }

    #[test]
    fn test_output_shapes() {
        let data = toy_data(3, 4, 3, 1);
        let fit = sample_posterior(&data, priors(), &quick_config(2, 0)).unwrap();
        let draws = &fit.draws;

        assert_eq!(draws.ndraws(), 80);
        assert_eq!(draws.nchains(), 2);
        assert_eq!(draws.chain()[39], 0);
        assert_eq!(draws.chain()[40], 1);
        assert_eq!(draws.get2(ALPHA).unwrap().shape(), &[80, 3]);
        assert_eq!(draws.get3(B_CONDITION).unwrap().shape(), &[80, 3, 4]);
        assert_eq!(draws.get1(SIGMA).unwrap().len(), 80);
        assert!(!draws.contains(LAMBDA));
        assert!(!draws.contains(TAU_TILDE));
        assert!(draws.get1(SIGMA).unwrap().iter().all(|&σ| σ > 0.0));
        assert_eq!(fit.diagnostics.chains.len(), 2);
    }

    #[test]
    fn test_b_condition_matches_transform() {
        let data = toy_data(2, 3, 3, 2);
        let config = SamplerConfig {
            keep_auxiliary: true,
            ..quick_config(1, 3)
        };
        let fit = sample_posterior(&data, priors(), &config).unwrap();
        let draws = &fit.draws;
        let b = draws.get3(B_CONDITION).unwrap();

        for d in [0, 17, 39] {
            let expected = finnish_horseshoe(
                &fit.scale,
                draws.get3(TAU_TILDE).unwrap().index_axis(Axis(0), d),
                draws.get3(C2_TILDE).unwrap().index_axis(Axis(0), d),
                draws.get3(LAMBDA).unwrap().index_axis(Axis(0), d),
                draws.get3(BETA_TILDE).unwrap().index_axis(Axis(0), d),
            )
            .unwrap();
            assert_eq!(b.index_axis(Axis(0), d), expected);
        }
    }

    #[test]
    fn test_reproducible_from_seed() {
        let data = toy_data(2, 3, 2, 4);
        let a = sample_posterior(&data, priors(), &quick_config(2, 11)).unwrap();
        let b = sample_posterior(&data, priors(), &quick_config(2, 11)).unwrap();
        assert_eq!(a.draws.get3(B_CONDITION).unwrap(), b.draws.get3(B_CONDITION).unwrap());
        assert_eq!(a.draws.get2(ALPHA).unwrap(), b.draws.get2(ALPHA).unwrap());
    }

    #[test]
    fn test_recovers_intercepts() {
        // gene g has mean 8 + g, plus an effect of 2 in condition 1 for gene 0
        let data = toy_data(2, 3, 4, 5);
        let config = SamplerConfig {
            nwarmup: 400,
            ndraws: 200,
            ..quick_config(1, 5)
        };
        let fit = sample_posterior(&data, priors(), &config).unwrap();
        let alpha = fit.draws.get2(ALPHA).unwrap();
        let b = fit.draws.get3(B_CONDITION).unwrap();

        // gene 1 has no effects, so its condition 0 mean is alpha + b
        let mean_fit = (0..200).map(|d| alpha[[d, 1]] + b[[d, 1, 0]]).sum::<f64>() / 200.0;
        assert!((mean_fit - 9.0).abs() < 0.5, "fitted mean {}", mean_fit);

        let effect = (0..200).map(|d| b[[d, 0, 1]] - b[[d, 0, 0]]).sum::<f64>() / 200.0;
        assert!((effect - 2.0).abs() < 1.0, "fitted effect {}", effect);
    }

    #[test]
    fn test_invalid_config() {
        let data = toy_data(2, 3, 2, 4);
        let config = SamplerConfig {
            nchains: 0,
            ..quick_config(1, 0)
        };
        assert!(sample_posterior(&data, priors(), &config).is_err());

        let bad_priors = ModelPriors {
            slab_scale: -1.0,
            ..priors()
        };
        assert!(sample_posterior(&data, bad_priors, &quick_config(1, 0)).is_err());
    }
}
