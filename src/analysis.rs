pub mod baseline;
pub mod gini;
pub mod summary;

use crate::error::Result;
use crate::posterior::{PosteriorDraws, NEW_ALPHA, NEW_BETA};
use baseline::rebaseline_draws;
use gini::gini_draws;
use log::info;
use ndarray::{Array2, Array3};
use summary::{summarize_draws2, summarize_draws3, SummaryRow};

// Everything derived from the posterior draws for one choice of baseline.
pub struct Analysis {
    pub baseline: usize,
    pub prob: f64,
    // [ndraws, ngenes]
    pub new_alpha: Array2<f64>,
    // [ndraws, ngenes, nconditions]
    pub new_beta: Array3<f64>,
    // [ndraws, ngenes]
    pub gini: Array2<f64>,
    // per (gene, condition) summary of `new_beta`
    pub effects: Vec<SummaryRow>,
    // per gene summary of `gini`
    pub gini_summary: Vec<SummaryRow>,
    // per gene summary of `new_alpha`
    pub intercepts: Vec<SummaryRow>,
}

impl Analysis {
    // Reparameterize, compute per-draw Gini coefficients, and summarize.
    pub fn run(draws: &PosteriorDraws, baseline: usize, prob: f64) -> Result<Analysis> {
        let rebaselined = rebaseline_draws(draws, baseline)?;

        info!("Computing Gini coefficients");
        let gini = gini_draws(rebaselined.new_beta.view());

        info!("Summarizing posterior with {:.0}% HPD intervals", 100.0 * prob);
        let effects = summarize_draws3(rebaselined.new_beta.view(), prob)?;
        let gini_summary = summarize_draws2(gini.view(), prob)?;
        let intercepts = summarize_draws2(rebaselined.new_alpha.view(), prob)?;

        Ok(Analysis {
            baseline,
            prob,
            new_alpha: rebaselined.new_alpha,
            new_beta: rebaselined.new_beta,
            gini,
            effects,
            gini_summary,
            intercepts,
        })
    }

    // A copy of the draws with the reparameterized arrays added.
    pub fn with_reparameterized(&self, draws: &PosteriorDraws) -> Result<PosteriorDraws> {
        let mut draws = draws.clone();
        draws.insert(NEW_ALPHA, self.new_alpha.clone().into_dyn())?;
        draws.insert(NEW_BETA, self.new_beta.clone().into_dyn())?;
        Ok(draws)
    }
}
