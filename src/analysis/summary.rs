use crate::error::{Error, Result};
use ndarray::{ArrayView1, ArrayView2, ArrayView3, Axis, Zip};

// One (entity, category) row of a long-form posterior summary. Two
// dimensional inputs have a single category, 0.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryRow {
    pub entity: usize,
    pub category: usize,
    pub mean_val: f64,
    pub lower_cl: f64,
    pub upper_cl: f64,
}

// Highest posterior density interval of sorted draws: the narrowest window
// spanning floor(prob * n) consecutive gaps. Ties go to the leftmost window.
pub fn hpdi(sorted: &[f64], prob: f64) -> (f64, f64) {
    let n = sorted.len();
    let len = ((prob * n as f64) as usize).min(n.saturating_sub(1));

    let mut best = 0;
    let mut best_width = f64::INFINITY;
    for start in 0..n - len {
        let width = sorted[start + len] - sorted[start];
        if width < best_width {
            best_width = width;
            best = start;
        }
    }
    (sorted[best], sorted[best + len])
}

// Mean and interval of one (entity, category) series of draws. The interval is
// widened to include the mean, which it can miss for strongly skewed draws.
fn summarize_lane(draws: ArrayView1<f64>, prob: f64) -> (f64, f64, f64) {
    let mut sorted = draws.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let (lower, upper) = hpdi(&sorted, prob);

    // offset by the minimum so constant draws give back exactly that constant
    let x0 = sorted[0];
    let mean = x0 + sorted.iter().map(|x| x - x0).sum::<f64>() / sorted.len() as f64;

    (mean, lower.min(mean), upper.max(mean))
}

fn validate(ndraws: usize, prob: f64) -> Result<()> {
    if !(prob > 0.0 && prob < 1.0) {
        return Err(Error::InvalidConfig(format!(
            "credible interval mass must be in (0, 1), got {}",
            prob
        )));
    }
    if ndraws == 0 {
        return Err(Error::EmptyData);
    }
    Ok(())
}

// Summarize [ndraws, nentities, ncategories] draws into one row per
// (entity, category), entity-major.
pub fn summarize_draws3(draws: ArrayView3<f64>, prob: f64) -> Result<Vec<SummaryRow>> {
    validate(draws.shape()[0], prob)?;

    let stats = Zip::from(draws.lanes(Axis(0))).par_map_collect(|lane| summarize_lane(lane, prob));

    Ok(stats
        .indexed_iter()
        .map(|((entity, category), &(mean_val, lower_cl, upper_cl))| SummaryRow {
            entity,
            category,
            mean_val,
            lower_cl,
            upper_cl,
        })
        .collect())
}

// Summarize [ndraws, nentities] draws into one row per entity.
pub fn summarize_draws2(draws: ArrayView2<f64>, prob: f64) -> Result<Vec<SummaryRow>> {
    summarize_draws3(draws.insert_axis(Axis(2)), prob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_hpdi_picks_narrowest_window() {
        let sorted = [0.0, 1.0, 1.1, 1.2, 1.3, 5.0];
        // floor(0.5 * 6) = 3 gaps
        assert_eq!(hpdi(&sorted, 0.5), (1.0, 1.3));
        // floor(0.9 * 6) = 5 gaps covers everything
        assert_eq!(hpdi(&sorted, 0.9), (0.0, 5.0));
    }

    #[test]
    fn test_hpdi_single_draw() {
        assert_eq!(hpdi(&[2.0], 0.9), (2.0, 2.0));
    }

    #[test]
    fn test_constant_draws_collapse() {
        let draws = Array3::from_elem((7, 2, 3), 0.1);
        for row in summarize_draws3(draws.view(), 0.9).unwrap() {
            assert_eq!(row.mean_val, 0.1);
            assert_eq!(row.lower_cl, 0.1);
            assert_eq!(row.upper_cl, 0.1);
        }
    }

    #[test]
    fn test_mean_within_interval() {
        let mut rng = StdRng::seed_from_u64(17);
        // heavily skewed draws
        let draws = Array3::from_shape_fn((50, 4, 3), |_| {
            let u: f64 = rng.random();
            (1.0 / (u + 1e-3)).powi(2)
        });
        for prob in [0.05, 0.5, 0.9, 0.99] {
            for row in summarize_draws3(draws.view(), prob).unwrap() {
                assert!(row.lower_cl <= row.mean_val, "{:?}", row);
                assert!(row.mean_val <= row.upper_cl, "{:?}", row);
            }
        }
    }

    #[test]
    fn test_long_form_layout() {
        let draws = array![
            [[1.0, 10.0], [100.0, 1000.0], [5.0, 50.0]],
            [[3.0, 30.0], [300.0, 3000.0], [7.0, 70.0]]
        ];
        let rows = summarize_draws3(draws.view(), 0.9).unwrap();
        assert_eq!(rows.len(), 6);
        let keys: Vec<(usize, usize)> = rows.iter().map(|r| (r.entity, r.category)).collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
        assert_eq!(rows[3].mean_val, 2000.0);
        assert_eq!((rows[3].lower_cl, rows[3].upper_cl), (1000.0, 3000.0));
    }

    #[test]
    fn test_two_dimensional() {
        let draws = Array2::from_shape_fn((10, 3), |(d, e)| (d * (e + 1)) as f64);
        let rows = summarize_draws2(draws.view(), 0.8).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.category == 0));
        assert_eq!(rows[1].entity, 1);
        assert_eq!(rows[1].mean_val, 9.0);
    }

    #[test]
    fn test_invalid_inputs() {
        let draws = Array3::<f64>::zeros((5, 2, 2));
        assert!(summarize_draws3(draws.view(), 0.0).is_err());
        assert!(summarize_draws3(draws.view(), 1.0).is_err());
        let empty = Array3::<f64>::zeros((0, 2, 2));
        assert!(matches!(summarize_draws3(empty.view(), 0.9), Err(Error::EmptyData)));
    }
}
