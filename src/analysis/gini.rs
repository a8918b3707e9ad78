use ndarray::{Array2, ArrayView3, Axis, Zip};
use std::cell::RefCell;
use thread_local::ThreadLocal;

// Added to every value after shifting so an all-equal vector yields a Gini
// near 0 instead of 0/0. Results are approximate to within this constant.
pub const GINI_STABILIZER: f64 = 1e-7;

// Shift values so the minimum is zero, then add the stabilizing constant.
pub fn prep_for_gini(xs: &mut [f64]) {
    let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
    for x in xs.iter_mut() {
        *x = (*x - min) + GINI_STABILIZER;
    }
}

// Gini coefficient of values already sorted ascending.
pub fn gini_sorted(xs: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (i, &x) in xs.iter().enumerate() {
        let rank = (i + 1) as f64;
        weighted += (2.0 * rank - n - 1.0) * x;
        total += x;
    }
    weighted / (n * total)
}

// Gini coefficient of one gene's condition effects. Values are taken relative
// to their minimum, so signed inputs are allowed. `xs` is used as scratch.
pub fn gini(xs: &mut [f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    prep_for_gini(xs);
    xs.sort_unstable_by(f64::total_cmp);
    gini_sorted(xs)
}

// Gini of every gene in every draw. `new_beta` is [ndraws, ngenes, nconditions],
// the result [ndraws, ngenes].
pub fn gini_draws(new_beta: ArrayView3<f64>) -> Array2<f64> {
    let (ndraws, ngenes, _) = new_beta.dim();
    let mut out = Array2::zeros((ndraws, ngenes));
    let scratch: ThreadLocal<RefCell<Vec<f64>>> = ThreadLocal::new();

    Zip::from(&mut out)
        .and(new_beta.lanes(Axis(2)))
        .par_for_each(|g, effects| {
            let mut buf = scratch.get_or(|| RefCell::new(Vec::new())).borrow_mut();
            buf.clear();
            buf.extend(effects.iter().copied());
            *g = gini(&mut buf);
        });

    out
}
