// No-U-Turn sampler with multinomial trajectory sampling, dual averaging of
// the step size, and windowed adaptation of a diagonal mass matrix.

use super::math::{log_sum_exp, randn};
use crate::error::{Error, Result};
use indicatif::ProgressBar;
use itertools::izip;
use log::{debug, trace};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// A differentiable log density over an unconstrained real vector.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    // Returns log p(q) up to a constant, writing ∇ log p(q) into `grad`.
    fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64;
}

// Energy error beyond which a trajectory is considered divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;

const MAX_INIT_ATTEMPTS: usize = 100;
const MAX_STEP_SIZE_SEARCH: usize = 100;

// Warmup schedule: fast initial buffer, doubling slow windows in which the mass
// matrix is estimated, then a fast terminal buffer.
const INIT_BUFFER: usize = 75;
const TERM_BUFFER: usize = 50;
const BASE_WINDOW: usize = 25;

#[derive(Clone, Copy, Debug)]
pub struct NutsConfig {
    pub max_treedepth: usize,
    pub target_accept: f64,
    // initial values are drawn uniformly from (-init_radius, init_radius)
    pub init_radius: f64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        NutsConfig {
            max_treedepth: 10,
            target_accept: 0.8,
            init_radius: 2.0,
        }
    }
}

impl NutsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_treedepth == 0 {
            return Err(Error::InvalidConfig("max tree depth must be at least 1".to_string()));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "target acceptance rate must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if !(self.init_radius > 0.0) {
            return Err(Error::InvalidConfig("init radius must be positive".to_string()));
        }
        Ok(())
    }
}

// Per-draw sampler statistics for one chain, post-warmup.
#[derive(Clone, Debug, Default)]
pub struct ChainStats {
    pub divergent: Vec<bool>,
    pub tree_depth: Vec<usize>,
    pub accept_stat: Vec<f64>,
    pub n_leapfrog: Vec<usize>,
    pub energy: Vec<f64>,
    pub warmup_divergences: usize,
    pub step_size: f64,
    pub inv_mass: Vec<f64>,
    pub max_treedepth: usize,
}

impl ChainStats {
    pub fn ndivergent(&self) -> usize {
        self.divergent.iter().filter(|&&d| d).count()
    }

    pub fn mean_accept_stat(&self) -> f64 {
        mean(&self.accept_stat)
    }

    pub fn mean_tree_depth(&self) -> f64 {
        self.tree_depth.iter().sum::<usize>() as f64 / self.tree_depth.len().max(1) as f64
    }

    pub fn n_max_treedepth(&self) -> usize {
        self.tree_depth.iter().filter(|&&d| d >= self.max_treedepth).count()
    }
}

pub struct ChainOutput {
    // [ndraws, dim] unconstrained draws
    pub draws: Array2<f64>,
    pub stats: ChainStats,
}

#[derive(Clone)]
struct Point {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl Point {
    fn kinetic(&self, inv_mass: &[f64]) -> f64 {
        0.5 * self
            .p
            .iter()
            .zip(inv_mass)
            .map(|(&p, &m)| p * p * m)
            .sum::<f64>()
    }

    fn hamiltonian(&self, inv_mass: &[f64]) -> f64 {
        -self.logp + self.kinetic(inv_mass)
    }

    fn resample_momentum(&mut self, inv_mass: &[f64], rng: &mut StdRng) {
        for (p, &m) in self.p.iter_mut().zip(inv_mass) {
            *p = randn(rng) / m.sqrt();
        }
    }
}

fn leapfrog<M: LogDensity>(model: &M, inv_mass: &[f64], point: &mut Point, ε: f64) {
    for (p, &g) in point.p.iter_mut().zip(&point.grad) {
        *p += 0.5 * ε * g;
    }
    for (q, &p, &m) in izip!(point.q.iter_mut(), &point.p, inv_mass) {
        *q += ε * m * p;
    }
    point.logp = model.logp_and_grad(&point.q, &mut point.grad);
    for (p, &g) in point.p.iter_mut().zip(&point.grad) {
        *p += 0.5 * ε * g;
    }
}

// No-U-turn criterion on the trajectory's end points.
fn is_turning(left: &Point, right: &Point, inv_mass: &[f64]) -> bool {
    let mut dot_left = 0.0;
    let mut dot_right = 0.0;
    for (&ql, &qr, &pl, &pr, &m) in izip!(&left.q, &right.q, &left.p, &right.p, inv_mass) {
        let dq = qr - ql;
        dot_left += dq * m * pl;
        dot_right += dq * m * pr;
    }
    dot_left < 0.0 || dot_right < 0.0
}

// Extra checks across the boundary of two adjacent subtrees about to be
// merged: from the start of the earlier one to the start of the later one, and
// from the end of the earlier one to the end of the later one. `new` was built
// from `old` in `direction`.
fn subtrees_turning(old: &Tree, new: &Tree, direction: f64, inv_mass: &[f64]) -> bool {
    let (first, second) = if direction > 0.0 { (old, new) } else { (new, old) };
    is_turning(&first.left, &second.left, inv_mass) || is_turning(&first.right, &second.right, inv_mass)
}

struct Tree {
    left: Point,
    right: Point,
    proposal: Point,
    log_sum_weight: f64,
    sum_accept_stat: f64,
    n_leapfrog: usize,
    divergent: bool,
    turning: bool,
}

impl Tree {
    fn leaf(point: Point, log_weight: f64, accept_stat: f64, divergent: bool) -> Tree {
        Tree {
            left: point.clone(),
            right: point.clone(),
            proposal: point,
            log_sum_weight: log_weight,
            sum_accept_stat: accept_stat,
            n_leapfrog: 1,
            divergent,
            turning: false,
        }
    }

    fn edge(&self, direction: f64) -> &Point {
        if direction > 0.0 {
            &self.right
        } else {
            &self.left
        }
    }

    fn set_edge(&mut self, direction: f64, point: Point) {
        if direction > 0.0 {
            self.right = point;
        } else {
            self.left = point;
        }
    }
}

struct Integrator<'a, M: LogDensity> {
    model: &'a M,
    inv_mass: &'a [f64],
    ε: f64,
    h0: f64,
}

impl<'a, M: LogDensity> Integrator<'a, M> {
    fn build_leaf(&self, start: &Point, direction: f64) -> Tree {
        let mut point = start.clone();
        leapfrog(self.model, self.inv_mass, &mut point, direction * self.ε);

        let mut energy_error = point.hamiltonian(self.inv_mass) - self.h0;
        if energy_error.is_nan() {
            energy_error = f64::INFINITY;
        }
        let divergent = energy_error > DIVERGENCE_THRESHOLD;
        let accept_stat = (-energy_error).exp().min(1.0);
        Tree::leaf(point, -energy_error, accept_stat, divergent)
    }

    fn build_tree(&self, start: &Point, depth: usize, direction: f64, rng: &mut StdRng) -> Tree {
        if depth == 0 {
            return self.build_leaf(start, direction);
        }

        let mut inner = self.build_tree(start, depth - 1, direction, rng);
        if inner.divergent || inner.turning {
            return inner;
        }

        let outer = self.build_tree(inner.edge(direction), depth - 1, direction, rng);
        inner.n_leapfrog += outer.n_leapfrog;
        inner.sum_accept_stat += outer.sum_accept_stat;
        if outer.divergent || outer.turning {
            inner.divergent |= outer.divergent;
            inner.turning |= outer.turning;
            return inner;
        }

        let spans_turning = subtrees_turning(&inner, &outer, direction, self.inv_mass);
        let log_sum_weight = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
        let accept_outer = rng.random::<f64>().ln() < outer.log_sum_weight - log_sum_weight;
        let Tree { left, right, proposal, .. } = outer;
        if accept_outer {
            inner.proposal = proposal;
        }
        inner.log_sum_weight = log_sum_weight;
        inner.set_edge(direction, if direction > 0.0 { right } else { left });
        inner.turning = spans_turning || is_turning(&inner.left, &inner.right, self.inv_mass);
        inner
    }
}

struct Transition {
    point: Point,
    accept_stat: f64,
    depth: usize,
    n_leapfrog: usize,
    divergent: bool,
    energy: f64,
}

fn transition<M: LogDensity>(
    model: &M,
    inv_mass: &[f64],
    ε: f64,
    max_treedepth: usize,
    current: &Point,
    rng: &mut StdRng,
) -> Transition {
    let mut start = current.clone();
    start.resample_momentum(inv_mass, rng);
    let h0 = start.hamiltonian(inv_mass);
    let integrator = Integrator { model, inv_mass, ε, h0 };

    let mut tree = Tree::leaf(start, 0.0, 0.0, false);
    tree.n_leapfrog = 0;
    let mut depth = 0;
    let mut divergent = false;

    while depth < max_treedepth {
        let direction = if rng.random::<bool>() { 1.0 } else { -1.0 };
        let subtree = integrator.build_tree(tree.edge(direction), depth, direction, rng);
        tree.n_leapfrog += subtree.n_leapfrog;
        tree.sum_accept_stat += subtree.sum_accept_stat;
        depth += 1;

        if subtree.divergent {
            divergent = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // biased progressive sampling favors the newer subtree
        let spans_turning = subtrees_turning(&tree, &subtree, direction, inv_mass);
        let accept_subtree =
            rng.random::<f64>().ln() < subtree.log_sum_weight - tree.log_sum_weight;
        tree.log_sum_weight = log_sum_exp(tree.log_sum_weight, subtree.log_sum_weight);
        let Tree { left, right, proposal, .. } = subtree;
        if accept_subtree {
            tree.proposal = proposal;
        }
        tree.set_edge(direction, if direction > 0.0 { right } else { left });

        if spans_turning || is_turning(&tree.left, &tree.right, inv_mass) {
            break;
        }
    }

    Transition {
        point: tree.proposal,
        accept_stat: tree.sum_accept_stat / tree.n_leapfrog.max(1) as f64,
        depth,
        n_leapfrog: tree.n_leapfrog,
        divergent,
        energy: h0,
    }
}

// Step size adaptation by dual averaging toward a target acceptance statistic.
struct DualAveraging {
    μ: f64,
    log_ε: f64,
    log_ε_bar: f64,
    h_bar: f64,
    t: f64,
    target: f64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(ε: f64, target: f64) -> DualAveraging {
        DualAveraging {
            μ: (10.0 * ε).ln(),
            log_ε: ε.ln(),
            log_ε_bar: 0.0,
            h_bar: 0.0,
            t: 0.0,
            target,
        }
    }

    fn update(&mut self, accept_stat: f64) {
        self.t += 1.0;
        let η = 1.0 / (self.t + Self::T0);
        self.h_bar = (1.0 - η) * self.h_bar + η * (self.target - accept_stat);
        self.log_ε = self.μ - self.t.sqrt() / Self::GAMMA * self.h_bar;
        let w = self.t.powf(-Self::KAPPA);
        self.log_ε_bar = w * self.log_ε + (1.0 - w) * self.log_ε_bar;
    }

    fn step_size(&self) -> f64 {
        self.log_ε.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.log_ε_bar.exp()
    }
}

// Welford accumulator for per-coordinate variance.
struct RunningVariance {
    n: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RunningVariance {
    fn new(dim: usize) -> RunningVariance {
        RunningVariance {
            n: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn push(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let δ = x - *mean;
            *mean += δ / n;
            *m2 += δ * (x - *mean);
        }
    }

    // Variance shrunk toward a small constant, as the window may be short.
    fn regularized(&self) -> Vec<f64> {
        let n = self.n as f64;
        self.m2
            .iter()
            .map(|&m2| {
                let var = m2 / (n - 1.0).max(1.0);
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }

    fn reset(&mut self) {
        self.n = 0;
        self.mean.iter_mut().for_each(|x| *x = 0.0);
        self.m2.iter_mut().for_each(|x| *x = 0.0);
    }
}

// Slow adaptation windows as [start, end) warmup iterations.
pub fn adaptation_windows(nwarmup: usize) -> Vec<(usize, usize)> {
    if nwarmup < 20 {
        return Vec::new();
    }
    let (mut init_buffer, mut term_buffer, mut base_window) = (INIT_BUFFER, TERM_BUFFER, BASE_WINDOW);
    if init_buffer + term_buffer + base_window > nwarmup {
        init_buffer = (0.15 * nwarmup as f64) as usize;
        term_buffer = (0.1 * nwarmup as f64) as usize;
        base_window = nwarmup - init_buffer - term_buffer;
    }

    let end_slow = nwarmup - term_buffer;
    let mut windows = Vec::new();
    let mut start = init_buffer;
    let mut size = base_window;
    while start < end_slow {
        let mut end = start + size;
        if end + 2 * size > end_slow {
            end = end_slow;
        }
        windows.push((start, end));
        start = end;
        size *= 2;
    }
    windows
}

fn find_reasonable_step_size<M: LogDensity>(
    model: &M,
    inv_mass: &[f64],
    current: &Point,
    ε0: f64,
    rng: &mut StdRng,
) -> f64 {
    let log_target = 0.8_f64.ln();
    let mut ε = ε0;
    let mut direction = 0.0;

    for _ in 0..MAX_STEP_SIZE_SEARCH {
        let mut point = current.clone();
        point.resample_momentum(inv_mass, rng);
        let h0 = point.hamiltonian(inv_mass);
        leapfrog(model, inv_mass, &mut point, ε);
        let mut δ = h0 - point.hamiltonian(inv_mass);
        if δ.is_nan() {
            δ = f64::NEG_INFINITY;
        }

        if direction == 0.0 {
            direction = if δ > log_target { 1.0 } else { -1.0 };
        } else if (direction > 0.0 && δ <= log_target) || (direction < 0.0 && δ >= log_target) {
            break;
        }

        ε = if direction > 0.0 { 2.0 * ε } else { 0.5 * ε };
        if !(1e-12..=1e7).contains(&ε) {
            break;
        }
    }
    ε.clamp(1e-12, 1e7)
}

fn initial_point<M: LogDensity>(model: &M, radius: f64, rng: &mut StdRng) -> Result<Point> {
    let dim = model.dim();
    let mut point = Point {
        q: vec![0.0; dim],
        p: vec![0.0; dim],
        grad: vec![0.0; dim],
        logp: f64::NEG_INFINITY,
    };

    for _ in 0..MAX_INIT_ATTEMPTS {
        for q in point.q.iter_mut() {
            *q = rng.random_range(-radius..radius);
        }
        point.logp = model.logp_and_grad(&point.q, &mut point.grad);
        if point.logp.is_finite() && point.grad.iter().all(|g| g.is_finite()) {
            return Ok(point);
        }
    }

    Err(Error::Sampler(format!(
        "no initial point with finite log density after {} attempts",
        MAX_INIT_ATTEMPTS
    )))
}

// Run one chain: `nwarmup` adaptation iterations followed by `ndraws` kept draws.
pub fn sample_chain<M: LogDensity>(
    model: &M,
    config: &NutsConfig,
    nwarmup: usize,
    ndraws: usize,
    seed: u64,
    progress: &ProgressBar,
) -> Result<ChainOutput> {
    config.validate()?;
    let dim = model.dim();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut current = initial_point(model, config.init_radius, &mut rng)?;
    let mut inv_mass = vec![1.0; dim];
    let mut ε = find_reasonable_step_size(model, &inv_mass, &current, 1.0, &mut rng);
    let mut dual = DualAveraging::new(ε, config.target_accept);
    trace!("seed {}: initial step size {:.3e}", seed, ε);

    let windows = adaptation_windows(nwarmup);
    let mut window = windows.iter().peekable();
    let mut variance = RunningVariance::new(dim);
    let mut stats = ChainStats {
        max_treedepth: config.max_treedepth,
        ..ChainStats::default()
    };

    for iter in 0..nwarmup {
        let t = transition(model, &inv_mass, ε, config.max_treedepth, &current, &mut rng);
        current = t.point;
        if t.divergent {
            stats.warmup_divergences += 1;
        }

        dual.update(t.accept_stat);
        ε = dual.step_size();

        if let Some(&&(start, end)) = window.peek() {
            if iter >= start && iter < end {
                variance.push(&current.q);
            }
            if iter + 1 == end {
                inv_mass = variance.regularized();
                variance.reset();
                window.next();
                ε = find_reasonable_step_size(model, &inv_mass, &current, ε, &mut rng);
                dual = DualAveraging::new(ε, config.target_accept);
                debug!(
                    "seed {}: updated mass matrix after warmup iteration {}, step size {:.3e}",
                    seed,
                    iter + 1,
                    ε
                );
            }
        }
        progress.inc(1);
    }

    if nwarmup > 0 {
        ε = dual.final_step_size();
    }
    if !ε.is_finite() || ε <= 0.0 {
        return Err(Error::Sampler(format!("step size adaptation failed (ε = {})", ε)));
    }
    stats.step_size = ε;

    let mut draws = Array2::zeros((ndraws, dim));
    for mut row in draws.rows_mut() {
        let t = transition(model, &inv_mass, ε, config.max_treedepth, &current, &mut rng);
        current = t.point;
        row.iter_mut().zip(&current.q).for_each(|(x, &q)| *x = q);

        stats.divergent.push(t.divergent);
        stats.tree_depth.push(t.depth);
        stats.accept_stat.push(t.accept_stat);
        stats.n_leapfrog.push(t.n_leapfrog);
        stats.energy.push(t.energy);
        progress.inc(1);
    }
    stats.inv_mass = inv_mass;

    Ok(ChainOutput { draws, stats })
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len().max(1) as f64
}
