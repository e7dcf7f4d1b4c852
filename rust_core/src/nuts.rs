//! No-U-Turn Sampler (NUTS) — Hoffman & Gelman (2014), slice-sampling
//! formulation with a caller-supplied diagonal mass matrix.
//!
//!   - Recursive tree doubling: depth d extends the trajectory by 2^d
//!     leapfrog steps in a uniformly chosen direction
//!   - Slice variable u drawn per iteration; leaves with H > u are valid
//!   - U-turn criterion across the trajectory endpoints
//!   - Early stop when the energy error falls below a fixed bound
//!   - Max tree depth cap (default 10)

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::chain::{find_reasonable_epsilon, sample_momentum, ChainState, Sample};
use crate::dualavg::StepSizeAdapter;
use crate::error::{Error, Result};
use crate::integrator::leapfrog;
use crate::model::Model;

/// Stop tree growth immediately once `H - u` falls below this.
const MAX_CHANGE: f64 = -1000.0;

#[derive(Debug, Clone)]
pub struct NutsConfig {
    /// Maximum doubling depth; negative means unbounded.
    pub maxdepth: i32,
    /// Initial step size; non-positive means search for one.
    pub epsilon: f64,
    /// Uniform ε jitter once adaptation is off.
    pub epsilon_pm: f64,
    pub epsilon_adapt: bool,
    pub delta: f64,
    pub gamma: f64,
    pub seed: u64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            maxdepth: 10,
            epsilon: -1.0,
            epsilon_pm: 0.0,
            epsilon_adapt: true,
            delta: 0.6,
            gamma: 0.05,
            seed: 42,
        }
    }
}

/// Everything `build_tree` reports back up the recursion: the far
/// endpoints of the subtree, the selected candidate, and the statistics
/// that drive candidate selection and step-size adaptation.
struct Tree {
    x_minus: Vec<f64>,
    m_minus: Vec<f64>,
    g_minus: Vec<f64>,
    x_plus: Vec<f64>,
    m_plus: Vec<f64>,
    g_plus: Vec<f64>,
    x_new: Vec<f64>,
    g_new: Vec<f64>,
    logp_new: f64,
    n_valid: u64,
    criterion: bool,
    prob_sum: f64,
    n_considered: u64,
}

pub struct Nuts {
    model: Model,
    state: ChainState,
    step: StepSizeAdapter,
    rng: ChaCha8Rng,
    maxdepth: i32,
    /// Depth of the last draw's tree (-1 before any draw).
    last_depth: i32,
    depth_sum: u64,
    depth_draws: u64,
}

impl Nuts {
    pub fn new(mut model: Model, params_r: &[f64], cfg: NutsConfig) -> Result<Self> {
        if !model.has_logp_ad() {
            return Err(Error::InvalidState("NUTS requires an AD log-density callback"));
        }
        model.set_num_params_r(params_r.len());

        let mut state = ChainState::new(params_r.to_vec());
        state.ensure_fresh(&model);

        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let eps0 = if cfg.epsilon > 0.0 {
            cfg.epsilon
        } else {
            find_reasonable_epsilon(&model, &state, &mut rng)
        };
        // mu sits at 10·ε: NUTS is cheaper at larger step sizes
        let step = StepSizeAdapter::new(
            eps0,
            10.0,
            cfg.delta,
            cfg.gamma,
            cfg.epsilon_pm,
            cfg.epsilon_adapt,
        );

        Ok(Self {
            model,
            state,
            step,
            rng,
            maxdepth: cfg.maxdepth,
            last_depth: -1,
            depth_sum: 0,
            depth_draws: 0,
        })
    }

    pub fn next(&mut self) -> Sample {
        self.state.ensure_fresh(&self.model);

        let mut m_minus = sample_momentum(&mut self.rng, &self.state.inv_mass);
        let mut m_plus = m_minus.clone();
        // Log-joint of position and momentum; the kinetic term is the raw
        // momentum dot product.
        let h0 = -0.5 * dot_self(&m_minus) + self.state.logp;

        let mut g_minus = self.state.g.clone();
        let mut g_plus = self.state.g.clone();
        let mut x_minus = self.state.x.clone();
        let mut x_plus = self.state.x.clone();

        // Slice variable: valid leaves satisfy H > u.
        let u = self.rng.gen::<f64>().ln() + h0;
        let mut n_valid: u64 = 1;
        let mut criterion = true;

        let epsilon = self.step.draw_epsilon(&mut self.rng);

        let mut prob_sum = -1.0;
        let mut n_considered: u64 = 0;
        let mut depth = 0i32;

        while criterion && (self.maxdepth < 0 || depth < self.maxdepth) {
            let direction: f64 = if self.rng.gen::<f64>() > 0.5 { 1.0 } else { -1.0 };

            let tree = if direction < 0.0 {
                let t =
                    self.build_tree(&x_minus, &m_minus, &g_minus, u, direction, depth, h0, epsilon);
                x_minus = t.x_minus.clone();
                m_minus = t.m_minus.clone();
                g_minus = t.g_minus.clone();
                t
            } else {
                let t =
                    self.build_tree(&x_plus, &m_plus, &g_plus, u, direction, depth, h0, epsilon);
                x_plus = t.x_plus.clone();
                m_plus = t.m_plus.clone();
                g_plus = t.g_plus.clone();
                t
            };

            prob_sum = tree.prob_sum;
            n_considered = tree.n_considered;

            // The last doubling's results are unusable if its criterion failed.
            if !tree.criterion {
                break;
            }
            criterion = compute_criterion(&x_plus, &x_minus, &m_plus, &m_minus);

            // Metropolis-Hastings move into the new half-tree.
            if self.rng.gen::<f64>() < tree.n_valid as f64 / (1e-100 + n_valid as f64) {
                self.state.x = tree.x_new;
                self.state.g = tree.g_new;
                self.state.logp = tree.logp_new;
            }
            n_valid += tree.n_valid;
            depth += 1;
        }
        self.last_depth = depth;
        self.depth_sum += depth as u64;
        self.depth_draws += 1;

        let adapt_stat = prob_sum / n_considered as f64;
        self.step.update(adapt_stat);

        Sample { params: self.state.x.clone(), value: self.state.logp }
    }

    /// The core recursion: build a subtree of `depth` (2^depth leapfrog
    /// steps of size `direction·epsilon`) hanging off `(x, m, g)`.
    #[allow(clippy::too_many_arguments)]
    fn build_tree(
        &mut self,
        x: &[f64],
        m: &[f64],
        g: &[f64],
        u: f64,
        direction: f64,
        depth: i32,
        h0: f64,
        epsilon: f64,
    ) -> Tree {
        if depth == 0 {
            let mut x1 = x.to_vec();
            let mut m1 = m.to_vec();
            let mut g1 = g.to_vec();
            let logp_new = leapfrog(
                &self.model,
                &self.state.inv_mass,
                &mut x1,
                &mut m1,
                &mut g1,
                direction * epsilon,
            );
            let mut new_h = logp_new - 0.5 * dot_self(&m1);
            if new_h.is_nan() {
                new_h = f64::NEG_INFINITY;
            }
            return Tree {
                x_minus: x1.clone(),
                m_minus: m1.clone(),
                g_minus: g1.clone(),
                x_plus: x1.clone(),
                m_plus: m1.clone(),
                g_plus: g1.clone(),
                x_new: x1,
                g_new: g1,
                logp_new,
                n_valid: (new_h > u) as u64,
                criterion: new_h - u > MAX_CHANGE,
                prob_sum: (new_h - h0).exp().min(1.0),
                n_considered: 1,
            };
        }

        let mut first = self.build_tree(x, m, g, u, direction, depth - 1, h0, epsilon);
        if first.criterion {
            let second = if direction < 0.0 {
                self.build_tree(
                    &first.x_minus,
                    &first.m_minus,
                    &first.g_minus,
                    u,
                    direction,
                    depth - 1,
                    h0,
                    epsilon,
                )
            } else {
                self.build_tree(
                    &first.x_plus,
                    &first.m_plus,
                    &first.g_plus,
                    u,
                    direction,
                    depth - 1,
                    h0,
                    epsilon,
                )
            };

            // Merge: the second half extends the far side.
            if direction < 0.0 {
                first.x_minus = second.x_minus;
                first.m_minus = second.m_minus;
                first.g_minus = second.g_minus;
            } else {
                first.x_plus = second.x_plus;
                first.m_plus = second.m_plus;
                first.g_plus = second.g_plus;
            }

            let swap_prob = second.n_valid as f64 / (first.n_valid + second.n_valid) as f64;
            if self.rng.gen::<f64>() < swap_prob {
                first.x_new = second.x_new;
                first.g_new = second.g_new;
                first.logp_new = second.logp_new;
            }
            first.n_considered += second.n_considered;
            first.prob_sum += second.prob_sum;
            first.criterion &= second.criterion;
            first.n_valid += second.n_valid;

            first.criterion &=
                compute_criterion(&first.x_plus, &first.x_minus, &first.m_plus, &first.m_minus);
        }
        first
    }

    pub fn set_params_r(&mut self, x: &[f64]) {
        self.model.set_num_params_r(x.len());
        self.state.set_params_r(x);
    }

    pub fn set_inv_masses(&mut self, inv_masses: &[f64]) {
        self.state.set_inv_masses(inv_masses);
    }

    pub fn reset_inv_masses(&mut self, n: usize) {
        self.state.reset_inv_masses(n);
    }

    pub fn recompute_log_prob(&mut self) -> Result<()> {
        self.state.recompute_log_prob(&self.model)
    }

    pub fn adapt_on(&mut self) {
        self.step.adapt_on();
    }

    pub fn adapt_off(&mut self) {
        self.step.adapt_off();
    }

    pub fn epsilon(&self) -> f64 {
        self.step.epsilon
    }

    pub fn epsilon_last(&self) -> f64 {
        self.step.epsilon_last
    }

    pub fn mean_accept_stat(&self) -> f64 {
        self.step.mean_stat()
    }

    /// Smoothed dual-averaging step size ε̄.
    pub fn adapted_epsilon(&self) -> f64 {
        self.step.adapted_epsilon()
    }

    pub fn params_r(&self) -> &[f64] {
        &self.state.x
    }

    /// Tree depth of the most recent draw; -1 before any draw.
    pub fn last_depth(&self) -> i32 {
        self.last_depth
    }

    /// Mean tree depth over all draws so far (0 before any draw).
    pub fn mean_tree_depth(&self) -> f64 {
        if self.depth_draws == 0 {
            0.0
        } else {
            self.depth_sum as f64 / self.depth_draws as f64
        }
    }
}

/// No-U-turn test: keep doubling while the momentum at both trajectory
/// ends still points away from the other end.
fn compute_criterion(x_plus: &[f64], x_minus: &[f64], m_plus: &[f64], m_minus: &[f64]) -> bool {
    let mut dot_minus = 0.0;
    let mut dot_plus = 0.0;
    for i in 0..x_plus.len() {
        let dx = x_plus[i] - x_minus[i];
        dot_minus += dx * m_minus[i];
        dot_plus += dx * m_plus[i];
    }
    dot_minus > 0.0 && dot_plus > 0.0
}

fn dot_self(v: &[f64]) -> f64 {
    v.iter().map(|&a| a * a).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::Num;

    fn std_normal(n: usize) -> Model {
        Model::from_logp_ad(n, |x| {
            let mut ss = x[0] * x[0];
            for &xi in &x[1..] {
                ss = ss + xi * xi;
            }
            -0.5 * ss
        })
    }

    #[test]
    fn criterion_is_symmetric_under_endpoint_swap() {
        // Swapping (plus, minus) negates dx and swaps the momenta; the
        // conjunction of the two dot products is invariant.
        let x_plus = [1.0, 2.0];
        let x_minus = [-0.5, 0.25];
        let m_plus = [0.3, -0.1];
        let m_minus = [0.8, 0.4];

        let neg = |v: &[f64]| -> Vec<f64> { v.iter().map(|&a| -a).collect() };
        let forward = compute_criterion(&x_plus, &x_minus, &m_plus, &m_minus);
        let reversed = compute_criterion(&x_minus, &x_plus, &neg(&m_minus), &neg(&m_plus));
        assert_eq!(forward, reversed);
    }

    #[test]
    fn depth_never_exceeds_cap() {
        let mut nuts = Nuts::new(
            std_normal(1),
            &[0.0],
            NutsConfig {
                maxdepth: 4,
                epsilon: 0.001,
                epsilon_adapt: false,
                seed: 3,
                ..NutsConfig::default()
            },
        )
        .unwrap();
        for _ in 0..50 {
            nuts.next();
            assert!(nuts.last_depth() <= 4);
        }
    }

    #[test]
    fn domain_errors_do_not_crash_the_tree() {
        let model = Model::from_logp_ad(1, |x: &[Num]| x[0].ln());
        let mut nuts = Nuts::new(
            model,
            &[-1.0],
            NutsConfig { epsilon: 0.1, seed: 8, ..NutsConfig::default() },
        )
        .unwrap();
        for _ in 0..100 {
            let s = nuts.next();
            assert!(!s.params[0].is_nan());
        }
    }

    #[test]
    fn tracks_mean_tree_depth() {
        let mut nuts = Nuts::new(
            std_normal(1),
            &[0.5],
            NutsConfig { seed: 17, ..NutsConfig::default() },
        )
        .unwrap();
        assert_eq!(nuts.mean_tree_depth(), 0.0);
        for _ in 0..100 {
            nuts.next();
        }
        assert!(nuts.mean_tree_depth() > 0.0);
        assert!(nuts.last_depth() >= 0);
    }
}
