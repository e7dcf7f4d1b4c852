//! State shared by every sampler: position, gradient, log-probability,
//! and the diagonal inverse-mass vector.
//!
//! Samplers compose a [`ChainState`] by value rather than inheriting from
//! a base class; the pieces that operate on it (momentum draws, the
//! initial step-size search) are free functions.

use log::warn;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::Result;
use crate::integrator::leapfrog;
use crate::model::LogProbGrad;

/// One draw from a sampler. `value` is the log-probability for the HMC
/// family and the forward-minus-reverse kinetic energy for T3.
#[derive(Debug, Clone)]
pub struct Sample {
    pub params: Vec<f64>,
    pub value: f64,
}

/// Position, cached gradient and log-probability, and per-parameter
/// inverse masses. `|x| = |g| = |inv_mass|` always holds.
pub struct ChainState {
    pub x: Vec<f64>,
    pub g: Vec<f64>,
    pub logp: f64,
    pub inv_mass: Vec<f64>,
    stale: bool,
}

impl ChainState {
    pub fn new(x: Vec<f64>) -> Self {
        let n = x.len();
        Self {
            x,
            g: vec![0.0; n],
            logp: f64::NEG_INFINITY,
            inv_mass: vec![1.0; n],
            stale: true,
        }
    }

    pub fn dim(&self) -> usize {
        self.x.len()
    }

    /// Replace the position. The cached `(logp, g)` become stale until
    /// [`recompute_log_prob`](Self::recompute_log_prob) or the next draw.
    pub fn set_params_r(&mut self, x: &[f64]) {
        self.x.clear();
        self.x.extend_from_slice(x);
        self.g.resize(x.len(), 0.0);
        self.inv_mass.resize(x.len(), 1.0);
        self.stale = true;
    }

    pub fn set_inv_masses(&mut self, inv_masses: &[f64]) {
        self.inv_mass.clear();
        self.inv_mass.extend_from_slice(inv_masses);
    }

    pub fn reset_inv_masses(&mut self, n: usize) {
        self.inv_mass.clear();
        self.inv_mass.resize(n, 1.0);
    }

    /// Re-evaluate `(logp, g)` at the current position.
    pub fn recompute_log_prob<M: LogProbGrad>(&mut self, model: &M) -> Result<()> {
        let (lp, g) = model.grad_log_prob(&self.x)?;
        self.logp = lp;
        self.g = g;
        self.stale = false;
        Ok(())
    }

    /// Refresh the cache if stale. A domain error at the current position
    /// leaves the chain with `logp = -inf` and a zero gradient, so every
    /// proposal from here is driven by momentum alone until one lands in
    /// the support.
    pub fn ensure_fresh<M: LogProbGrad>(&mut self, model: &M) {
        if !self.stale {
            return;
        }
        if let Err(e) = self.recompute_log_prob(model) {
            warn!("log-density at current position: {e}");
            self.logp = f64::NEG_INFINITY;
            self.g.iter_mut().for_each(|gi| *gi = 0.0);
            self.stale = false;
        }
    }
}

/// Draw a momentum vector, one `N(0,1)` variate per parameter scaled by
/// its inverse mass.
pub fn sample_momentum(rng: &mut ChaCha8Rng, inv_mass: &[f64]) -> Vec<f64> {
    inv_mass
        .iter()
        .map(|&im| {
            let z: f64 = StandardNormal.sample(rng);
            z * im
        })
        .collect()
}

/// Double/halve search for an initial step size: starting from ε = 1,
/// move ε by factors of two until the one-step acceptance ratio crosses
/// one half (Hoffman & Gelman 2014, Algorithm 4).
pub fn find_reasonable_epsilon<M: LogProbGrad>(
    model: &M,
    state: &ChainState,
    rng: &mut ChaCha8Rng,
) -> f64 {
    let m0 = sample_momentum(rng, &state.inv_mass);

    let h = |m: &[f64], logp: f64| -> f64 {
        let ke: f64 = m
            .iter()
            .zip(state.inv_mass.iter())
            .map(|(&mi, &im)| 0.5 * mi * mi / im)
            .sum();
        ke - logp
    };
    let h0 = h(&m0, state.logp);

    let try_step = |eps: f64| -> f64 {
        let mut x = state.x.clone();
        let mut m = m0.clone();
        let mut g = state.g.clone();
        let logp = leapfrog(model, &state.inv_mass, &mut x, &mut m, &mut g, eps);
        h0 - h(&m, logp)
    };

    let mut eps = 1.0;
    let half_log = (0.5f64).ln();
    let direction = if try_step(eps) > half_log { 1.0 } else { -1.0 };

    for _ in 0..50 {
        let log_ratio = try_step(eps);
        if !log_ratio.is_finite() {
            eps *= 0.5;
            break;
        }
        if direction > 0.0 && log_ratio < half_log {
            break;
        }
        if direction < 0.0 && log_ratio > half_log {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use rand::SeedableRng;

    fn std_normal_model(n: usize) -> Model {
        Model::from_logp_ad(n, |x| {
            let mut ss = x[0] * x[0];
            for &xi in &x[1..] {
                ss = ss + xi * xi;
            }
            -0.5 * ss
        })
    }

    #[test]
    fn set_params_marks_cache_stale_until_refreshed() {
        let model = std_normal_model(2);
        let mut state = ChainState::new(vec![0.0, 0.0]);
        state.ensure_fresh(&model);
        assert_eq!(state.logp, 0.0);

        state.set_params_r(&[1.0, 1.0]);
        state.ensure_fresh(&model);
        assert_eq!(state.logp, -1.0);
        assert_eq!(state.g, vec![-1.0, -1.0]);
    }

    #[test]
    fn ensure_fresh_survives_domain_errors() {
        let model = Model::from_logp_ad(1, |x| x[0].ln());
        let mut state = ChainState::new(vec![-1.0]);
        state.ensure_fresh(&model);
        assert_eq!(state.logp, f64::NEG_INFINITY);
        assert_eq!(state.g, vec![0.0]);
    }

    #[test]
    fn reasonable_epsilon_is_moderate_on_unit_normal() {
        let model = std_normal_model(2);
        let mut state = ChainState::new(vec![0.5, -0.5]);
        state.ensure_fresh(&model);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let eps = find_reasonable_epsilon(&model, &state, &mut rng);
        assert!(eps > 1e-3 && eps < 1e2, "unexpected epsilon {eps}");
    }

    #[test]
    fn momentum_scales_with_inv_mass() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let inv_mass = vec![0.0, 1.0];
        let m = sample_momentum(&mut rng, &inv_mass);
        assert_eq!(m[0], 0.0);
        assert!(m[1] != 0.0);
    }
}
