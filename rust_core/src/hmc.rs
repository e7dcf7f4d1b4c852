//! Fixed-trajectory HMC: a full momentum resample followed by a fixed
//! number of leapfrog steps and a Metropolis accept/reject test.
//!
//! The adaptive samplers are usually the better choice; this one exists
//! for callers that want a known, constant amount of work per draw.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::chain::{find_reasonable_epsilon, sample_momentum, ChainState, Sample};
use crate::dualavg::StepSizeAdapter;
use crate::error::{Error, Result};
use crate::integrator::leapfrog;
use crate::model::Model;

#[derive(Debug, Clone)]
pub struct HmcConfig {
    /// Leapfrog steps per draw.
    pub steps: usize,
    /// Initial step size; non-positive means search for one.
    pub epsilon: f64,
    /// Uniform ε jitter once adaptation is off.
    pub epsilon_pm: f64,
    pub epsilon_adapt: bool,
    pub delta: f64,
    pub gamma: f64,
    pub seed: u64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            epsilon: -1.0,
            epsilon_pm: 0.0,
            epsilon_adapt: true,
            delta: 0.65,
            gamma: 0.05,
            seed: 42,
        }
    }
}

pub struct Hmc {
    model: Model,
    state: ChainState,
    step: StepSizeAdapter,
    steps: usize,
    rng: ChaCha8Rng,
}

impl Hmc {
    pub fn new(mut model: Model, params_r: &[f64], cfg: HmcConfig) -> Result<Self> {
        if !model.has_logp_ad() {
            return Err(Error::InvalidState("HMC requires an AD log-density callback"));
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
        let step = StepSizeAdapter::new(
            eps0,
            1.0,
            cfg.delta,
            cfg.gamma,
            cfg.epsilon_pm,
            cfg.epsilon_adapt,
        );

        Ok(Self { model, state, step, steps: cfg.steps.max(1), rng })
    }

    pub fn next(&mut self) -> Sample {
        self.state.ensure_fresh(&self.model);
        let epsilon = self.step.draw_epsilon(&mut self.rng);

        let m = sample_momentum(&mut self.rng, &self.state.inv_mass);

        let kinetic = |m: &[f64], inv_mass: &[f64]| -> f64 {
            m.iter()
                .zip(inv_mass.iter())
                .map(|(&mi, &im)| mi * mi / im)
                .sum::<f64>()
                / 2.0
        };
        let h = kinetic(&m, &self.state.inv_mass) - self.state.logp;

        let mut x_new = self.state.x.clone();
        let mut m_new = m;
        let mut g_new = self.state.g.clone();
        let mut new_logp = self.state.logp;
        for _ in 0..self.steps {
            new_logp = leapfrog(
                &self.model,
                &self.state.inv_mass,
                &mut x_new,
                &mut m_new,
                &mut g_new,
                epsilon,
            );
        }
        for mi in m_new.iter_mut() {
            *mi = -*mi;
        }

        let h_new = kinetic(&m_new, &self.state.inv_mass) - new_logp;

        let accept_thresh = (h - h_new).exp();
        if self.rng.gen::<f64>() < accept_thresh {
            self.state.x = x_new;
            self.state.g = g_new;
            self.state.logp = new_logp;
        }

        let adapt_stat = if accept_thresh.is_nan() { f64::NAN } else { accept_thresh.min(1.0) };
        self.step.update(adapt_stat);

        Sample { params: self.state.x.clone(), value: self.state.logp }
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

    pub fn params_r(&self) -> &[f64] {
        &self.state.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_a_unit_normal_reasonably() {
        let model = Model::from_logp_ad(1, |x| -0.5 * (x[0] * x[0]));
        let mut hmc = Hmc::new(
            model,
            &[0.0],
            HmcConfig { steps: 10, seed: 4, ..HmcConfig::default() },
        )
        .unwrap();

        for _ in 0..500 {
            hmc.next();
        }
        hmc.adapt_off();

        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let n = 4000;
        for _ in 0..n {
            let s = hmc.next();
            sum += s.params[0];
            sum_sq += s.params[0] * s.params[0];
        }
        let mean = sum / n as f64;
        let var = sum_sq / n as f64 - mean * mean;
        assert!(mean.abs() < 0.15, "mean off: {mean}");
        assert!((var - 1.0).abs() < 0.3, "variance off: {var}");
    }
}
