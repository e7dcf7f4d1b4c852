//! Trans-dimensional tempered trajectories (T3).
//!
//! A fixed-length Hamiltonian trajectory over an α-interpolated pair of
//! densities. As α runs from 0 to 1 across the trajectory, per-parameter
//! inverse masses fade the outgoing variables out (`1−α`) and the
//! incoming ones in (`α`), while a global temperature multiplier heats
//! the model through the first half of the schedule and cools it back
//! down through the second.
//!
//! Unlike the HMC family, T3 does not accept or reject: the trajectory
//! always moves the state, and each draw reports the forward-minus-
//! reverse kinetic energy difference. The calling driver combines that
//! with its own log-density delta to form the actual accept/reject
//! decision for the trans-dimensional jump.

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::chain::{find_reasonable_epsilon, sample_momentum, ChainState, Sample};
use crate::dualavg::StepSizeAdapter;
use crate::error::{Error, Result};
use crate::integrator::leapfrog;
use crate::model::InterpolatedModel;
use crate::nuts::Nuts;

#[derive(Debug, Clone)]
pub struct T3Config {
    /// Leapfrog steps per trajectory; -1 borrows the oracle's mean NUTS
    /// tree depth.
    pub steps: i32,
    /// Global tempering multiplier applied per step (1.0 disables).
    pub global_temp_mult: f64,
    /// Initial step size; non-positive means adapt (or read the oracle).
    pub epsilon: f64,
    /// Uniform ε jitter once adaptation is off.
    pub epsilon_pm: f64,
    pub epsilon_adapt: bool,
    pub delta: f64,
    pub gamma: f64,
    pub seed: u64,
}

impl Default for T3Config {
    fn default() -> Self {
        Self {
            steps: 100,
            global_temp_mult: 1.0,
            epsilon: -1.0,
            epsilon_pm: 0.0,
            epsilon_adapt: true,
            delta: 0.65,
            gamma: 0.05,
            seed: 42,
        }
    }
}

pub struct T3 {
    model: InterpolatedModel,
    state: ChainState,
    step: StepSizeAdapter,
    steps: i32,
    global_temp_mult: f64,
    /// Read-only view of a NUTS sampler whose ε and mean tree depth this
    /// sampler may borrow. Never mutated from here.
    oracle: Option<Rc<RefCell<Nuts>>>,
    old_vars: Vec<usize>,
    new_vars: Vec<usize>,
    rng: ChaCha8Rng,
}

impl T3 {
    pub fn new(
        mut model: InterpolatedModel,
        params_r: &[f64],
        cfg: T3Config,
        oracle: Option<Rc<RefCell<Nuts>>>,
    ) -> Result<Self> {
        if !model.has_logp_fns() {
            return Err(Error::InvalidState("T3 requires both AD log-density callbacks"));
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

        Ok(Self {
            model,
            state,
            step,
            steps: cfg.steps,
            global_temp_mult: cfg.global_temp_mult,
            oracle,
            old_vars: Vec::new(),
            new_vars: Vec::new(),
            rng,
        })
    }

    /// Disjoint index sets of the fading-out and fading-in variables
    /// within the extended parameter vector.
    pub fn set_var_indices(&mut self, old_vars: &[usize], new_vars: &[usize]) {
        self.old_vars = old_vars.to_vec();
        self.new_vars = new_vars.to_vec();
    }

    /// Trajectory length for this draw; resolves the `-1` sentinel
    /// against the oracle's mean tree depth (2^d̄ leapfrog steps).
    fn trajectory_len(&self) -> usize {
        if self.steps > 0 {
            return self.steps as usize;
        }
        match &self.oracle {
            Some(oracle) => {
                let depth = oracle.borrow().mean_tree_depth().round();
                2f64.powf(depth).round().max(1.0) as usize
            }
            None => {
                warn!("T3 trajectory length is -1 but no oracle is set; using 1");
                1
            }
        }
    }

    pub fn next(&mut self) -> Sample {
        self.state.ensure_fresh(&self.model);

        // A non-adapting T3 with an oracle rides the oracle's step size.
        if !self.step.adapting() {
            if let Some(oracle) = &self.oracle {
                self.step.epsilon = oracle.borrow().epsilon();
            }
        }
        let epsilon = self.step.draw_epsilon(&mut self.rng);
        let l = self.trajectory_len();

        let mut m = sample_momentum(&mut self.rng, &self.state.inv_mass);

        // Kinetic energy multiplies by the inverse mass here; the HMC
        // kernels divide. The driver's acceptance rule expects this form.
        let kinetic = |m: &[f64], inv_mass: &[f64]| -> f64 {
            m.iter()
                .zip(inv_mass.iter())
                .map(|(&mi, &im)| mi * mi * im)
                .sum::<f64>()
                / 2.0
        };
        let fwd_kinetic = kinetic(&m, &self.state.inv_mass);
        let h = fwd_kinetic - self.state.logp;

        let mut global_temp = 1.0;
        let mut new_logp = self.state.logp;
        for i in 0..l {
            let alpha = if l == 1 { 0.0 } else { i as f64 / (l - 1) as f64 };
            self.model.set_alpha(alpha);

            for &j in &self.old_vars {
                self.state.inv_mass[j] = 1.0 - alpha;
            }
            for &j in &self.new_vars {
                self.state.inv_mass[j] = alpha;
            }

            if alpha <= 0.5 {
                global_temp *= self.global_temp_mult;
            } else {
                global_temp /= self.global_temp_mult;
            }
            self.model.set_global_temp(global_temp);

            new_logp = leapfrog(
                &self.model,
                &self.state.inv_mass,
                &mut self.state.x,
                &mut m,
                &mut self.state.g,
                epsilon,
            );
        }
        self.state.logp = new_logp;

        let rvs_kinetic = kinetic(&m, &self.state.inv_mass);
        let h_new = rvs_kinetic - new_logp;

        // Standard HMC acceptance as the adaptation proxy; T3 itself does
        // not accept or reject.
        let accept_thresh = (h - h_new).exp();
        let adapt_stat = if accept_thresh.is_nan() { f64::NAN } else { accept_thresh.min(1.0) };
        self.step.update(adapt_stat);

        Sample { params: self.state.x.clone(), value: fwd_kinetic - rvs_kinetic }
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

    pub fn params_r(&self) -> &[f64] {
        &self.state.x
    }

    pub fn inv_masses(&self) -> &[f64] {
        &self.state.inv_mass
    }

    pub fn model_mut(&mut self) -> &mut InterpolatedModel {
        &mut self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InterpolatedModel;
    use crate::nuts::NutsConfig;
    use crate::tape::Num;

    fn two_gaussians() -> InterpolatedModel {
        let mut model = InterpolatedModel::new(1);
        model.set_logp_fns(
            Box::new(|x: &[Num]| -0.5 * (x[0] * x[0])),
            Box::new(|x: &[Num]| {
                let d = x[0] - 5.0;
                -0.5 * (d * d)
            }),
        );
        model
    }

    #[test]
    fn ke_diff_is_finite_across_interpolation() {
        let mut t3 = T3::new(
            two_gaussians(),
            &[0.0],
            T3Config { steps: 50, epsilon: 0.1, epsilon_adapt: false, seed: 6, ..T3Config::default() },
            None,
        )
        .unwrap();
        let s = t3.next();
        assert!(s.value.is_finite(), "ke_diff not finite: {}", s.value);
        assert!(s.params[0].is_finite());
    }

    #[test]
    fn mass_interpolation_reaches_endpoints() {
        // two parameters: x[0] fades out, x[1] fades in
        let mut model = InterpolatedModel::new(2);
        model.set_logp_fns(
            Box::new(|x: &[Num]| -0.5 * (x[0] * x[0]) - 0.5 * (x[1] * x[1])),
            Box::new(|x: &[Num]| -0.5 * (x[0] * x[0]) - 0.5 * (x[1] * x[1])),
        );
        let mut t3 = T3::new(
            model,
            &[0.5, 0.5],
            T3Config { steps: 11, epsilon: 0.05, epsilon_adapt: false, seed: 13, ..T3Config::default() },
            None,
        )
        .unwrap();
        t3.set_var_indices(&[0], &[1]);
        t3.next();
        // after the final step alpha = 1
        assert_eq!(t3.inv_masses()[0], 0.0);
        assert_eq!(t3.inv_masses()[1], 1.0);
    }

    #[test]
    fn tempering_schedule_returns_to_unit_temperature() {
        let mut t3 = T3::new(
            two_gaussians(),
            &[0.0],
            T3Config {
                steps: 10,
                global_temp_mult: 1.2,
                epsilon: 0.05,
                epsilon_adapt: false,
                seed: 21,
                ..T3Config::default()
            },
            None,
        )
        .unwrap();
        t3.next();
        // 5 heating steps (alpha ≤ 0.5) and 5 cooling ones cancel exactly
        let t_end = t3.model_mut().global_temp();
        assert!((t_end - 1.0).abs() < 1e-12);
    }

    #[test]
    fn borrows_trajectory_length_from_oracle() {
        let model = crate::model::Model::from_logp_ad(1, |x| -0.5 * (x[0] * x[0]));
        let nuts = Nuts::new(model, &[0.0], NutsConfig { seed: 30, ..NutsConfig::default() }).unwrap();
        let oracle = Rc::new(RefCell::new(nuts));
        for _ in 0..20 {
            oracle.borrow_mut().next();
        }

        let mut t3 = T3::new(
            two_gaussians(),
            &[0.0],
            T3Config { steps: -1, epsilon: 0.1, epsilon_adapt: false, seed: 31, ..T3Config::default() },
            Some(oracle.clone()),
        )
        .unwrap();
        let expected = {
            let d = oracle.borrow().mean_tree_depth().round();
            2f64.powf(d).round().max(1.0) as usize
        };
        assert_eq!(t3.trajectory_len(), expected);
        let s = t3.next();
        assert!(s.value.is_finite());
    }
}
