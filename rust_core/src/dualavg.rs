//! Dual-averaging step-size adaptation (Nesterov 2009, as used by Stan).
//!
//! [`DualAveraging`] is the bare primal-dual recursion; [`StepSizeAdapter`]
//! wraps it with the pieces every sampler shares: the adaptation toggle,
//! the per-draw ε jitter applied once adaptation is off, and a running
//! mean of the acceptance statistic.

use log::debug;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// The dual-averaging recursion tuning `log ε` toward a target acceptance
/// statistic `δ`:
///
/// ```text
/// H̄ ← (1 − 1/(t+t₀))·H̄ + (1/(t+t₀))·(δ − s)
/// log ε ← μ − √t/γ · H̄
/// log ε̄ ← t^(−κ)·log ε + (1 − t^(−κ))·log ε̄
/// ```
pub struct DualAveraging {
    delta: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    mu: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    step: u64,
}

impl DualAveraging {
    /// `mu_scale` positions the shrinkage target at `ln(mu_scale·ε₀)`;
    /// the HMC-family samplers use 1.0, NUTS uses 10.0 (larger steps are
    /// cheaper there).
    pub fn new(delta: f64, gamma: f64, eps0: f64, mu_scale: f64) -> Self {
        Self {
            delta,
            gamma,
            t0: 10.0,
            kappa: 0.75,
            mu: (mu_scale * eps0).ln(),
            log_eps: eps0.ln(),
            log_eps_bar: eps0.ln(),
            h_bar: 0.0,
            step: 0,
        }
    }

    /// Feed one acceptance statistic; returns the new ε.
    pub fn update(&mut self, accept_stat: f64) -> f64 {
        self.step += 1;
        let t = self.step as f64;
        let w = 1.0 / (t + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.delta - accept_stat);
        self.log_eps = self.mu - (t.sqrt() / self.gamma) * self.h_bar;
        let t_pow = t.powf(-self.kappa);
        self.log_eps_bar = t_pow * self.log_eps + (1.0 - t_pow) * self.log_eps_bar;
        self.log_eps.exp()
    }

    /// ε from the last update.
    pub fn current(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed ε̄ — the value to freeze once adaptation ends.
    pub fn adapted(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Step-size state shared by all samplers: current ε, last-used ε, the
/// dual-averaging recursion, and the running mean acceptance statistic.
pub struct StepSizeAdapter {
    pub epsilon: f64,
    pub epsilon_last: f64,
    epsilon_pm: f64,
    adapting: bool,
    da: DualAveraging,
    mean_stat: f64,
    n_steps: u64,
}

impl StepSizeAdapter {
    pub fn new(
        eps0: f64,
        mu_scale: f64,
        delta: f64,
        gamma: f64,
        epsilon_pm: f64,
        adapt: bool,
    ) -> Self {
        Self {
            epsilon: eps0,
            epsilon_last: eps0,
            epsilon_pm,
            adapting: adapt,
            da: DualAveraging::new(delta, gamma, eps0, mu_scale),
            mean_stat: 0.0,
            n_steps: 0,
        }
    }

    pub fn adapting(&self) -> bool {
        self.adapting
    }

    pub fn adapt_on(&mut self) {
        self.adapting = true;
    }

    pub fn adapt_off(&mut self) {
        self.adapting = false;
        debug!("step-size adaptation off at epsilon = {}", self.epsilon);
    }

    /// ε for this draw: the current value, jittered uniformly in
    /// `ε·(1 ± ε_pm)` once adaptation is off. Records `epsilon_last`.
    pub fn draw_epsilon(&mut self, rng: &mut ChaCha8Rng) -> f64 {
        let mut eps = self.epsilon;
        if !self.adapting && self.epsilon_pm > 0.0 {
            let low = eps * (1.0 - self.epsilon_pm);
            let high = eps * (1.0 + self.epsilon_pm);
            eps = low + (high - low) * rng.gen::<f64>();
        }
        self.epsilon_last = eps;
        eps
    }

    /// Feed the draw's acceptance statistic. NaN counts as 0. Only moves
    /// ε while adaptation is on; the running mean updates regardless.
    pub fn update(&mut self, accept_stat: f64) {
        let s = if accept_stat.is_nan() { 0.0 } else { accept_stat };
        if self.adapting {
            self.epsilon = self.da.update(s);
        }
        self.n_steps += 1;
        let eta = 1.0 / self.n_steps as f64;
        self.mean_stat = (1.0 - eta) * self.mean_stat + eta * s;
    }

    /// Running mean of the acceptance statistic over all draws.
    pub fn mean_stat(&self) -> f64 {
        self.mean_stat
    }

    /// Smoothed dual-averaging ε̄.
    pub fn adapted_epsilon(&self) -> f64 {
        self.da.adapted()
    }
}
