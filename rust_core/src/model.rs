//! Probability model adapters.
//!
//! A [`Model`] wraps user-supplied log-density callbacks (plain `f64` and/or
//! AD-returning) behind a uniform interface: `log_prob`, `log_prob_ad`, and
//! `grad_log_prob`. The gradient path pushes one AD leaf per parameter
//! inside a tape session, evaluates the AD callback, back-propagates, and
//! reads the leaves' adjoints — the session reclaims all tape storage on
//! exit.
//!
//! [`InterpolatedModel`] is the two-density variant driven by the T3
//! sampler: it evaluates `T·((1−α)·lp1 + α·lp2)` and exposes `α` and the
//! global temperature `T` as mutable knobs.

use crate::error::{Error, Result};
use crate::tape::{self, Num};

/// Plain log-density callback.
pub type LogpFn = Box<dyn Fn(&[f64]) -> f64>;
/// AD log-density callback; evaluated against tape leaves.
pub type LogpAdFn = Box<dyn Fn(&[Num]) -> Num>;

/// Shared gradient interface between the model adapters and the
/// integrator/samplers.
pub trait LogProbGrad {
    fn num_params_r(&self) -> usize;

    /// Evaluate `(logp, ∇logp)` at `x`. A NaN log-density maps to
    /// [`Error::Domain`].
    fn grad_log_prob(&self, x: &[f64]) -> Result<(f64, Vec<f64>)>;
}

/// Single-density model over a resizable real parameter vector.
pub struct Model {
    n_params_r: usize,
    lp: Option<LogpFn>,
    lp_ad: Option<LogpAdFn>,
}

impl Model {
    pub fn new(n_params_r: usize) -> Self {
        Self { n_params_r, lp: None, lp_ad: None }
    }

    /// Convenience constructor for the common AD-only case.
    pub fn from_logp_ad(n_params_r: usize, f: impl Fn(&[Num]) -> Num + 'static) -> Self {
        let mut m = Self::new(n_params_r);
        m.set_logp_ad(Box::new(f));
        m
    }

    pub fn set_logp(&mut self, f: LogpFn) {
        self.lp = Some(f);
    }

    pub fn set_logp_ad(&mut self, f: LogpAdFn) {
        self.lp_ad = Some(f);
    }

    pub fn has_logp_ad(&self) -> bool {
        self.lp_ad.is_some()
    }

    /// True when some gradient path exists: the AD callback, or the plain
    /// callback through central finite differences.
    pub fn has_gradient(&self) -> bool {
        self.lp_ad.is_some() || self.lp.is_some()
    }

    pub fn set_num_params_r(&mut self, n: usize) {
        self.n_params_r = n;
    }

    /// Evaluate the log-density without gradients. Prefers the plain
    /// callback; falls back to the AD callback in a throwaway session.
    pub fn log_prob(&self, x: &[f64]) -> Result<f64> {
        if let Some(lp) = &self.lp {
            return Ok(lp(x));
        }
        let lp_ad = self
            .lp_ad
            .as_ref()
            .ok_or(Error::InvalidState("no log-density callback set"))?;
        Ok(tape::session(|| {
            let leaves: Vec<Num> = x.iter().map(|&v| Num::new(v)).collect();
            lp_ad(&leaves).value()
        }))
    }

    /// Evaluate the AD callback against caller-supplied tape scalars.
    pub fn log_prob_ad(&self, x: &[Num]) -> Result<Num> {
        let lp_ad = self
            .lp_ad
            .as_ref()
            .ok_or(Error::InvalidState("AD log-density callback not set"))?;
        Ok(lp_ad(x))
    }
}

impl LogProbGrad for Model {
    fn num_params_r(&self) -> usize {
        self.n_params_r
    }

    /// Reverse-mode gradient when the AD callback is present; central
    /// finite differences over the plain callback otherwise.
    fn grad_log_prob(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        if let Some(lp_ad) = &self.lp_ad {
            return tape::session(|| {
                let leaves: Vec<Num> = x.iter().map(|&v| Num::new(v)).collect();
                let root = lp_ad(&leaves);
                let lp = root.value();
                if lp.is_nan() {
                    return Err(Error::Domain);
                }
                let grad = tape::gradient(root, &leaves);
                Ok((lp, grad))
            });
        }

        let lp_fn = self
            .lp
            .as_ref()
            .ok_or(Error::InvalidState("no log-density callback set"))?;
        let lp = lp_fn(x);
        if lp.is_nan() {
            return Err(Error::Domain);
        }
        let h = 1e-6;
        let mut probe = x.to_vec();
        let mut grad = Vec::with_capacity(x.len());
        for i in 0..x.len() {
            probe[i] = x[i] + h;
            let up = lp_fn(&probe);
            probe[i] = x[i] - h;
            let down = lp_fn(&probe);
            probe[i] = x[i];
            grad.push((up - down) / (2.0 * h));
        }
        Ok((lp, grad))
    }
}

/// Two-density model interpolated by `α` and scaled by a global
/// temperature; the T3 sampler drives both between leapfrog steps.
pub struct InterpolatedModel {
    n_params_r: usize,
    lp1: Option<LogpAdFn>,
    lp2: Option<LogpAdFn>,
    alpha: f64,
    global_temp: f64,
}

impl InterpolatedModel {
    pub fn new(n_params_r: usize) -> Self {
        Self { n_params_r, lp1: None, lp2: None, alpha: 0.0, global_temp: 1.0 }
    }

    pub fn set_logp_fns(&mut self, lp1: LogpAdFn, lp2: LogpAdFn) {
        self.lp1 = Some(lp1);
        self.lp2 = Some(lp2);
    }

    pub fn has_logp_fns(&self) -> bool {
        self.lp1.is_some() && self.lp2.is_some()
    }

    pub fn set_num_params_r(&mut self, n: usize) {
        self.n_params_r = n;
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn set_global_temp(&mut self, t: f64) {
        self.global_temp = t;
    }

    pub fn global_temp(&self) -> f64 {
        self.global_temp
    }

    /// `T·((1−α)·lp1(x) + α·lp2(x))` on the tape.
    pub fn log_prob_ad(&self, x: &[Num]) -> Result<Num> {
        let lp1 = self
            .lp1
            .as_ref()
            .ok_or(Error::InvalidState("interpolated log-density callbacks not set"))?;
        let lp2 = self
            .lp2
            .as_ref()
            .ok_or(Error::InvalidState("interpolated log-density callbacks not set"))?;
        let interp = (1.0 - self.alpha) * lp1(x) + self.alpha * lp2(x);
        Ok(self.global_temp * interp)
    }
}

impl LogProbGrad for InterpolatedModel {
    fn num_params_r(&self) -> usize {
        self.n_params_r
    }

    fn grad_log_prob(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        if !self.has_logp_fns() {
            return Err(Error::InvalidState("interpolated log-density callbacks not set"));
        }
        tape::session(|| {
            let leaves: Vec<Num> = x.iter().map(|&v| Num::new(v)).collect();
            let root = self.log_prob_ad(&leaves)?;
            let lp = root.value();
            if lp.is_nan() {
                return Err(Error::Domain);
            }
            let grad = tape::gradient(root, &leaves);
            Ok((lp, grad))
        })
    }
}
