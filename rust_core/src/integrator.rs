//! Leapfrog integration with a diagonal inverse-mass vector.
//!
//! Both variants mutate position, momentum, and gradient in place and
//! return the new log-probability. A domain error inside the model's
//! gradient evaluation is absorbed here: the log-probability becomes
//! `-inf` (collapsing the acceptance probability to zero) and the gradient
//! is left untouched.

use log::debug;

use crate::model::LogProbGrad;

/// One symplectic leapfrog step of size `epsilon`:
/// half-kick, drift through `inv_mass ⊙ m`, gradient refresh, half-kick.
pub fn leapfrog<M: LogProbGrad>(
    model: &M,
    inv_mass: &[f64],
    x: &mut [f64],
    m: &mut [f64],
    g: &mut [f64],
    epsilon: f64,
) -> f64 {
    for i in 0..m.len() {
        m[i] += 0.5 * epsilon * g[i];
    }
    for i in 0..x.len() {
        x[i] += epsilon * inv_mass[i] * m[i];
    }
    let logp = match model.grad_log_prob(x) {
        Ok((lp, grad)) => {
            g.copy_from_slice(&grad);
            lp
        }
        Err(e) => {
            debug!("leapfrog: {e}; substituting -inf log-probability");
            f64::NEG_INFINITY
        }
    };
    for i in 0..m.len() {
        m[i] += 0.5 * epsilon * g[i];
    }
    logp
}

/// Position within a tempered trajectory of `n_iters` steps.
enum TrajectoryCase {
    FirstHalf,
    Midpoint,
    SecondHalf,
}

fn trajectory_case(iter: usize, n_iters: usize) -> TrajectoryCase {
    if n_iters % 2 != 0 && iter == n_iters / 2 {
        TrajectoryCase::Midpoint
    } else if iter < n_iters / 2 {
        TrajectoryCase::FirstHalf
    } else {
        TrajectoryCase::SecondHalf
    }
}

/// Leapfrog step with per-half-kick momentum rescaling for tempered
/// trajectories: scale up by `sqrt_temp_mult` through the first half,
/// down by its inverse through the second half. At the midpoint of an
/// odd-length trajectory the two rescalings cancel.
#[allow(clippy::too_many_arguments)]
pub fn tempered_leapfrog<M: LogProbGrad>(
    model: &M,
    inv_mass: &[f64],
    x: &mut [f64],
    m: &mut [f64],
    g: &mut [f64],
    epsilon: f64,
    sqrt_temp_mult: f64,
    iter: usize,
    n_iters: usize,
) -> f64 {
    let tcase = trajectory_case(iter, n_iters);

    let mult = match tcase {
        TrajectoryCase::SecondHalf => 1.0 / sqrt_temp_mult,
        _ => sqrt_temp_mult,
    };
    for i in 0..m.len() {
        m[i] += 0.5 * epsilon * g[i];
        m[i] *= mult;
    }
    for i in 0..x.len() {
        x[i] += epsilon * inv_mass[i] * m[i];
    }
    let logp = match model.grad_log_prob(x) {
        Ok((lp, grad)) => {
            g.copy_from_slice(&grad);
            lp
        }
        Err(e) => {
            debug!("tempered leapfrog: {e}; substituting -inf log-probability");
            f64::NEG_INFINITY
        }
    };
    let mult = match tcase {
        TrajectoryCase::FirstHalf => sqrt_temp_mult,
        _ => 1.0 / sqrt_temp_mult,
    };
    for i in 0..m.len() {
        m[i] += 0.5 * epsilon * g[i];
        m[i] *= mult;
    }
    logp
}
