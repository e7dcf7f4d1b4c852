//! Stable C ABI over the gradmc sampling core.
//!
//! The library is consumed through `dlopen` by host-language bridges: the
//! host registers log-density callbacks as C function pointers, pushes
//! variable values, and pulls samples one draw at a time. AD scalars cross
//! the boundary as the `Num` value type; the scalar math surface is
//! exposed as plain C functions so a host-side density can be built
//! entirely out of calls into this library.
//!
//! Contract violations (drawing before callbacks or variable values are
//! set) are caller errors and abort the process with a message; numerical
//! domain errors inside a density never cross the boundary — they reject
//! the draw instead.

#![allow(clippy::missing_safety_doc)]

use std::cell::RefCell;
use std::rc::Rc;
use std::slice;

use gradmc_core::hmc::{Hmc, HmcConfig};
use gradmc_core::lmc::{Lmc, LmcConfig};
use gradmc_core::model::{InterpolatedModel, Model};
use gradmc_core::nuts::{Nuts, NutsConfig};
use gradmc_core::t3::{T3, T3Config};
use gradmc_core::tape;

pub use gradmc_core::Num;

/// Plain log-density callback: receives the parameter vector.
pub type LogProbFn = unsafe extern "C" fn(*const f64) -> f64;
/// AD log-density callback: receives tape scalars, returns the root.
pub type LogProbAdFn = unsafe extern "C" fn(*const Num) -> Num;

pub const SAMPLER_LMC: i32 = 0;
pub const SAMPLER_NUTS: i32 = 1;
pub const SAMPLER_HMC: i32 = 2;

fn fatal(msg: &str) -> ! {
    eprintln!("libgradmc: {msg}");
    std::process::abort();
}

unsafe fn deref_hmc<'a>(s: *mut HmcSampler) -> &'a mut HmcSampler {
    if s.is_null() {
        fatal("null sampler handle");
    }
    unsafe { &mut *s }
}

unsafe fn deref_t3<'a>(s: *mut T3Sampler) -> &'a mut T3Sampler {
    if s.is_null() {
        fatal("null sampler handle");
    }
    unsafe { &mut *s }
}

enum Inner {
    Lmc(Lmc),
    Nuts(Rc<RefCell<Nuts>>),
    Hmc(Hmc),
}

/// Opaque sampler handle for the HMC family.
pub struct HmcSampler {
    kind: i32,
    steps: i32,
    alpha: f64,
    lp: Option<LogProbFn>,
    lp_ad: Option<LogProbAdFn>,
    inner: Option<Inner>,
}

fn build_model(n: usize, lp: Option<LogProbFn>, lp_ad: Option<LogProbAdFn>) -> Model {
    let mut model = Model::new(n);
    if let Some(f) = lp {
        model.set_logp(Box::new(move |x: &[f64]| unsafe { f(x.as_ptr()) }));
    }
    if let Some(f) = lp_ad {
        model.set_logp_ad(Box::new(move |x: &[Num]| unsafe { f(x.as_ptr()) }));
    }
    model
}

impl HmcSampler {
    fn inner_mut(&mut self) -> &mut Inner {
        match self.inner.as_mut() {
            Some(inner) => inner,
            None => fatal("sampler used before variable values were set"),
        }
    }

    fn num_params(&mut self) -> usize {
        match self.inner_mut() {
            Inner::Lmc(s) => s.params_r().len(),
            Inner::Nuts(s) => s.borrow().params_r().len(),
            Inner::Hmc(s) => s.params_r().len(),
        }
    }
}

/// Create a sampler of the given kind (0 = LMC, 1 = NUTS, 2 = fixed-step
/// HMC). `steps` is the trajectory length for HMC; `alpha` is the partial
/// momentum refreshment for LMC; each is ignored by the other kinds.
#[no_mangle]
pub extern "C" fn hmc_new(kind: i32, steps: i32, alpha: f64) -> *mut HmcSampler {
    if !(SAMPLER_LMC..=SAMPLER_HMC).contains(&kind) {
        fatal("unknown sampler kind");
    }
    Box::into_raw(Box::new(HmcSampler {
        kind,
        steps,
        alpha,
        lp: None,
        lp_ad: None,
        inner: None,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn hmc_delete(s: *mut HmcSampler) {
    if !s.is_null() {
        drop(Box::from_raw(s));
    }
}

/// Register the log-density callbacks. Either may be null. NUTS and
/// fixed-step HMC require the AD variant; LMC can fall back to finite
/// differences over the plain one.
#[no_mangle]
pub unsafe extern "C" fn hmc_set_logprob(
    s: *mut HmcSampler,
    lp: Option<LogProbFn>,
    lp_ad: Option<LogProbAdFn>,
) {
    let s = deref_hmc(s);
    s.lp = lp;
    s.lp_ad = lp_ad;
}

/// Set the parameter vector. The first call initializes the sampler;
/// later calls replace the position and reset the inverse masses to 1.
#[no_mangle]
pub unsafe extern "C" fn hmc_set_variable_values(s: *mut HmcSampler, n: i32, vals: *const f64) {
    let s = deref_hmc(s);
    if s.lp.is_none() && s.lp_ad.is_none() {
        fatal("cannot set variable values before the log prob function has been set");
    }
    if s.kind != SAMPLER_LMC && s.lp_ad.is_none() {
        fatal("this sampler kind requires the AD log prob function");
    }
    if vals.is_null() || n < 0 {
        fatal("invalid variable value buffer");
    }
    let params = slice::from_raw_parts(vals, n as usize);

    match s.inner.as_mut() {
        None => {
            let model = build_model(params.len(), s.lp, s.lp_ad);
            let inner = match s.kind {
                SAMPLER_LMC => {
                    let cfg = LmcConfig { alpha: s.alpha, ..LmcConfig::default() };
                    match Lmc::new(model, params, cfg) {
                        Ok(sampler) => Inner::Lmc(sampler),
                        Err(e) => fatal(&e.to_string()),
                    }
                }
                SAMPLER_NUTS => match Nuts::new(model, params, NutsConfig::default()) {
                    Ok(sampler) => Inner::Nuts(Rc::new(RefCell::new(sampler))),
                    Err(e) => fatal(&e.to_string()),
                },
                _ => {
                    let cfg = HmcConfig { steps: s.steps.max(1) as usize, ..HmcConfig::default() };
                    match Hmc::new(model, params, cfg) {
                        Ok(sampler) => Inner::Hmc(sampler),
                        Err(e) => fatal(&e.to_string()),
                    }
                }
            };
            s.inner = Some(inner);
        }
        Some(Inner::Lmc(sampler)) => {
            sampler.set_params_r(params);
            sampler.reset_inv_masses(params.len());
        }
        Some(Inner::Nuts(sampler)) => {
            let mut sampler = sampler.borrow_mut();
            sampler.set_params_r(params);
            sampler.reset_inv_masses(params.len());
        }
        Some(Inner::Hmc(sampler)) => {
            sampler.set_params_r(params);
            sampler.reset_inv_masses(params.len());
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn hmc_set_inv_masses(s: *mut HmcSampler, inv_masses: *const f64) {
    let s = deref_hmc(s);
    if inv_masses.is_null() {
        fatal("null inverse mass buffer");
    }
    let n = s.num_params();
    let masses = slice::from_raw_parts(inv_masses, n);
    match s.inner_mut() {
        Inner::Lmc(sampler) => sampler.set_inv_masses(masses),
        Inner::Nuts(sampler) => sampler.borrow_mut().set_inv_masses(masses),
        Inner::Hmc(sampler) => sampler.set_inv_masses(masses),
    }
}

#[no_mangle]
pub unsafe extern "C" fn hmc_toggle_adaptation(s: *mut HmcSampler, flag: i32) {
    let s = deref_hmc(s);
    match s.inner_mut() {
        Inner::Lmc(sampler) => {
            if flag != 0 {
                sampler.adapt_on()
            } else {
                sampler.adapt_off()
            }
        }
        Inner::Nuts(sampler) => {
            let mut sampler = sampler.borrow_mut();
            if flag != 0 {
                sampler.adapt_on()
            } else {
                sampler.adapt_off()
            }
        }
        Inner::Hmc(sampler) => {
            if flag != 0 {
                sampler.adapt_on()
            } else {
                sampler.adapt_off()
            }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn hmc_recompute_logprob(s: *mut HmcSampler) {
    let s = deref_hmc(s);
    let result = match s.inner_mut() {
        Inner::Lmc(sampler) => sampler.recompute_log_prob(),
        Inner::Nuts(sampler) => sampler.borrow_mut().recompute_log_prob(),
        Inner::Hmc(sampler) => sampler.recompute_log_prob(),
    };
    if let Err(e) = result {
        fatal(&e.to_string());
    }
}

/// Advance the chain one draw. `vals` holds the current values on entry
/// and the new ones on exit. Returns 1 if any component changed — a
/// diagnostic signal, not a statistically exact acceptance flag.
#[no_mangle]
pub unsafe extern "C" fn hmc_next_sample(s: *mut HmcSampler, vals: *mut f64) -> i32 {
    let s = deref_hmc(s);
    if vals.is_null() {
        fatal("null variable value buffer");
    }
    let n = s.num_params();
    let sample = match s.inner_mut() {
        Inner::Lmc(sampler) => sampler.next(),
        Inner::Nuts(sampler) => sampler.borrow_mut().next(),
        Inner::Hmc(sampler) => sampler.next(),
    };

    let out = slice::from_raw_parts_mut(vals, n);
    let accepted = sample.params.iter().zip(out.iter()).any(|(a, b)| a != b);
    out.copy_from_slice(&sample.params);
    accepted as i32
}

/// Opaque handle for the trans-dimensional tempered-trajectory sampler.
pub struct T3Sampler {
    steps: i32,
    step_size: f64,
    global_temp_mult: f64,
    oracle: *mut HmcSampler,
    lp1: Option<LogProbAdFn>,
    lp2: Option<LogProbAdFn>,
    inner: Option<T3>,
}

/// Create a T3 sampler. `steps = -1` borrows the oracle's mean NUTS tree
/// depth; a non-positive `step_size` adapts (or rides the oracle's ε).
/// `oracle` may be null, or a NUTS handle created through [`hmc_new`].
#[no_mangle]
pub extern "C" fn t3_new(
    steps: i32,
    step_size: f64,
    global_temp_mult: f64,
    oracle: *mut HmcSampler,
) -> *mut T3Sampler {
    Box::into_raw(Box::new(T3Sampler {
        steps,
        step_size,
        global_temp_mult,
        oracle,
        lp1: None,
        lp2: None,
        inner: None,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn t3_delete(s: *mut T3Sampler) {
    if !s.is_null() {
        drop(Box::from_raw(s));
    }
}

#[no_mangle]
pub unsafe extern "C" fn t3_set_logprobs(
    s: *mut T3Sampler,
    lp1: Option<LogProbAdFn>,
    lp2: Option<LogProbAdFn>,
) {
    let s = deref_t3(s);
    s.lp1 = lp1;
    s.lp2 = lp2;
}

/// Run one trans-dimensional trajectory. `vals` holds the extended
/// parameter vector (old and new variables already appended); `old_idx`
/// and `new_idx` are disjoint index sets within it. Writes the moved
/// vector back into `vals` and returns the forward-minus-reverse kinetic
/// energy difference.
#[no_mangle]
pub unsafe extern "C" fn t3_next_sample(
    s: *mut T3Sampler,
    n: i32,
    vals: *mut f64,
    n_old: i32,
    old_idx: *const i32,
    n_new: i32,
    new_idx: *const i32,
) -> f64 {
    let s = deref_t3(s);
    if vals.is_null() || n < 0 {
        fatal("invalid variable value buffer");
    }
    let params = slice::from_raw_parts(vals, n as usize);
    let index_set = |ptr: *const i32, len: i32| -> Vec<usize> {
        if ptr.is_null() || len <= 0 {
            return Vec::new();
        }
        unsafe {
            slice::from_raw_parts(ptr, len as usize)
                .iter()
                .map(|&i| i as usize)
                .collect()
        }
    };
    let old_vars = index_set(old_idx, n_old);
    let new_vars = index_set(new_idx, n_new);

    if s.inner.is_none() {
        let (lp1, lp2) = match (s.lp1, s.lp2) {
            (Some(a), Some(b)) => (a, b),
            _ => fatal("cannot draw T3 samples before both log prob functions have been set"),
        };
        let mut model = InterpolatedModel::new(params.len());
        model.set_logp_fns(
            Box::new(move |x: &[Num]| unsafe { lp1(x.as_ptr()) }),
            Box::new(move |x: &[Num]| unsafe { lp2(x.as_ptr()) }),
        );

        let oracle = if s.oracle.is_null() {
            None
        } else {
            match (*s.oracle).inner.as_ref() {
                Some(Inner::Nuts(nuts)) => Some(nuts.clone()),
                _ => None,
            }
        };

        let cfg = T3Config {
            steps: s.steps,
            global_temp_mult: s.global_temp_mult,
            epsilon: s.step_size,
            epsilon_adapt: s.step_size <= 0.0,
            ..T3Config::default()
        };
        match T3::new(model, params, cfg, oracle) {
            Ok(sampler) => s.inner = Some(sampler),
            Err(e) => fatal(&e.to_string()),
        }
    } else if let Some(sampler) = s.inner.as_mut() {
        sampler.set_params_r(params);
        sampler.reset_inv_masses(params.len());
    }

    let sampler = match s.inner.as_mut() {
        Some(sampler) => sampler,
        None => fatal("T3 sampler failed to initialize"),
    };
    sampler.set_var_indices(&old_vars, &new_vars);
    let sample = sampler.next();

    let out = slice::from_raw_parts_mut(vals, n as usize);
    out.copy_from_slice(&sample.params);
    sample.value
}

// ── AD bridge ───────────────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn num_make(val: f64) -> Num {
    Num::new(val)
}

#[no_mangle]
pub extern "C" fn num_value(n: Num) -> f64 {
    n.value()
}

/// Back-propagate from `dep` and write d`dep`/d`indeps[i]` into `grad`.
#[no_mangle]
pub unsafe extern "C" fn gradient(dep: Num, numindeps: i32, indeps: *const Num, grad: *mut f64) {
    let indeps = slice::from_raw_parts(indeps, numindeps.max(0) as usize);
    let g = tape::gradient(dep, indeps);
    slice::from_raw_parts_mut(grad, indeps.len()).copy_from_slice(&g);
}

// Scalar math. Mixed `double` variants exist for the non-commutative
// operations; for the rest the host lifts constants with `num_make`.

#[no_mangle]
pub extern "C" fn num_add(a: Num, b: Num) -> Num {
    a + b
}

#[no_mangle]
pub extern "C" fn num_sub(a: Num, b: Num) -> Num {
    a - b
}

#[no_mangle]
pub extern "C" fn num_mul(a: Num, b: Num) -> Num {
    a * b
}

#[no_mangle]
pub extern "C" fn num_div(a: Num, b: Num) -> Num {
    a / b
}

#[no_mangle]
pub extern "C" fn num_neg(a: Num) -> Num {
    -a
}

#[no_mangle]
pub extern "C" fn num_add_dbl(a: Num, b: f64) -> Num {
    a + b
}

#[no_mangle]
pub extern "C" fn num_sub_dbl(a: Num, b: f64) -> Num {
    a - b
}

#[no_mangle]
pub extern "C" fn num_dbl_sub(a: f64, b: Num) -> Num {
    a - b
}

#[no_mangle]
pub extern "C" fn num_mul_dbl(a: Num, b: f64) -> Num {
    a * b
}

#[no_mangle]
pub extern "C" fn num_div_dbl(a: Num, b: f64) -> Num {
    a / b
}

#[no_mangle]
pub extern "C" fn num_dbl_div(a: f64, b: Num) -> Num {
    a / b
}

#[no_mangle]
pub extern "C" fn num_exp(a: Num) -> Num {
    a.exp()
}

#[no_mangle]
pub extern "C" fn num_log(a: Num) -> Num {
    a.ln()
}

#[no_mangle]
pub extern "C" fn num_sqrt(a: Num) -> Num {
    a.sqrt()
}

#[no_mangle]
pub extern "C" fn num_pow(a: Num, b: Num) -> Num {
    a.pow(b)
}

#[no_mangle]
pub extern "C" fn num_pow_dbl(a: Num, b: f64) -> Num {
    a.powf(b)
}

#[no_mangle]
pub extern "C" fn num_sin(a: Num) -> Num {
    a.sin()
}

#[no_mangle]
pub extern "C" fn num_cos(a: Num) -> Num {
    a.cos()
}

#[no_mangle]
pub extern "C" fn num_tan(a: Num) -> Num {
    a.tan()
}

#[no_mangle]
pub extern "C" fn num_asin(a: Num) -> Num {
    a.asin()
}

#[no_mangle]
pub extern "C" fn num_acos(a: Num) -> Num {
    a.acos()
}

#[no_mangle]
pub extern "C" fn num_atan(a: Num) -> Num {
    a.atan()
}

#[no_mangle]
pub extern "C" fn num_atan2(a: Num, b: Num) -> Num {
    a.atan2(b)
}

#[no_mangle]
pub extern "C" fn num_sinh(a: Num) -> Num {
    a.sinh()
}

#[no_mangle]
pub extern "C" fn num_cosh(a: Num) -> Num {
    a.cosh()
}

#[no_mangle]
pub extern "C" fn num_tanh(a: Num) -> Num {
    a.tanh()
}

#[no_mangle]
pub extern "C" fn num_fabs(a: Num) -> Num {
    a.abs()
}

#[no_mangle]
pub extern "C" fn num_fmin(a: Num, b: Num) -> Num {
    a.min(b)
}

#[no_mangle]
pub extern "C" fn num_fmax(a: Num, b: Num) -> Num {
    a.max(b)
}

#[no_mangle]
pub extern "C" fn num_lt(a: Num, b: Num) -> i32 {
    (a < b) as i32
}

#[no_mangle]
pub extern "C" fn num_le(a: Num, b: Num) -> i32 {
    (a <= b) as i32
}

#[no_mangle]
pub extern "C" fn num_gt(a: Num, b: Num) -> i32 {
    (a > b) as i32
}

#[no_mangle]
pub extern "C" fn num_ge(a: Num, b: Num) -> i32 {
    (a >= b) as i32
}

#[no_mangle]
pub extern "C" fn num_eq(a: Num, b: Num) -> i32 {
    (a == b) as i32
}

#[no_mangle]
pub extern "C" fn num_ne(a: Num, b: Num) -> i32 {
    (a != b) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn std_normal_ad(x: *const Num) -> Num {
        let x0 = *x;
        num_mul_dbl(num_mul(x0, x0), -0.5)
    }

    unsafe extern "C" fn shifted_normal_ad(x: *const Num) -> Num {
        let d = num_sub_dbl(*x, 5.0);
        num_mul_dbl(num_mul(d, d), -0.5)
    }

    #[test]
    fn num_math_round_trip() {
        tape::session(|| {
            let a = num_make(3.0);
            let b = num_make(4.0);
            assert_eq!(num_value(num_add(a, b)), 7.0);
            assert_eq!(num_value(num_mul(a, b)), 12.0);
            assert_eq!(num_value(num_dbl_sub(10.0, a)), 7.0);
            assert_eq!(num_value(num_fmax(a, b)), 4.0);
            assert_eq!(num_lt(a, b), 1);
            assert_eq!(num_ge(a, b), 0);
        });
    }

    #[test]
    fn gradient_through_c_surface() {
        tape::session(|| unsafe {
            let x = num_make(1.5);
            let y = num_make(-2.0);
            // f = x*y + exp(x)
            let f = num_add(num_mul(x, y), num_exp(x));
            let indeps = [x, y];
            let mut grad = [0.0f64; 2];
            gradient(f, 2, indeps.as_ptr(), grad.as_mut_ptr());
            assert!((grad[0] - (-2.0 + 1.5f64.exp())).abs() < 1e-12);
            assert!((grad[1] - 1.5).abs() < 1e-12);
        });
    }

    #[test]
    fn sampler_handle_lifecycle() {
        unsafe {
            let s = hmc_new(SAMPLER_NUTS, 0, 0.0);
            hmc_set_logprob(s, None, Some(std_normal_ad));
            let mut vals = [0.5f64];
            hmc_set_variable_values(s, 1, vals.as_ptr());

            let mut changed = 0;
            for _ in 0..200 {
                changed += hmc_next_sample(s, vals.as_mut_ptr());
                assert!(vals[0].is_finite());
            }
            assert!(changed > 0, "chain never moved");

            hmc_toggle_adaptation(s, 0);
            hmc_recompute_logprob(s);
            let inv = [1.0f64];
            hmc_set_inv_masses(s, inv.as_ptr());
            hmc_next_sample(s, vals.as_mut_ptr());
            hmc_delete(s);
        }
    }

    #[test]
    fn t3_handle_reports_finite_ke_diff() {
        unsafe {
            let t3 = t3_new(50, 0.1, 1.0, std::ptr::null_mut());
            t3_set_logprobs(t3, Some(std_normal_ad), Some(shifted_normal_ad));

            let mut vals = [0.0f64];
            let old_idx: [i32; 0] = [];
            let new_idx: [i32; 0] = [];
            let ke_diff = t3_next_sample(
                t3,
                1,
                vals.as_mut_ptr(),
                0,
                old_idx.as_ptr(),
                0,
                new_idx.as_ptr(),
            );
            assert!(ke_diff.is_finite());
            assert!(vals[0].is_finite());
            t3_delete(t3);
        }
    }

    #[test]
    fn lmc_and_hmc_kinds_construct() {
        unsafe {
            let lmc = hmc_new(SAMPLER_LMC, 0, 0.5);
            hmc_set_logprob(lmc, None, Some(std_normal_ad));
            let mut vals = [0.0f64];
            hmc_set_variable_values(lmc, 1, vals.as_ptr());
            hmc_next_sample(lmc, vals.as_mut_ptr());
            hmc_delete(lmc);

            let hmc = hmc_new(SAMPLER_HMC, 10, 0.0);
            hmc_set_logprob(hmc, None, Some(std_normal_ad));
            let mut vals = [0.0f64];
            hmc_set_variable_values(hmc, 1, vals.as_ptr());
            hmc_next_sample(hmc, vals.as_mut_ptr());
            hmc_delete(hmc);
        }
    }
}
