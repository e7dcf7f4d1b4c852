//! Tape-based reverse-mode automatic differentiation.
//!
//! A forward evaluation records every operation as a node on a thread-local,
//! append-only tape; [`gradient`] then seeds the root adjoint and sweeps the
//! tape once in reverse insertion order. Because the tape is append-only,
//! reverse insertion order *is* reverse topological order, so the backward
//! pass is a single linear scan — one forward + one backward pass per
//! gradient no matter how many inputs there are.
//!
//! # Example
//! ```
//! use gradmc_core::tape::{self, Num};
//!
//! let (val, grad) = tape::session(|| {
//!     let x = Num::new(3.0);
//!     let y = Num::new(5.0);
//!     let f = x * y + x.sqrt();
//!     (f.value(), tape::gradient(f, &[x, y]))
//! });
//! assert!((val - (15.0 + 3.0_f64.sqrt())).abs() < 1e-12);
//! assert!((grad[1] - 3.0).abs() < 1e-12); // df/dy = x
//! ```
//!
//! A `Num` is only meaningful on the thread and within the tape scope that
//! created it; see [`session`].

use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// AD scalar: a cached primal value plus the index of its node on the
/// thread-local tape.
///
/// `value()` never touches the tape; adjoints live on the tape only.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Num {
    idx: u32,
    val: f64,
}

/// Tape node. Local partial derivatives are stored inline so the backward
/// pass needs no re-evaluation of the forward math.
#[derive(Debug, Clone, Copy)]
enum Node {
    /// Independent variable (adjoint-eligible leaf).
    Leaf,
    Unary { arg: u32, partial: f64 },
    Binary { args: [u32; 2], partials: [f64; 2] },
}

#[derive(Default)]
struct Tape {
    nodes: Vec<Node>,
    adjoints: Vec<f64>,
}

thread_local! {
    static TAPE: RefCell<Tape> = RefCell::new(Tape::default());
}

fn push(node: Node) -> u32 {
    TAPE.with(|t| {
        let mut t = t.borrow_mut();
        t.nodes.push(node);
        (t.nodes.len() - 1) as u32
    })
}

/// Number of nodes currently on this thread's tape.
pub fn tape_len() -> usize {
    TAPE.with(|t| t.borrow().nodes.len())
}

/// Run `f` in a tape scope. Every node appended inside the scope is
/// reclaimed when the scope exits (also on early return via `?`), so a
/// `Num` created inside must not escape it.
///
/// The model adapters wrap each `grad_log_prob` call in a session, which
/// keeps tape growth bounded to a single evaluation.
pub fn session<R>(f: impl FnOnce() -> R) -> R {
    struct Guard(usize);
    impl Drop for Guard {
        fn drop(&mut self) {
            TAPE.with(|t| {
                let mut t = t.borrow_mut();
                t.nodes.truncate(self.0);
                t.adjoints.truncate(self.0);
            });
        }
    }
    let _guard = Guard(tape_len());
    f()
}

/// Compute d`root`/d`indeps[i]` for every independent leaf.
///
/// Seeds `root`'s adjoint with 1, sweeps the tape in reverse insertion
/// order accumulating `parent.adjoint += partial * node.adjoint`, and
/// returns the leaves' adjoints. The tape is then truncated back to the
/// earliest of the given leaves: handles created after that point are
/// invalidated, which is fine because a fresh forward pass rebuilds them.
pub fn gradient(root: Num, indeps: &[Num]) -> Vec<f64> {
    TAPE.with(|t| {
        let mut tape = t.borrow_mut();
        let n = tape.nodes.len();
        tape.adjoints.clear();
        tape.adjoints.resize(n, 0.0);
        tape.adjoints[root.idx as usize] = 1.0;

        let Tape { nodes, adjoints } = &mut *tape;
        for i in (0..n).rev() {
            let adj = adjoints[i];
            if adj == 0.0 {
                continue;
            }
            match nodes[i] {
                Node::Leaf => {}
                Node::Unary { arg, partial } => adjoints[arg as usize] += partial * adj,
                Node::Binary { args, partials } => {
                    adjoints[args[0] as usize] += partials[0] * adj;
                    adjoints[args[1] as usize] += partials[1] * adj;
                }
            }
        }

        let grad = indeps.iter().map(|v| adjoints[v.idx as usize]).collect();

        if let Some(mark) = indeps.iter().map(|v| v.idx).min() {
            nodes.truncate(mark as usize);
            adjoints.truncate(mark as usize);
        }
        grad
    })
}

impl Num {
    /// Push a new independent variable onto this thread's tape.
    pub fn new(val: f64) -> Self {
        Num { idx: push(Node::Leaf), val }
    }

    /// Primal value.
    #[inline]
    pub fn value(self) -> f64 {
        self.val
    }

    #[inline]
    fn unary(self, val: f64, partial: f64) -> Num {
        Num { idx: push(Node::Unary { arg: self.idx, partial }), val }
    }

    #[inline]
    fn binary(self, rhs: Num, val: f64, da: f64, db: f64) -> Num {
        Num {
            idx: push(Node::Binary { args: [self.idx, rhs.idx], partials: [da, db] }),
            val,
        }
    }

    pub fn exp(self) -> Num {
        let v = self.val.exp();
        self.unary(v, v)
    }

    pub fn ln(self) -> Num {
        self.unary(self.val.ln(), 1.0 / self.val)
    }

    pub fn sqrt(self) -> Num {
        let v = self.val.sqrt();
        self.unary(v, 0.5 / v)
    }

    /// `self^n` for a constant exponent.
    pub fn powf(self, n: f64) -> Num {
        self.unary(self.val.powf(n), n * self.val.powf(n - 1.0))
    }

    /// `self^rhs` with gradients through both base and exponent.
    pub fn pow(self, rhs: Num) -> Num {
        let v = self.val.powf(rhs.val);
        self.binary(rhs, v, rhs.val * self.val.powf(rhs.val - 1.0), v * self.val.ln())
    }

    pub fn sin(self) -> Num {
        self.unary(self.val.sin(), self.val.cos())
    }

    pub fn cos(self) -> Num {
        self.unary(self.val.cos(), -self.val.sin())
    }

    pub fn tan(self) -> Num {
        let c = self.val.cos();
        self.unary(self.val.tan(), 1.0 / (c * c))
    }

    pub fn asin(self) -> Num {
        self.unary(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }

    pub fn acos(self) -> Num {
        self.unary(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }

    pub fn atan(self) -> Num {
        self.unary(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }

    /// Four-quadrant arctangent, `self` being `y` and `rhs` being `x`.
    pub fn atan2(self, rhs: Num) -> Num {
        let denom = self.val * self.val + rhs.val * rhs.val;
        self.binary(rhs, self.val.atan2(rhs.val), rhs.val / denom, -self.val / denom)
    }

    pub fn sinh(self) -> Num {
        self.unary(self.val.sinh(), self.val.cosh())
    }

    pub fn cosh(self) -> Num {
        self.unary(self.val.cosh(), self.val.sinh())
    }

    pub fn tanh(self) -> Num {
        let t = self.val.tanh();
        self.unary(t, 1.0 - t * t)
    }

    pub fn abs(self) -> Num {
        self.unary(self.val.abs(), if self.val < 0.0 { -1.0 } else { 1.0 })
    }

    /// Minimum of two scalars; the gradient flows to the smaller one.
    pub fn min(self, rhs: Num) -> Num {
        if self.val <= rhs.val {
            self.binary(rhs, self.val, 1.0, 0.0)
        } else {
            self.binary(rhs, rhs.val, 0.0, 1.0)
        }
    }

    /// Maximum of two scalars; the gradient flows to the larger one.
    pub fn max(self, rhs: Num) -> Num {
        if self.val >= rhs.val {
            self.binary(rhs, self.val, 1.0, 0.0)
        } else {
            self.binary(rhs, rhs.val, 0.0, 1.0)
        }
    }
}

impl From<f64> for Num {
    fn from(val: f64) -> Self {
        Num::new(val)
    }
}

// ── Arithmetic: Num ⊕ Num ───────────────────────────────────────────

impl Add for Num {
    type Output = Num;
    fn add(self, rhs: Num) -> Num {
        self.binary(rhs, self.val + rhs.val, 1.0, 1.0)
    }
}

impl Sub for Num {
    type Output = Num;
    fn sub(self, rhs: Num) -> Num {
        self.binary(rhs, self.val - rhs.val, 1.0, -1.0)
    }
}

impl Mul for Num {
    type Output = Num;
    fn mul(self, rhs: Num) -> Num {
        self.binary(rhs, self.val * rhs.val, rhs.val, self.val)
    }
}

impl Div for Num {
    type Output = Num;
    fn div(self, rhs: Num) -> Num {
        self.binary(
            rhs,
            self.val / rhs.val,
            1.0 / rhs.val,
            -self.val / (rhs.val * rhs.val),
        )
    }
}

impl Neg for Num {
    type Output = Num;
    fn neg(self) -> Num {
        self.unary(-self.val, -1.0)
    }
}

// ── Arithmetic: Num ⊕ f64 and f64 ⊕ Num ─────────────────────────────
//
// Constants fold into the unary partial instead of becoming tape nodes.

impl Add<f64> for Num {
    type Output = Num;
    fn add(self, rhs: f64) -> Num {
        self.unary(self.val + rhs, 1.0)
    }
}

impl Add<Num> for f64 {
    type Output = Num;
    fn add(self, rhs: Num) -> Num {
        rhs.unary(self + rhs.val, 1.0)
    }
}

impl Sub<f64> for Num {
    type Output = Num;
    fn sub(self, rhs: f64) -> Num {
        self.unary(self.val - rhs, 1.0)
    }
}

impl Sub<Num> for f64 {
    type Output = Num;
    fn sub(self, rhs: Num) -> Num {
        rhs.unary(self - rhs.val, -1.0)
    }
}

impl Mul<f64> for Num {
    type Output = Num;
    fn mul(self, rhs: f64) -> Num {
        self.unary(self.val * rhs, rhs)
    }
}

impl Mul<Num> for f64 {
    type Output = Num;
    fn mul(self, rhs: Num) -> Num {
        rhs.unary(self * rhs.val, self)
    }
}

impl Div<f64> for Num {
    type Output = Num;
    fn div(self, rhs: f64) -> Num {
        self.unary(self.val / rhs, 1.0 / rhs)
    }
}

impl Div<Num> for f64 {
    type Output = Num;
    fn div(self, rhs: Num) -> Num {
        rhs.unary(self / rhs.val, -self / (rhs.val * rhs.val))
    }
}

// ── Comparisons (on primal values, no tape traffic) ─────────────────

impl PartialEq for Num {
    fn eq(&self, other: &Num) -> bool {
        self.val == other.val
    }
}

impl PartialEq<f64> for Num {
    fn eq(&self, other: &f64) -> bool {
        self.val == *other
    }
}

impl PartialOrd for Num {
    fn partial_cmp(&self, other: &Num) -> Option<Ordering> {
        self.val.partial_cmp(&other.val)
    }
}

impl PartialOrd<f64> for Num {
    fn partial_cmp(&self, other: &f64) -> Option<Ordering> {
        self.val.partial_cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Central-difference check of d/dx f(x) at `x0`.
    fn finite_diff(f: impl Fn(Num) -> Num, x0: f64) {
        session(|| {
            let x = Num::new(x0);
            let y = f(x);
            let grad = gradient(y, &[x]);

            let h = 1e-4;
            let fp = session(|| f(Num::new(x0 + h)).value());
            let fm = session(|| f(Num::new(x0 - h)).value());
            let num = (fp - fm) / (2.0 * h);
            assert_relative_eq!(grad[0], num, max_relative = 1e-6, epsilon = 1e-9);
        });
    }

    #[test]
    fn unary_ops_match_finite_differences() {
        finite_diff(|x| x.exp(), 0.7);
        finite_diff(|x| x.ln(), 2.3);
        finite_diff(|x| x.sqrt(), 1.9);
        finite_diff(|x| x.powf(3.5), 1.4);
        finite_diff(|x| x.sin(), 0.4);
        finite_diff(|x| x.cos(), 0.4);
        finite_diff(|x| x.tan(), 0.4);
        finite_diff(|x| x.asin(), 0.3);
        finite_diff(|x| x.acos(), 0.3);
        finite_diff(|x| x.atan(), 1.2);
        finite_diff(|x| x.sinh(), 0.8);
        finite_diff(|x| x.cosh(), 0.8);
        finite_diff(|x| x.tanh(), 0.8);
        finite_diff(|x| x.abs(), -1.5);
        finite_diff(|x| -x, 0.6);
    }

    #[test]
    fn binary_ops_match_finite_differences() {
        finite_diff(|x| x + x * x, 1.1);
        finite_diff(|x| x * x - 2.0 * x, 0.9);
        finite_diff(|x| (x + 1.0) / (x * x + 3.0), 0.5);
        finite_diff(|x| x.pow(Num::new(2.5)), 1.3);
        finite_diff(|x| Num::new(2.5).pow(x), 1.3);
        finite_diff(|x| x.atan2(Num::new(0.7)), 0.9);
        finite_diff(|x| Num::new(0.7).atan2(x), 0.9);
        finite_diff(|x| 3.0 - x / 2.0, 0.4);
        finite_diff(|x| 5.0 / x, 1.7);
    }

    #[test]
    fn min_max_route_gradient_to_winner() {
        session(|| {
            let a = Num::new(1.0);
            let b = Num::new(2.0);
            let lo = a.min(b);
            let g = gradient(lo, &[a, b]);
            assert_eq!(g, vec![1.0, 0.0]);
        });
        session(|| {
            let a = Num::new(1.0);
            let b = Num::new(2.0);
            let hi = a.max(b);
            let g = gradient(hi, &[a, b]);
            assert_eq!(g, vec![0.0, 1.0]);
        });
    }

    #[test]
    fn chain_rule() {
        // d/dx exp(sin(x)) = cos(x) * exp(sin(x))
        session(|| {
            let x = Num::new(0.8);
            let y = x.sin().exp();
            let g = gradient(y, &[x]);
            let expected = 0.8_f64.cos() * 0.8_f64.sin().exp();
            assert_relative_eq!(g[0], expected, max_relative = 1e-12);
        });
    }

    #[test]
    fn gradient_is_linear() {
        // grad(a·f + b·g) = a·grad f + b·grad g with f = x², g = sin x
        let x0 = 1.3;
        let (a, b) = (2.5, -0.75);

        let combined = session(|| {
            let x = Num::new(x0);
            let y = a * (x * x) + b * x.sin();
            gradient(y, &[x])[0]
        });
        let parts = a * 2.0 * x0 + b * x0.cos();
        assert_relative_eq!(combined, parts, max_relative = 1e-12);
    }

    #[test]
    fn fanout_accumulates_adjoints() {
        // f = x*x + x: both uses of x contribute
        session(|| {
            let x = Num::new(3.0);
            let y = x * x + x;
            let g = gradient(y, &[x]);
            assert_relative_eq!(g[0], 7.0, max_relative = 1e-12);
        });
    }

    #[test]
    fn multivariate_gradient() {
        // f(x, y) = x²y + y³
        session(|| {
            let x = Num::new(2.0);
            let y = Num::new(3.0);
            let f = x * x * y + y * y * y;
            let g = gradient(f, &[x, y]);
            assert_relative_eq!(g[0], 12.0, max_relative = 1e-12);
            assert_relative_eq!(g[1], 31.0, max_relative = 1e-12);
        });
    }

    #[test]
    fn gradient_reclaims_tape_to_leaf_mark() {
        session(|| {
            let base = tape_len();
            let x = Num::new(1.0);
            let y = Num::new(2.0);
            let f = x * y + x.exp();
            assert!(tape_len() > base + 2);
            let _ = gradient(f, &[x, y]);
            assert_eq!(tape_len(), base);
        });
    }

    #[test]
    fn session_reclaims_on_exit() {
        let before = tape_len();
        session(|| {
            let x = Num::new(1.0);
            let _ = x.exp() * x;
            assert!(tape_len() > before);
        });
        assert_eq!(tape_len(), before);
    }

    #[test]
    fn gaussian_kernel_gradient() {
        // f(x) = exp(-½‖x‖²); ∇f = -x·f(x). Checked at (1, 2, 3) to 1e-8.
        session(|| {
            let xs: Vec<Num> = [1.0, 2.0, 3.0].iter().map(|&v| Num::new(v)).collect();
            let mut ss = xs[0] * xs[0];
            for &xi in &xs[1..] {
                ss = ss + xi * xi;
            }
            let f = (-0.5 * ss).exp();
            let g = gradient(f, &xs);
            let fv = (-0.5 * 14.0_f64).exp();
            for (i, &xi) in [1.0, 2.0, 3.0].iter().enumerate() {
                assert_relative_eq!(g[i], -xi * fv, epsilon = 1e-8);
            }
        });
    }

    #[test]
    fn comparisons_read_values() {
        session(|| {
            let a = Num::new(1.0);
            let b = Num::new(2.0);
            assert!(a < b);
            assert!(b > 1.5);
            assert!(a == 1.0);
            assert!(a <= b && b >= a);
        });
    }

    #[test]
    fn domain_error_produces_nan() {
        session(|| {
            let x = Num::new(-1.0);
            assert!(x.ln().value().is_nan());
            assert!(x.sqrt().value().is_nan());
        });
    }
}
