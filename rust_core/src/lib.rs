//! Gradient-based MCMC core: a tape-based reverse-mode AD engine and a
//! family of Hamiltonian samplers (LMC, NUTS, fixed-step HMC, T3) over
//! user-supplied log-density callbacks.

pub mod chain;
pub mod diagnostics;
pub mod dualavg;
pub mod error;
pub mod hmc;
pub mod integrator;
pub mod lmc;
pub mod model;
pub mod nuts;
pub mod t3;
pub mod tape;

pub use chain::Sample;
pub use error::{Error, Result};
pub use tape::{gradient, Num};
