//! # nordsol
//!
//! nordsol is a variable-order, variable-step linear multistep integrator for
//! initial-value problems `y' = f(t, y, p)`, covering both the non-stiff
//! Adams-Moulton family (orders 1-12) and the stiff BDF family (orders 1-5)
//! on a Nordsieck history representation. The implicit step equation is
//! solved either by fixed-point (functional) iteration or by a Newton
//! iteration through a pluggable linear solver, and the BDF family carries an
//! optional stability-limit detector that lowers the order near the stability
//! boundary.
//!
//! ## Solving an ODE
//!
//! Create a [MultistepSolver] with a [Method] and an [IterType] and your
//! right-hand side, provide the problem with [MultistepSolver::init], then
//! drive it with [MultistepSolver::solve_to]:
//!
//! ```rust
//! use nalgebra::DVector;
//! use nordsol::{Atol, IterType, Method, MultistepSolver, RhsResult, Task};
//!
//! type V = DVector<f64>;
//!
//! // y' = -y
//! let rhs = |_t: f64, y: &V, _p: &V, ydot: &mut V| -> RhsResult {
//!     ydot[0] = -y[0];
//!     Ok(())
//! };
//! let mut solver = MultistepSolver::new(Method::Adams, IterType::Functional, rhs);
//! solver.init(0.0, &V::from_vec(vec![1.0]), 1e-8, Atol::Scalar(1e-10)).unwrap();
//! let mut yout = V::zeros(1);
//! let (t, _status) = solver.solve_to(1.0, &mut yout, Task::Normal).unwrap();
//! assert!((yout[0] - (-t as f64).exp()).abs() < 1e-6);
//! ```
//!
//! For stiff problems, use [Method::Bdf] with [IterType::Newton] and attach a
//! linear solver for the iteration matrix `M = I - gamma * J`: the dense
//! direct solver [DenseDirect] (difference-quotient or user-supplied
//! Jacobian) or the cheap diagonal approximation [DiagApprox]. Any type
//! implementing [LinearSolver] can be attached.
//!
//! ## Quadratures and forward sensitivities
//!
//! Pure quadrature variables `q' = fQ(t, y, p)` are integrated alongside the
//! state ([MultistepSolver::quad_init]) with their own tolerances, optionally
//! participating in the step error test. Forward sensitivities
//! `s_i = dy/dp_i` are computed with [MultistepSolver::sens_init] in one of
//! three couplings ([SensCoupling]): simultaneous corrector on the combined
//! system, staggered after the state, or staggered one parameter at a time.
//! The sensitivity right-hand sides come from the user (all at once or per
//! parameter) or from a difference-quotient approximation driven by the
//! parameter scalings `pbar`.
//!
//! ## Vectors
//!
//! All state is held in a caller-chosen vector type implementing [Vector];
//! an implementation for `nalgebra::DVector` is provided. A distributed
//! backend only needs to supply the same fixed operation set, with the norm
//! reductions doing the collective communication.

pub mod error;
pub mod linear_solver;
pub mod ode_solver;
pub mod scalar;
pub mod vector;

pub use error::{LinearSolverError, NonLinearSolverError, NordsolError, OdeSolverError};
pub use linear_solver::dense::DenseJac;
pub use linear_solver::{
    ConvFail, DenseDirect, DiagApprox, LinearSolver, LinearSolverCounters, LinearSolverCtx,
};
pub use ode_solver::equations::{OdeRhs, QuadRhs, RhsError, RhsResult, SensRhs1, SensRhsAll};
pub use ode_solver::problem::SensOptions;
pub use ode_solver::sens::{SensCoupling, SensMethod, SensRhs1Fn, SensRhsFn};
pub use ode_solver::solver::{MultistepSolver, QuadStatistics, SensStatistics, SolverStatistics};
pub use ode_solver::weights::Atol;
pub use ode_solver::{ErrCon, IterType, Method, SolveStatus, Task};
pub use scalar::{scale, IndexType, Scalar, Scale};
pub use vector::Vector;
