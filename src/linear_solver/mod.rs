use crate::error::LinearSolverError;
use crate::ode_solver::equations::OdeRhs;
use crate::ode_solver::Method;
use crate::vector::Vector;

pub mod dense;
pub mod diag;

pub use dense::DenseDirect;
pub use diag::DiagApprox;

/// Reason the iteration matrix is being (re)formed, passed to
/// [LinearSolver::setup] so an implementation can decide whether its saved
/// Jacobian data is still usable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConvFail {
    /// First setup of the step, or the previous step failed only its error
    /// test.
    NoFailures,
    /// The corrector failed to converge with Jacobian data known to be stale.
    FailBadJ,
    /// The corrector failed for another reason (or a forced setup).
    FailOther,
}

/// Integrator state handed to the linear solver on every call.
///
/// The solver context is deliberately not stored inside the linear solver;
/// every piece of integrator state it may need travels through this borrow,
/// so neither side holds a reference to the other between calls.
pub struct LinearSolverCtx<'a, V: Vector> {
    pub t: V::T,
    pub gamma: V::T,
    /// `gamma` at the last setup, for Jacobian-reuse decisions.
    pub gammap: V::T,
    pub gamrat: V::T,
    pub h: V::T,
    pub nst: usize,
    pub method: Method,
    pub ewt: &'a V,
    pub rhs: &'a dyn OdeRhs<V>,
    pub p: &'a V,
}

/// Counters an implementation exposes for the solver statistics.
#[derive(Copy, Clone, Debug, Default)]
pub struct LinearSolverCounters {
    /// Jacobian (re)evaluations.
    pub njev: usize,
    /// RHS calls spent on difference-quotient Jacobian approximation.
    pub nfev_dq: usize,
}

/// A solver for the Newton iteration matrix `M = I - gamma * J`,
/// `J = df/dy`.
///
/// Lifecycle: [LinearSolver::init] once per problem shape, then
/// [LinearSolver::setup] whenever the step machinery decides the matrix must
/// be reformed and refactored, and [LinearSolver::solve] once per Newton
/// iterate (several right-hand sides per setup). Failures are split into
/// recoverable and unrecoverable by [LinearSolverError::is_recoverable]; a
/// recoverable setup or solve failure makes the integrator retry with a
/// fresh Jacobian or a reduced step.
pub trait LinearSolver<V: Vector> {
    /// One-time setup for a problem with `n` states.
    fn init(&mut self, n: usize) -> Result<(), LinearSolverError>;

    /// (Re)form and factor the iteration matrix at the predicted state.
    /// Returns `true` if the underlying Jacobian data was regenerated
    /// (`jcur`), `false` if saved data was reused.
    fn setup(
        &mut self,
        ctx: LinearSolverCtx<'_, V>,
        convfail: ConvFail,
        ypred: &V,
        fpred: &V,
    ) -> Result<bool, LinearSolverError>;

    /// Solve `M x = b`, overwriting `b` with the solution. `weight` is the
    /// current error-weight vector, available for diagnostic scaling.
    fn solve(
        &mut self,
        ctx: LinearSolverCtx<'_, V>,
        b: &mut V,
        weight: &V,
        ycur: &V,
        fcur: &V,
    ) -> Result<(), LinearSolverError>;

    fn counters(&self) -> LinearSolverCounters {
        LinearSolverCounters::default()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::ode_solver::equations::RhsResult;
    use nalgebra::DVector;

    type V = DVector<f64>;

    /// Setup/solve against `y' = -2y` (J = -2I): M = I - gamma*J = (1+2*gamma)I.
    pub fn test_identity_minus_gamma_j(ls: &mut dyn LinearSolver<V>, tol: f64) {
        let rhs = |_t: f64, y: &V, _p: &V, ydot: &mut V| -> RhsResult {
            ydot.copy_from(y);
            *ydot *= crate::scalar::scale(-2.0);
            Ok(())
        };
        let n = 3;
        ls.init(n).unwrap();
        let p = V::zeros(0);
        let ewt = V::from_element(n, 1.0);
        let y = V::from_vec(vec![1.0, 2.0, -1.0]);
        let mut fy = V::zeros(n);
        rhs(0.0, &y, &p, &mut fy).unwrap();
        let gamma = 0.25;
        let ctx = |gamma: f64| LinearSolverCtx {
            t: 0.0,
            gamma,
            gammap: gamma,
            gamrat: 1.0,
            h: 0.1,
            nst: 0,
            method: Method::Bdf,
            ewt: &ewt,
            rhs: &rhs,
            p: &p,
        };
        let jcur = ls.setup(ctx(gamma), ConvFail::NoFailures, &y, &fy).unwrap();
        assert!(jcur);
        let mut b = V::from_vec(vec![3.0, -1.5, 0.75]);
        ls.solve(ctx(gamma), &mut b, &ewt, &y, &fy).unwrap();
        let expect = V::from_vec(vec![3.0 / 1.5, -1.0, 0.5]);
        crate::vector::Vector::assert_eq_st(&b, &expect, tol);
    }
}
