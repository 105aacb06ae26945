use nalgebra::{DMatrix, DVector, Dyn};

use crate::error::LinearSolverError;
use crate::ode_solver::equations::{RhsError, RhsResult};
use crate::ode_solver::Method;
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::{ConvFail, LinearSolver, LinearSolverCounters, LinearSolverCtx};

/// Maximum steps a saved Jacobian may be reused across setups.
const MSBJ: usize = 50;
/// A `|gamrat - 1|` below this keeps the saved Jacobian through a
/// stale-Jacobian convergence failure.
const DGMAX: f64 = 0.2;
/// Multiplier on the minimum difference-quotient increment.
const MIN_INC_MULT: f64 = 1000.0;

/// Optional user-supplied dense Jacobian `J = df/dy`.
pub trait DenseJac<T: Scalar> {
    fn call(
        &self,
        t: T,
        y: &DVector<T>,
        fy: &DVector<T>,
        p: &DVector<T>,
        jac: &mut DMatrix<T>,
    ) -> RhsResult;
}

impl<T: Scalar, F> DenseJac<T> for F
where
    F: Fn(T, &DVector<T>, &DVector<T>, &DVector<T>, &mut DMatrix<T>) -> RhsResult,
{
    fn call(
        &self,
        t: T,
        y: &DVector<T>,
        fy: &DVector<T>,
        p: &DVector<T>,
        jac: &mut DMatrix<T>,
    ) -> RhsResult {
        self(t, y, fy, p, jac)
    }
}

/// Dense direct solver for the Newton iteration matrix.
///
/// The Jacobian is either user supplied or approximated column by column with
/// one-sided difference quotients; it is saved and reused across setups until
/// it is too old, the corrector reports it stale, or `gamma` has drifted.
/// `M = I - gamma * J` is refactored with an LU decomposition on every setup.
pub struct DenseDirect<T: Scalar> {
    n: usize,
    jac: DMatrix<T>,
    m: DMatrix<T>,
    lu: Option<nalgebra::LU<T, Dyn, Dyn>>,
    user_jac: Option<Box<dyn DenseJac<T>>>,
    /// Step count at the last Jacobian evaluation.
    nstlj: usize,
    counters: LinearSolverCounters,
    ytemp: DVector<T>,
    ftemp: DVector<T>,
}

impl<T: Scalar> DenseDirect<T> {
    pub fn new() -> Self {
        Self {
            n: 0,
            jac: DMatrix::zeros(0, 0),
            m: DMatrix::zeros(0, 0),
            lu: None,
            user_jac: None,
            nstlj: 0,
            counters: LinearSolverCounters::default(),
            ytemp: DVector::zeros(0),
            ftemp: DVector::zeros(0),
        }
    }

    pub fn with_jacobian(jac_fn: impl DenseJac<T> + 'static) -> Self {
        let mut s = Self::new();
        s.user_jac = Some(Box::new(jac_fn));
        s
    }

    fn dq_jacobian(
        &mut self,
        ctx: &LinearSolverCtx<'_, DVector<T>>,
        ypred: &DVector<T>,
        fpred: &DVector<T>,
    ) -> Result<(), LinearSolverError> {
        let uround = T::EPSILON;
        let srur = uround.sqrt();
        let fnorm = Vector::wrms_norm(fpred, ctx.ewt);
        let min_inc = if fnorm != T::zero() {
            T::from(MIN_INC_MULT) * ctx.h.abs() * uround * T::from(self.n as f64) * fnorm
        } else {
            T::one()
        };

        self.ytemp.copy_from(ypred);
        for j in 0..self.n {
            let yj = self.ytemp[j];
            let mut inc = srur * yj.abs();
            let floor = min_inc / ctx.ewt[j];
            if floor > inc {
                inc = floor;
            }
            self.ytemp[j] = yj + inc;
            ctx.rhs
                .call(ctx.t, &self.ytemp, ctx.p, &mut self.ftemp)
                .map_err(|e| LinearSolverError::JacobianRhsFailed {
                    recoverable: e == RhsError::Recoverable,
                })?;
            self.counters.nfev_dq += 1;
            self.ytemp[j] = yj;

            let inc_inv = T::one() / inc;
            for i in 0..self.n {
                self.jac[(i, j)] = inc_inv * (self.ftemp[i] - fpred[i]);
            }
        }
        Ok(())
    }
}

impl<T: Scalar> Default for DenseDirect<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> LinearSolver<DVector<T>> for DenseDirect<T> {
    fn init(&mut self, n: usize) -> Result<(), LinearSolverError> {
        self.n = n;
        self.jac = DMatrix::zeros(n, n);
        self.m = DMatrix::zeros(n, n);
        self.lu = None;
        self.nstlj = 0;
        self.counters = LinearSolverCounters::default();
        self.ytemp = DVector::zeros(n);
        self.ftemp = DVector::zeros(n);
        Ok(())
    }

    fn setup(
        &mut self,
        ctx: LinearSolverCtx<'_, DVector<T>>,
        convfail: ConvFail,
        ypred: &DVector<T>,
        fpred: &DVector<T>,
    ) -> Result<bool, LinearSolverError> {
        if self.n == 0 {
            return Err(LinearSolverError::NotInitialized);
        }

        let dgamma = (ctx.gamrat - T::one()).abs();
        let jbad = ctx.nst == 0
            || ctx.nst > self.nstlj + MSBJ
            || (convfail == ConvFail::FailBadJ && dgamma < T::from(DGMAX))
            || convfail == ConvFail::FailOther;

        let jcur = if jbad {
            self.counters.njev += 1;
            self.nstlj = ctx.nst;
            match &self.user_jac {
                Some(jac_fn) => {
                    jac_fn
                        .call(ctx.t, ypred, fpred, ctx.p, &mut self.jac)
                        .map_err(|e| LinearSolverError::JacobianRhsFailed {
                            recoverable: e == RhsError::Recoverable,
                        })?;
                }
                None => self.dq_jacobian(&ctx, ypred, fpred)?,
            }
            true
        } else {
            false
        };

        // M = I - gamma * J
        self.m.copy_from(&self.jac);
        self.m *= -ctx.gamma;
        for i in 0..self.n {
            self.m[(i, i)] += T::one();
        }

        let lu = self.m.clone().lu();
        if !lu.is_invertible() {
            self.lu = None;
            return Err(LinearSolverError::FactorizationFailed);
        }
        self.lu = Some(lu);
        Ok(jcur)
    }

    fn solve(
        &mut self,
        ctx: LinearSolverCtx<'_, DVector<T>>,
        b: &mut DVector<T>,
        _weight: &DVector<T>,
        _ycur: &DVector<T>,
        _fcur: &DVector<T>,
    ) -> Result<(), LinearSolverError> {
        let lu = self.lu.as_ref().ok_or(LinearSolverError::NotInitialized)?;
        if !lu.solve_mut(b) {
            return Err(LinearSolverError::SolveFailed);
        }
        // Account for a gamma change since the last factorization.
        if ctx.method == Method::Bdf && ctx.gamrat != T::one() {
            let fact = T::from(2.0) / (T::one() + ctx.gamrat);
            *b *= fact;
        }
        Ok(())
    }

    fn counters(&self) -> LinearSolverCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_solver::tests::test_identity_minus_gamma_j;
    use crate::ode_solver::equations::RhsResult;

    type V = DVector<f64>;

    #[test]
    fn test_dense_dq() {
        let mut ls = DenseDirect::<f64>::new();
        // DQ Jacobian of a linear RHS is exact to rounding.
        test_identity_minus_gamma_j(&mut ls, 1e-7);
        assert_eq!(ls.counters().njev, 1);
        assert!(ls.counters().nfev_dq >= 3);
    }

    #[test]
    fn test_dense_user_jacobian() {
        let jac_fn = |_t: f64, _y: &V, _fy: &V, _p: &V, jac: &mut DMatrix<f64>| -> RhsResult {
            jac.fill(0.0);
            jac[(0, 0)] = -2.0;
            jac[(1, 1)] = -2.0;
            jac[(2, 2)] = -2.0;
            Ok(())
        };
        let mut ls = DenseDirect::with_jacobian(jac_fn);
        test_identity_minus_gamma_j(&mut ls, 1e-14);
        assert_eq!(ls.counters().nfev_dq, 0);
    }
}
