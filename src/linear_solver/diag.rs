use num_traits::{One, Zero};
use nalgebra::ComplexField;
use crate::error::LinearSolverError;
use crate::ode_solver::equations::RhsError;
use crate::ode_solver::Method;
use crate::scalar::{scale, Scalar};
use crate::vector::Vector;

use super::{ConvFail, LinearSolver, LinearSolverCounters, LinearSolverCtx};

/// Fraction of `h * f` used as the diagonal perturbation.
const FRACT: f64 = 0.1;

/// Diagonal approximate-Jacobian solver.
///
/// A single extra RHS evaluation at `y + sigma`, `sigma = 0.1 * h * f(t, y)`,
/// yields `J_ii ~ (f_i(y + sigma) - f_i(y)) / sigma_i`, and the iteration
/// matrix is approximated by its diagonal `M_ii = 1 - gamma * J_ii`.
/// Components whose perturbation is at roundoff level keep `M_ii = 1`. Cheap
/// per step, adequate for weakly coupled systems; the Jacobian data is
/// regenerated on every setup, so `jcur` is always true.
pub struct DiagApprox<V: Vector> {
    n: usize,
    minv: Option<V>,
    ytemp: Option<V>,
    ftemp: Option<V>,
    counters: LinearSolverCounters,
}

impl<V: Vector> DiagApprox<V> {
    pub fn new() -> Self {
        Self {
            n: 0,
            minv: None,
            ytemp: None,
            ftemp: None,
            counters: LinearSolverCounters::default(),
        }
    }
}

impl<V: Vector> Default for DiagApprox<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Vector> LinearSolver<V> for DiagApprox<V> {
    fn init(&mut self, n: usize) -> Result<(), LinearSolverError> {
        self.n = n;
        self.minv = Some(V::zeros(n));
        self.ytemp = Some(V::zeros(n));
        self.ftemp = Some(V::zeros(n));
        self.counters = LinearSolverCounters::default();
        Ok(())
    }

    fn setup(
        &mut self,
        ctx: LinearSolverCtx<'_, V>,
        _convfail: ConvFail,
        ypred: &V,
        fpred: &V,
    ) -> Result<bool, LinearSolverError> {
        let (Some(minv), Some(ytemp), Some(ftemp)) =
            (self.minv.as_mut(), self.ytemp.as_mut(), self.ftemp.as_mut())
        else {
            return Err(LinearSolverError::NotInitialized);
        };
        let uround = V::T::EPSILON;
        let fract = V::T::from(FRACT);

        // ytemp = ypred + 0.1 * h * fpred
        ytemp.linear_sum(V::T::one(), ypred, fract * ctx.h, fpred);
        ctx.rhs
            .call(ctx.t, ytemp, ctx.p, ftemp)
            .map_err(|e| LinearSolverError::JacobianRhsFailed {
                recoverable: e == RhsError::Recoverable,
            })?;
        self.counters.njev += 1;
        self.counters.nfev_dq += 1;

        for i in 0..self.n {
            let sigma = fract * ctx.h * fpred.get_index(i);
            let roundoff = uround * (V::T::one() + ypred.get_index(i).abs());
            let mii = if sigma.abs() <= roundoff {
                V::T::one()
            } else {
                let jii = (ftemp.get_index(i) - fpred.get_index(i)) / sigma;
                V::T::one() - ctx.gamma * jii
            };
            if mii == V::T::zero() {
                return Err(LinearSolverError::FactorizationFailed);
            }
            minv.set_index(i, V::T::one() / mii);
        }
        Ok(true)
    }

    fn solve(
        &mut self,
        ctx: LinearSolverCtx<'_, V>,
        b: &mut V,
        _weight: &V,
        _ycur: &V,
        _fcur: &V,
    ) -> Result<(), LinearSolverError> {
        let minv = self.minv.as_ref().ok_or(LinearSolverError::NotInitialized)?;
        b.component_mul_assign(minv);
        if ctx.method == Method::Bdf && ctx.gamrat != V::T::one() {
            let fact = V::T::from(2.0) / (V::T::one() + ctx.gamrat);
            *b *= scale(fact);
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

    #[test]
    fn test_diag_on_diagonal_system() {
        let mut ls = DiagApprox::<nalgebra::DVector<f64>>::new();
        // The diagonal approximation is exact for a diagonal linear RHS.
        test_identity_minus_gamma_j(&mut ls, 1e-6);
    }
}
