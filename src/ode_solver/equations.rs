use crate::vector::Vector;

/// Outcome a user right-hand side reports back to the integrator.
///
/// A recoverable failure makes the step machinery retry with a smaller step
/// size; an unrecoverable one aborts the integration with
/// [crate::error::OdeSolverError::RhsFailed].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RhsError {
    Recoverable,
    Unrecoverable,
}

pub type RhsResult = Result<(), RhsError>;

/// The ODE right-hand side `ydot = f(t, y, p)`.
///
/// `p` is the parameter vector held by the solver; problems without
/// parameters receive an empty vector. Implemented for closures of the same
/// shape.
pub trait OdeRhs<V: Vector> {
    fn call(&self, t: V::T, y: &V, p: &V, ydot: &mut V) -> RhsResult;
}

impl<V: Vector, F> OdeRhs<V> for F
where
    F: Fn(V::T, &V, &V, &mut V) -> RhsResult,
{
    fn call(&self, t: V::T, y: &V, p: &V, ydot: &mut V) -> RhsResult {
        self(t, y, p, ydot)
    }
}

/// The quadrature right-hand side `qdot = fQ(t, y, p)`.
///
/// The quadrature vector may have a different length than the state vector;
/// quadrature variables never feed back into `f`.
pub trait QuadRhs<V: Vector> {
    fn call(&self, t: V::T, y: &V, p: &V, qdot: &mut V) -> RhsResult;
}

impl<V: Vector, F> QuadRhs<V> for F
where
    F: Fn(V::T, &V, &V, &mut V) -> RhsResult,
{
    fn call(&self, t: V::T, y: &V, p: &V, qdot: &mut V) -> RhsResult {
        self(t, y, p, qdot)
    }
}

/// User-supplied sensitivity right-hand sides, all parameters at once:
/// `sdot_i = (df/dy) s_i + df/dp_i` for `i = 0..ns`.
///
/// `ydot` is `f(t, y, p)` already evaluated at the current state, which many
/// analytic sensitivity functions reuse.
pub trait SensRhsAll<V: Vector> {
    #[allow(clippy::too_many_arguments)]
    fn call(
        &self,
        t: V::T,
        y: &V,
        ydot: &V,
        p: &V,
        ys: &[V],
        ysdot: &mut [V],
    ) -> RhsResult;
}

impl<V: Vector, F> SensRhsAll<V> for F
where
    F: Fn(V::T, &V, &V, &V, &[V], &mut [V]) -> RhsResult,
{
    fn call(&self, t: V::T, y: &V, ydot: &V, p: &V, ys: &[V], ysdot: &mut [V]) -> RhsResult {
        self(t, y, ydot, p, ys, ysdot)
    }
}

/// User-supplied sensitivity right-hand side, one parameter at a time.
///
/// This is the only supplier shape usable with the one-at-a-time staggered
/// corrector.
pub trait SensRhs1<V: Vector> {
    #[allow(clippy::too_many_arguments)]
    fn call(
        &self,
        t: V::T,
        y: &V,
        ydot: &V,
        p: &V,
        is: usize,
        ys: &V,
        ysdot: &mut V,
    ) -> RhsResult;
}

impl<V: Vector, F> SensRhs1<V> for F
where
    F: Fn(V::T, &V, &V, &V, usize, &V, &mut V) -> RhsResult,
{
    fn call(
        &self,
        t: V::T,
        y: &V,
        ydot: &V,
        p: &V,
        is: usize,
        ys: &V,
        ysdot: &mut V,
    ) -> RhsResult {
        self(t, y, ydot, p, is, ys, ysdot)
    }
}
