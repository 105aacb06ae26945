use nalgebra::DVector;

use crate::ode_solver::equations::RhsResult;
use crate::scalar::scale;

type V = DVector<f64>;

// dy/dt = -p[0] * y
pub fn decay_rhs(_t: f64, y: &V, p: &V, ydot: &mut V) -> RhsResult {
    ydot.copy_from(y);
    *ydot *= scale(-p[0]);
    Ok(())
}

pub fn decay_solution(t: f64, p: f64, y0: f64) -> f64 {
    y0 * (-p * t).exp()
}

// d/dp of y0 * exp(-p t)
pub fn decay_sens_solution(t: f64, p: f64, y0: f64) -> f64 {
    -t * y0 * (-p * t).exp()
}

// analytic sensitivity RHS: sdot = -p s - y
pub fn decay_sens_rhs(
    _t: f64,
    y: &V,
    _ydot: &V,
    p: &V,
    _is: usize,
    ys: &V,
    ysdot: &mut V,
) -> RhsResult {
    ysdot[0] = -p[0] * ys[0] - y[0];
    Ok(())
}
