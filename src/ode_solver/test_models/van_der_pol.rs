use nalgebra::{DMatrix, DVector};

use crate::ode_solver::equations::RhsResult;

type V = DVector<f64>;

pub const MU: f64 = 1000.0;

// y1' = y2, y2' = mu (1 - y1^2) y2 - y1
pub fn vdp_rhs(_t: f64, y: &V, _p: &V, ydot: &mut V) -> RhsResult {
    ydot[0] = y[1];
    ydot[1] = MU * (1.0 - y[0] * y[0]) * y[1] - y[0];
    Ok(())
}

pub fn vdp_jac(_t: f64, y: &V, _fy: &V, _p: &V, jac: &mut DMatrix<f64>) -> RhsResult {
    jac[(0, 0)] = 0.0;
    jac[(0, 1)] = 1.0;
    jac[(1, 0)] = -2.0 * MU * y[0] * y[1] - 1.0;
    jac[(1, 1)] = MU * (1.0 - y[0] * y[0]);
    Ok(())
}
