use nalgebra::DVector;

use crate::ode_solver::equations::RhsResult;

type V = DVector<f64>;

// y1' = y2, y2' = -y1; solution (cos t, -sin t) from (1, 0)
pub fn harmonic_rhs(_t: f64, y: &V, _p: &V, ydot: &mut V) -> RhsResult {
    ydot[0] = y[1];
    ydot[1] = -y[0];
    Ok(())
}

// q' = cos(t), q(0) = 0 => q(t) = sin(t)
pub fn cosine_quad_rhs(t: f64, _y: &V, _p: &V, qdot: &mut V) -> RhsResult {
    qdot[0] = t.cos();
    Ok(())
}
