use num_traits::{One, Zero};
use nalgebra::ComplexField;
use std::rc::Rc;

use crate::error::{NordsolError, OdeSolverError};
use crate::scalar::{scale, Scalar};
use crate::vector::Vector;

/// Absolute tolerance: one scalar for all components, or one per component.
#[derive(Clone, Debug)]
pub enum Atol<V: Vector> {
    Scalar(V::T),
    Vector(Rc<V>),
}

impl<V: Vector> Atol<V> {
    pub(crate) fn check(&self, n: usize) -> Result<(), NordsolError> {
        match self {
            Atol::Scalar(a) => {
                if *a < V::T::zero() {
                    return Err(OdeSolverError::NegativeTolerance.into());
                }
            }
            Atol::Vector(v) => {
                if v.len() != n {
                    return Err(OdeSolverError::AtolLengthMismatch.into());
                }
                if v.min() < V::T::zero() {
                    return Err(OdeSolverError::NegativeTolerance.into());
                }
            }
        }
        Ok(())
    }
}

/// Build the error-weight vector `ewt_i = 1 / (rtol * |y_i| + atol_i)`.
///
/// Returns `false` (weights unusable) if any denominator is zero or
/// negative; the caller aborts the current invocation in that case.
pub(crate) fn ewt_set<V: Vector>(
    y: &V,
    rtol: V::T,
    atol: &Atol<V>,
    tmp: &mut V,
    ewt: &mut V,
) -> bool {
    y.abs_to(tmp);
    *tmp *= scale(rtol);
    match atol {
        Atol::Scalar(a) => tmp.add_scalar_mut(*a),
        Atol::Vector(v) => tmp.axpy(V::T::one(), v, V::T::one()),
    }
    tmp.try_recip_to(ewt)
}

/// Derive per-sensitivity absolute tolerances `atol / |pbar_i|` when the
/// user supplied none. A zero scaling factor is rejected since it would make
/// the weights unbounded.
pub(crate) fn derive_sens_atol<V: Vector>(
    atol: &Atol<V>,
    pbar: &[V::T],
) -> Result<Vec<Atol<V>>, NordsolError> {
    let mut out = Vec::with_capacity(pbar.len());
    for (i, &pb) in pbar.iter().enumerate() {
        let pbi = pb.abs();
        if pbi == V::T::zero() {
            return Err(OdeSolverError::ZeroPbar { index: i }.into());
        }
        let atol_i = match atol {
            Atol::Scalar(a) => Atol::Scalar(*a / pbi),
            Atol::Vector(v) => {
                let mut vi = (**v).clone();
                vi *= scale(V::T::one() / pbi);
                Atol::Vector(Rc::new(vi))
            }
        };
        out.push(atol_i);
    }
    Ok(out)
}

/// `max_i wrms(xs[i], ws[i])`: the norm of a sensitivity group.
pub(crate) fn sens_norm<V: Vector>(xs: &[V], ws: &[V]) -> V::T {
    let mut nrm = V::T::zero();
    for (x, w) in xs.iter().zip(ws.iter()) {
        let snrm = x.wrms_norm(w);
        if snrm > nrm {
            nrm = snrm;
        }
    }
    nrm
}

/// Fold an additional subsystem norm into a running combined norm.
pub(crate) fn update_norm<T: Scalar>(old: T, extra: T) -> T {
    if old > extra {
        old
    } else {
        extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    type V = DVector<f64>;

    #[test]
    fn test_ewt_scalar() {
        let y = V::from_vec(vec![1.0, -2.0]);
        let mut tmp = V::zeros(2);
        let mut ewt = V::zeros(2);
        assert!(ewt_set(&y, 0.1, &Atol::Scalar(0.5), &mut tmp, &mut ewt));
        ewt.assert_eq_st(&V::from_vec(vec![1.0 / 0.6, 1.0 / 0.7]), 1e-15);
    }

    #[test]
    fn test_ewt_vector_zero_component_fails() {
        // atol 0 on a component with y = 0 gives a zero weight denominator
        let y = V::from_vec(vec![0.0, 1.0]);
        let atol = Atol::Vector(Rc::new(V::from_vec(vec![0.0, 1e-6])));
        let mut tmp = V::zeros(2);
        let mut ewt = V::zeros(2);
        assert!(!ewt_set(&y, 1e-4, &atol, &mut tmp, &mut ewt));
    }

    #[test]
    fn test_derive_sens_atol() {
        let atol = Atol::<V>::Scalar(1e-6);
        let derived = derive_sens_atol(&atol, &[2.0, -4.0]).unwrap();
        match (&derived[0], &derived[1]) {
            (Atol::Scalar(a0), Atol::Scalar(a1)) => {
                assert!((a0 - 5e-7).abs() < 1e-20);
                assert!((a1 - 2.5e-7).abs() < 1e-20);
            }
            _ => panic!("expected scalar tolerances"),
        }
        assert!(derive_sens_atol(&atol, &[0.0]).is_err());
    }

    #[test]
    fn test_sens_norm_is_max() {
        let xs = [V::from_vec(vec![1.0]), V::from_vec(vec![3.0])];
        let ws = [V::from_vec(vec![1.0]), V::from_vec(vec![1.0])];
        assert_eq!(sens_norm(&xs, &ws), 3.0);
        assert_eq!(update_norm(2.0, 1.0), 2.0);
        assert_eq!(update_norm(1.0, 2.0), 2.0);
    }
}
