use num_traits::Zero;
use crate::vector::Vector;

use super::equations::QuadRhs;
use super::weights::Atol;
use super::ErrCon;

/// Quadrature subsystem state.
///
/// Quadrature variables `q' = fQ(t, y)` ride along on the Nordsieck history
/// (`znq`) but never feed back into the state equations; after the state
/// corrector has converged, a single explicit correction advances them, and
/// they participate in the local error test only under [ErrCon::Full]
/// control.
pub(crate) struct QuadState<V: Vector> {
    pub fq: Box<dyn QuadRhs<V>>,
    pub nq: usize,
    pub rtol: V::T,
    pub atol: Atol<V>,
    pub errcon: ErrCon,
    pub yq: V,
    pub acor: V,
    pub ewt: V,
    pub tempv: V,
    pub acnrm: V::T,
    pub nfqe: usize,
    pub netf: usize,
}

impl<V: Vector> QuadState<V> {
    pub(crate) fn new(fq: Box<dyn QuadRhs<V>>, nq: usize, rtol: V::T, atol: Atol<V>) -> Self {
        Self {
            fq,
            nq,
            rtol,
            atol,
            errcon: ErrCon::Full,
            yq: V::zeros(nq),
            acor: V::zeros(nq),
            ewt: V::zeros(nq),
            tempv: V::zeros(nq),
            acnrm: V::T::zero(),
            nfqe: 0,
            netf: 0,
        }
    }

    /// Whether quadrature norms are folded into error control decisions.
    pub(crate) fn in_error_test(&self) -> bool {
        self.errcon == ErrCon::Full
    }
}
