use num_traits::{One, Zero};
use nalgebra::ComplexField;
use crate::scalar::Scalar;
use crate::vector::Vector;

use super::equations::{OdeRhs, RhsResult, SensRhs1, SensRhsAll};
use super::weights::Atol;
use super::ErrCon;

/// How the sensitivity corrector is coupled to the state corrector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SensMethod {
    /// One corrector on the combined `(y, s_1, .., s_ns)` system.
    Simultaneous,
    /// State corrector first, then one corrector over all sensitivities.
    Staggered,
    /// State corrector first, then one corrector per sensitivity.
    Staggered1,
}

/// A sensitivity RHS supplier usable with the simultaneous or staggered
/// couplings.
pub enum SensRhsFn<V: Vector> {
    /// All `ns` right-hand sides in one call.
    All(Box<dyn SensRhsAll<V>>),
    /// One right-hand side per call.
    One(Box<dyn SensRhs1<V>>),
    /// Difference-quotient approximation from `f` and the parameters.
    DiffQuotient,
}

/// A sensitivity RHS supplier usable with the one-at-a-time staggered
/// coupling. The all-at-once shape is absent by construction: that corrector
/// updates a single sensitivity per solve and an all-at-once supplier cannot
/// serve it.
pub enum SensRhs1Fn<V: Vector> {
    One(Box<dyn SensRhs1<V>>),
    DiffQuotient,
}

/// Coupling mode together with its RHS supplier.
pub enum SensCoupling<V: Vector> {
    Simultaneous(SensRhsFn<V>),
    Staggered(SensRhsFn<V>),
    Staggered1(SensRhs1Fn<V>),
}

impl<V: Vector> SensCoupling<V> {
    pub fn method(&self) -> SensMethod {
        match self {
            SensCoupling::Simultaneous(_) => SensMethod::Simultaneous,
            SensCoupling::Staggered(_) => SensMethod::Staggered,
            SensCoupling::Staggered1(_) => SensMethod::Staggered1,
        }
    }

    pub(crate) fn is_dq(&self) -> bool {
        matches!(
            self,
            SensCoupling::Simultaneous(SensRhsFn::DiffQuotient)
                | SensCoupling::Staggered(SensRhsFn::DiffQuotient)
                | SensCoupling::Staggered1(SensRhs1Fn::DiffQuotient)
        )
    }
}

/// Sensitivity subsystem state: coupling, tolerances, parameter scalings,
/// work vectors and counters.
pub(crate) struct SensState<V: Vector> {
    pub coupling: SensCoupling<V>,
    pub ns: usize,
    /// Scaling magnitudes `pbar[i]`, used for derived tolerances and the DQ
    /// increments. Empty when not supplied.
    pub pbar: Vec<V::T>,
    /// Parameter selection: `|plist[i]| - 1` indexes `p`; a negative entry
    /// drops the partial-derivative term from the DQ approximation. Empty
    /// means the identity selection.
    pub plist: Vec<i32>,
    pub rtol: V::T,
    pub atol: Vec<Atol<V>>,
    pub errcon: ErrCon,
    /// Selector between centered/forward DQ formulas; 0 picks centered with
    /// the default cutover.
    pub rhomax: V::T,
    pub maxcor: usize,
    pub ys: Vec<V>,
    pub acor: Vec<V>,
    pub ewt: Vec<V>,
    pub tempv: Vec<V>,
    pub ftemp: Vec<V>,
    /// Dedicated DQ scratch, so the evaluation borrows no other work vector.
    pub ytemp_dq: V,
    pub ftemp_dq: V,
    pub acnrm: V::T,
    pub conv_rate: V::T,
    pub nfse: usize,
    pub nfes: usize,
    pub nni: usize,
    pub ncfn: usize,
    pub netf: usize,
    pub nsetups: usize,
    pub nni1: Vec<usize>,
    pub ncfn1: Vec<usize>,
    /// Per-sensitivity convergence failures within the current step attempt.
    pub ncf1_step: Vec<usize>,
}

impl<V: Vector> SensState<V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        coupling: SensCoupling<V>,
        ns: usize,
        n: usize,
        rtol: V::T,
        atol: Vec<Atol<V>>,
        pbar: Vec<V::T>,
        plist: Vec<i32>,
        rhomax: V::T,
        maxcor: usize,
    ) -> Self {
        let mk = || (0..ns).map(|_| V::zeros(n)).collect::<Vec<_>>();
        Self {
            coupling,
            ns,
            pbar,
            plist,
            rtol,
            atol,
            errcon: ErrCon::Full,
            rhomax,
            maxcor,
            ys: mk(),
            acor: mk(),
            ewt: mk(),
            tempv: mk(),
            ftemp: mk(),
            ytemp_dq: V::zeros(n),
            ftemp_dq: V::zeros(n),
            acnrm: V::T::zero(),
            conv_rate: V::T::one(),
            nfse: 0,
            nfes: 0,
            nni: 0,
            ncfn: 0,
            netf: 0,
            nsetups: 0,
            nni1: vec![0; ns],
            ncfn1: vec![0; ns],
            ncf1_step: vec![0; ns],
        }
    }

    /// Parameter index and skip flag for sensitivity `is`.
    pub(crate) fn param_index(&self, is: usize) -> (usize, bool) {
        if self.plist.is_empty() {
            (is, false)
        } else {
            let pi = self.plist[is];
            ((pi.unsigned_abs() as usize).saturating_sub(1), pi < 0)
        }
    }
}

/// One sensitivity-RHS evaluation, with every piece of solver state it may
/// touch borrowed up front. Built fresh at each call site so the borrows
/// stay disjoint from the vectors being read and written.
pub(crate) struct SensRhsEval<'a, V: Vector> {
    pub coupling: &'a SensCoupling<V>,
    pub p: &'a mut V,
    pub pbar: &'a [V::T],
    pub plist: &'a [i32],
    pub ewt: &'a V,
    pub rtol: V::T,
    pub rhomax: V::T,
    pub ytemp: &'a mut V,
    pub ftemp: &'a mut V,
    pub nfse: &'a mut usize,
    pub nfes: &'a mut usize,
}

/// DQ formula selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DqScheme {
    Centered1,
    Centered2,
    Forward1,
    Forward2,
}

impl<'a, V: Vector> SensRhsEval<'a, V> {
    /// Evaluate all `ns` sensitivity right-hand sides:
    /// `ysdot[i] = (df/dy) ys[i] + df/dp_i`.
    pub fn all<F: OdeRhs<V>>(
        &mut self,
        f: &F,
        t: V::T,
        y: &V,
        ydot: &V,
        ys: &[V],
        ysdot: &mut [V],
    ) -> RhsResult {
        match self.coupling {
            SensCoupling::Simultaneous(SensRhsFn::All(user))
            | SensCoupling::Staggered(SensRhsFn::All(user)) => {
                let r = user.call(t, y, ydot, self.p, ys, ysdot);
                *self.nfse += 1;
                r
            }
            SensCoupling::Simultaneous(SensRhsFn::One(user))
            | SensCoupling::Staggered(SensRhsFn::One(user))
            | SensCoupling::Staggered1(SensRhs1Fn::One(user)) => {
                for (is, (ysi, ysdoti)) in ys.iter().zip(ysdot.iter_mut()).enumerate() {
                    user.call(t, y, ydot, self.p, is, ysi, ysdoti)?;
                    *self.nfse += 1;
                }
                Ok(())
            }
            SensCoupling::Simultaneous(SensRhsFn::DiffQuotient)
            | SensCoupling::Staggered(SensRhsFn::DiffQuotient)
            | SensCoupling::Staggered1(SensRhs1Fn::DiffQuotient) => {
                for (is, (ysi, ysdoti)) in ys.iter().zip(ysdot.iter_mut()).enumerate() {
                    self.dq1(f, t, y, ydot, is, ysi, ysdoti)?;
                }
                Ok(())
            }
        }
    }

    /// Evaluate the right-hand side of the `is`-th sensitivity only. Used by
    /// the one-at-a-time staggered corrector, whose construction guarantees a
    /// per-index supplier.
    pub fn one<F: OdeRhs<V>>(
        &mut self,
        f: &F,
        t: V::T,
        y: &V,
        ydot: &V,
        is: usize,
        ysi: &V,
        ysdoti: &mut V,
    ) -> RhsResult {
        match self.coupling {
            SensCoupling::Staggered1(SensRhs1Fn::One(user)) => {
                let r = user.call(t, y, ydot, self.p, is, ysi, ysdoti);
                *self.nfse += 1;
                r
            }
            SensCoupling::Staggered1(SensRhs1Fn::DiffQuotient) => {
                self.dq1(f, t, y, ydot, is, ysi, ysdoti)
            }
            _ => unreachable!("per-index evaluation outside the one-at-a-time coupling"),
        }
    }

    /// Difference-quotient approximation of one sensitivity RHS.
    ///
    /// Chooses between centered and forward differences and between a
    /// combined state+parameter perturbation ("1" schemes, one evaluation
    /// pair) and separate perturbations ("2" schemes, two pairs), comparing
    /// the optimal state increment with the optimal parameter increment
    /// against `|rhomax|`. The perturbed parameter is restored before
    /// returning, also on failure.
    fn dq1<F: OdeRhs<V>>(
        &mut self,
        f: &F,
        t: V::T,
        y: &V,
        ydot: &V,
        is: usize,
        ysi: &V,
        ysdoti: &mut V,
    ) -> RhsResult {
        let one = V::T::one();
        let half = V::T::from(0.5);
        let uround = V::T::EPSILON;

        let (which, skip_fp) = if self.plist.is_empty() {
            (is, false)
        } else {
            let pi = self.plist[is];
            ((pi.unsigned_abs() as usize).saturating_sub(1), pi < 0)
        };
        let psave = self.p.get_index(which);
        let pbari = self.pbar[which].abs();

        let delta = {
            let r = if self.rtol > uround { self.rtol } else { uround };
            r.sqrt()
        };
        let rdelta = one / delta;

        let delta_p = pbari * delta;
        let rdelta_p = one / delta_p;
        let norms = ysi.wrms_norm(self.ewt) * pbari;
        let max_d = if norms > rdelta { norms } else { rdelta };
        let rdelta_y = max_d / pbari;
        let delta_y = one / rdelta_y;

        let ratio = delta_y * rdelta_p;
        let rho = self.rhomax.abs();
        let max_ratio = if ratio > one / ratio { ratio } else { one / ratio };

        let scheme = if max_ratio <= rho || self.rhomax == V::T::zero() {
            if self.rhomax >= V::T::zero() {
                DqScheme::Centered1
            } else {
                DqScheme::Forward1
            }
        } else if self.rhomax > V::T::zero() {
            DqScheme::Centered2
        } else {
            DqScheme::Forward2
        };

        let result = (|| -> RhsResult {
            match scheme {
                DqScheme::Centered1 => {
                    let del = if delta_y < delta_p { delta_y } else { delta_p };
                    let r2del = half / del;

                    self.ytemp.linear_sum(one, y, del, ysi);
                    self.p.set_index(which, psave + del);
                    f.call(t, self.ytemp, self.p, ysdoti)?;
                    *self.nfes += 1;

                    self.ytemp.linear_sum(one, y, -del, ysi);
                    self.p.set_index(which, psave - del);
                    f.call(t, self.ytemp, self.p, self.ftemp)?;
                    *self.nfes += 1;

                    ysdoti.axpy(-r2del, self.ftemp, r2del);
                }
                DqScheme::Centered2 => {
                    let r2delp = half / delta_p;
                    let r2dely = half / delta_y;

                    self.ytemp.linear_sum(one, y, delta_y, ysi);
                    f.call(t, self.ytemp, self.p, ysdoti)?;
                    *self.nfes += 1;
                    self.ytemp.linear_sum(one, y, -delta_y, ysi);
                    f.call(t, self.ytemp, self.p, self.ftemp)?;
                    *self.nfes += 1;
                    ysdoti.axpy(-r2dely, self.ftemp, r2dely);

                    if !skip_fp {
                        self.p.set_index(which, psave + delta_p);
                        f.call(t, y, self.p, self.ytemp)?;
                        *self.nfes += 1;
                        self.p.set_index(which, psave - delta_p);
                        f.call(t, y, self.p, self.ftemp)?;
                        *self.nfes += 1;
                        self.ftemp.axpy(r2delp, self.ytemp, -r2delp);
                        ysdoti.axpy(one, self.ftemp, one);
                    }
                }
                DqScheme::Forward1 => {
                    let del = if delta_y < delta_p { delta_y } else { delta_p };
                    let rdel = one / del;

                    self.ytemp.linear_sum(one, y, del, ysi);
                    self.p.set_index(which, psave + del);
                    f.call(t, self.ytemp, self.p, ysdoti)?;
                    *self.nfes += 1;

                    ysdoti.axpy(-rdel, ydot, rdel);
                }
                DqScheme::Forward2 => {
                    let rdely = one / delta_y;
                    self.ytemp.linear_sum(one, y, delta_y, ysi);
                    f.call(t, self.ytemp, self.p, ysdoti)?;
                    *self.nfes += 1;
                    ysdoti.axpy(-rdely, ydot, rdely);

                    if !skip_fp {
                        let rdelp = one / delta_p;
                        self.p.set_index(which, psave + delta_p);
                        f.call(t, y, self.p, self.ytemp)?;
                        *self.nfes += 1;
                        self.ftemp.linear_sum(rdelp, self.ytemp, -rdelp, ydot);
                        ysdoti.axpy(one, self.ftemp, one);
                    }
                }
            }
            Ok(())
        })();

        self.p.set_index(which, psave);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::scale;
    use nalgebra::DVector;

    type V = DVector<f64>;

    fn eval_ctx<'a>(
        coupling: &'a SensCoupling<V>,
        p: &'a mut V,
        pbar: &'a [f64],
        ewt: &'a V,
        ytemp: &'a mut V,
        ftemp: &'a mut V,
        nfse: &'a mut usize,
        nfes: &'a mut usize,
        rhomax: f64,
    ) -> SensRhsEval<'a, V> {
        SensRhsEval {
            coupling,
            p,
            pbar,
            plist: &[],
            ewt,
            rtol: 1e-6,
            rhomax,
            ytemp,
            ftemp,
            nfse,
            nfes,
        }
    }

    /// DQ sensitivity RHS of y' = -p*y against the analytic
    /// sdot = -p*s - y.
    #[test]
    fn test_dq_matches_analytic() {
        let f = |_t: f64, y: &V, p: &V, ydot: &mut V| -> RhsResult {
            ydot.copy_from(y);
            *ydot *= scale(-p[0]);
            Ok(())
        };
        for rhomax in [0.0, -1.0] {
            let coupling = SensCoupling::<V>::Staggered(SensRhsFn::DiffQuotient);
            let mut p = V::from_vec(vec![2.0]);
            let pbar = [2.0];
            let ewt = V::from_element(1, 1.0);
            let mut ytemp = V::zeros(1);
            let mut ftemp = V::zeros(1);
            let (mut nfse, mut nfes) = (0usize, 0usize);
            let mut ev = eval_ctx(
                &coupling, &mut p, &pbar, &ewt, &mut ytemp, &mut ftemp, &mut nfse, &mut nfes,
                rhomax,
            );

            let y = V::from_vec(vec![0.5]);
            let mut ydot = V::zeros(1);
            f(0.0, &y, &V::from_vec(vec![2.0]), &mut ydot).unwrap();
            let ys = [V::from_vec(vec![-0.25])];
            let mut ysdot = [V::zeros(1)];
            ev.all(&f, 0.0, &y, &ydot, &ys, &mut ysdot).unwrap();

            // sdot = -p*s - y = -2*(-0.25) - 0.5 = 0.0; the forward schemes
            // carry an O(delta) truncation error, the centered ones are exact
            // on this bilinear f
            assert!(ysdot[0][0].abs() < 1e-3, "scheme rhomax={rhomax}");
            // parameter restored after perturbation
            assert_eq!(p[0], 2.0);
            assert!(nfes > 0);
        }
    }

    #[test]
    fn test_user_supplier_one_at_a_time() {
        let fs1 = |_t: f64, _y: &V, _ydot: &V, _p: &V, is: usize, _ys: &V, ysdot: &mut V| -> RhsResult {
            ysdot.fill(is as f64);
            Ok(())
        };
        let coupling = SensCoupling::<V>::Staggered1(SensRhs1Fn::One(Box::new(fs1)));
        let f = |_t: f64, _y: &V, _p: &V, _ydot: &mut V| -> RhsResult { Ok(()) };
        let mut p = V::zeros(0);
        let pbar = [];
        let ewt = V::from_element(1, 1.0);
        let mut ytemp = V::zeros(1);
        let mut ftemp = V::zeros(1);
        let (mut nfse, mut nfes) = (0usize, 0usize);
        let mut ev = eval_ctx(
            &coupling, &mut p, &pbar, &ewt, &mut ytemp, &mut ftemp, &mut nfse, &mut nfes, 0.0,
        );
        let y = V::zeros(1);
        let ydot = V::zeros(1);
        let ysi = V::zeros(1);
        let mut out = V::zeros(1);
        ev.one(&f, 0.0, &y, &ydot, 1, &ysi, &mut out).unwrap();
        assert_eq!(out[0], 1.0);
        assert_eq!(nfse, 1);
    }

    #[test]
    fn test_param_index_plist() {
        let st = |plist: Vec<i32>| SensState::<V>::new(
            SensCoupling::Staggered(SensRhsFn::DiffQuotient),
            2,
            1,
            1e-6,
            vec![Atol::Scalar(1e-8), Atol::Scalar(1e-8)],
            vec![1.0, 1.0],
            plist,
            0.0,
            3,
        );
        assert_eq!(st(vec![]).param_index(1), (1, false));
        assert_eq!(st(vec![3, -2]).param_index(0), (2, false));
        assert_eq!(st(vec![3, -2]).param_index(1), (1, true));
    }
}
