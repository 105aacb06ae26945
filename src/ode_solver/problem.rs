use num_traits::{One, Zero};
use crate::error::{NordsolError, OdeSolverError};
use crate::linear_solver::LinearSolver;
use crate::vector::Vector;

use super::coeffs::L_MAX;
use super::equations::{OdeRhs, QuadRhs};
use super::quad::QuadState;
use super::sens::{SensCoupling, SensState};
use super::solver::{MultistepSolver, ETAMX1};
use super::weights::{derive_sens_atol, ewt_set, Atol};
use super::{ErrCon, IterType, Method};

/// Optional sensitivity configuration, with the defaults of
/// [Default::default]: tolerances inherited from the state (absolute ones
/// derived from `pbar`), full error control, automatic difference-quotient
/// scheme selection, and the corrector iteration budget of the state.
pub struct SensOptions<V: Vector> {
    /// Parameter scaling magnitudes, indexed by position in `p`. Required
    /// with the difference-quotient RHS and whenever `atol` is not given.
    pub pbar: Option<Vec<V::T>>,
    /// Parameter selection (1-based, negative drops the `df/dp` term).
    pub plist: Option<Vec<i32>>,
    pub rtol: Option<V::T>,
    pub atol: Option<Vec<Atol<V>>>,
    pub errcon: ErrCon,
    pub rhomax: V::T,
    pub max_nonlin_iters: usize,
}

impl<V: Vector> Default for SensOptions<V> {
    fn default() -> Self {
        Self {
            pbar: None,
            plist: None,
            rtol: None,
            atol: None,
            errcon: ErrCon::Full,
            rhomax: V::T::zero(),
            max_nonlin_iters: 3,
        }
    }
}

impl<V: Vector, F: OdeRhs<V>> MultistepSolver<V, F> {
    /// Provide the problem `(t0, y0)` and tolerances, allocate the history
    /// and work vectors, and build the first error-weight vector.
    ///
    /// A fresh `init` drops any quadrature or sensitivity subsystem;
    /// re-enable them afterwards with [MultistepSolver::quad_init] /
    /// [MultistepSolver::sens_init].
    pub fn init(
        &mut self,
        t0: V::T,
        y0: &V,
        rtol: V::T,
        atol: Atol<V>,
    ) -> Result<(), NordsolError> {
        if y0.is_empty() {
            return Err(OdeSolverError::IllInput("y0 must be non-empty").into());
        }
        if rtol < V::T::zero() {
            return Err(OdeSolverError::NegativeTolerance.into());
        }
        let n = y0.len();
        atol.check(n)?;

        // validation is complete; allocate and reset
        self.n = n;
        self.rtol = rtol;
        self.atol = atol;
        self.hist = super::history::Nordsieck::new(n, self.qmax);
        self.ewt = V::zeros(n);
        self.y = V::zeros(n);
        self.acor = V::zeros(n);
        self.tempv = V::zeros(n);
        self.ftemp = V::zeros(n);
        self.quad = None;
        self.sens = None;
        self.lsolver_ready = false;

        let mut tmp = V::zeros(n);
        if !ewt_set(y0, self.rtol, &self.atol, &mut tmp, &mut self.ewt) {
            return Err(OdeSolverError::EwtInvalid.into());
        }

        self.hist.zn[0].copy_from(y0);
        self.tn = t0;
        self.reset_step_state();
        self.initialized = true;
        Ok(())
    }

    /// Reset to a new `(t0, y0)` while keeping allocations, options and the
    /// linear-solver attachment. The problem size must be unchanged.
    pub fn reinit(
        &mut self,
        t0: V::T,
        y0: &V,
        rtol: V::T,
        atol: Atol<V>,
    ) -> Result<(), NordsolError> {
        if !self.initialized {
            return Err(OdeSolverError::NotInitialized.into());
        }
        if y0.len() != self.n {
            return Err(OdeSolverError::IllInput("reinit with a different problem size").into());
        }
        if rtol < V::T::zero() {
            return Err(OdeSolverError::NegativeTolerance.into());
        }
        atol.check(self.n)?;

        self.rtol = rtol;
        self.atol = atol;
        let mut tmp = V::zeros(self.n);
        if !ewt_set(y0, self.rtol, &self.atol, &mut tmp, &mut self.ewt) {
            return Err(OdeSolverError::EwtInvalid.into());
        }

        self.quad = None;
        self.sens = None;
        self.hist.zn[0].copy_from(y0);
        self.tn = t0;
        self.reset_step_state();
        Ok(())
    }

    fn reset_step_state(&mut self) {
        let zero = V::T::zero();
        self.q = 1;
        self.qprime = 1;
        self.next_q = 1;
        self.qwait = 2;
        self.qu = 0;
        self.h = zero;
        self.hprime = zero;
        self.next_h = zero;
        self.eta = V::T::one();
        self.hscale = zero;
        self.hu = zero;
        self.h0u = zero;
        self.saved_tq5 = V::T::one();
        self.etamax = V::T::from(ETAMX1);
        self.tau = [zero; L_MAX + 1];
        self.tolsf = V::T::one();
        self.conv_rate = V::T::one();
        self.jcur = false;
        self.force_setup = false;
        self.nstlp = 0;
        self.acnrm = zero;
        self.nst = 0;
        self.nfe = 0;
        self.ncfn = 0;
        self.netf = 0;
        self.nni = 0;
        self.nsetups = 0;
        self.nhnil = 0;
        self.nscon = 0;
        self.nor = 0;
        self.ssdat = [[zero; 3]; 5];
    }

    /// Replace the parameter vector passed to every RHS evaluation.
    pub fn set_params(&mut self, p: V) {
        self.p = p;
    }

    /// Register the linear solver used by the Newton corrector. Its `init`
    /// runs on the first driver call.
    pub fn attach_linear_solver(&mut self, ls: Box<dyn LinearSolver<V>>) {
        self.lsolver = Some(ls);
        self.lsolver_ready = false;
    }

    /// Switch the corrector family between calls.
    pub fn set_iter_type(&mut self, iter: IterType) {
        self.iter = iter;
        if iter == IterType::Newton {
            self.force_setup = true;
        }
    }

    /// Cap the method order; can only lower the family maximum.
    pub fn set_max_ord(&mut self, maxord: usize) -> Result<(), NordsolError> {
        if maxord == 0 {
            return Err(OdeSolverError::IllInput("maxord must be positive").into());
        }
        if maxord > self.qmax {
            return Err(OdeSolverError::IllInput("maxord may not be increased").into());
        }
        self.qmax = maxord;
        Ok(())
    }

    /// Bound on internal steps per driver call.
    pub fn set_max_num_steps(&mut self, mxstep: usize) -> Result<(), NordsolError> {
        if mxstep == 0 {
            return Err(OdeSolverError::IllInput("mxstep must be positive").into());
        }
        self.mxstep = mxstep;
        Ok(())
    }

    /// How many step-size-at-roundoff warnings are emitted.
    pub fn set_max_hnil_warns(&mut self, mxhnil: usize) -> Result<(), NordsolError> {
        self.mxhnil = mxhnil;
        Ok(())
    }

    /// Toggle BDF stability-limit detection.
    pub fn set_stab_lim_det(&mut self, on: bool) -> Result<(), NordsolError> {
        if self.method != Method::Bdf {
            return Err(OdeSolverError::IllInput(
                "stability limit detection applies to the BDF family only",
            )
            .into());
        }
        self.sldet_on = on;
        Ok(())
    }

    /// User-chosen first step size (0 restores the internal estimate).
    pub fn set_init_step(&mut self, hin: V::T) -> Result<(), NordsolError> {
        self.hin = hin;
        Ok(())
    }

    pub fn set_min_step(&mut self, hmin: V::T) -> Result<(), NordsolError> {
        if hmin < V::T::zero() {
            return Err(OdeSolverError::IllInput("hmin must be non-negative").into());
        }
        if self.hmax_inv > V::T::zero() && hmin * self.hmax_inv > V::T::one() {
            return Err(OdeSolverError::IllInput("hmin must not exceed hmax").into());
        }
        self.hmin = hmin;
        Ok(())
    }

    pub fn set_max_step(&mut self, hmax: V::T) -> Result<(), NordsolError> {
        if hmax <= V::T::zero() {
            return Err(OdeSolverError::IllInput("hmax must be positive").into());
        }
        let hmax_inv = V::T::one() / hmax;
        if self.hmin * hmax_inv > V::T::one() {
            return Err(OdeSolverError::IllInput("hmax must not be below hmin").into());
        }
        self.hmax_inv = hmax_inv;
        Ok(())
    }

    /// Hard stop time for the `*Tstop` tasks.
    pub fn set_stop_time(&mut self, tstop: V::T) -> Result<(), NordsolError> {
        self.tstop = Some(tstop);
        Ok(())
    }

    pub fn clear_stop_time(&mut self) {
        self.tstop = None;
    }

    pub fn set_max_err_test_fails(&mut self, maxnef: usize) -> Result<(), NordsolError> {
        if maxnef == 0 {
            return Err(OdeSolverError::IllInput("maxnef must be positive").into());
        }
        self.maxnef = maxnef;
        Ok(())
    }

    pub fn set_max_conv_fails(&mut self, maxncf: usize) -> Result<(), NordsolError> {
        if maxncf == 0 {
            return Err(OdeSolverError::IllInput("maxncf must be positive").into());
        }
        self.maxncf = maxncf;
        Ok(())
    }

    pub fn set_max_nonlin_iters(&mut self, maxcor: usize) -> Result<(), NordsolError> {
        if maxcor == 0 {
            return Err(OdeSolverError::IllInput("maxcor must be positive").into());
        }
        self.maxcor = maxcor;
        Ok(())
    }

    /// Coefficient in the corrector convergence test (`tq[4] = c * tq[2]`).
    pub fn set_nonlin_conv_coef(&mut self, nlscoef: V::T) -> Result<(), NordsolError> {
        if nlscoef <= V::T::zero() {
            return Err(OdeSolverError::IllInput("nlscoef must be positive").into());
        }
        self.nlscoef = nlscoef;
        Ok(())
    }

    /// Enable quadrature integration of `q' = fQ(t, y, p)` starting from
    /// `yq0`, with its own tolerances.
    pub fn quad_init(
        &mut self,
        fq: impl QuadRhs<V> + 'static,
        yq0: &V,
        rtol: V::T,
        atol: Atol<V>,
    ) -> Result<(), NordsolError> {
        if !self.initialized {
            return Err(OdeSolverError::NotInitialized.into());
        }
        if yq0.is_empty() {
            return Err(OdeSolverError::IllInput("yq0 must be non-empty").into());
        }
        if rtol < V::T::zero() {
            return Err(OdeSolverError::NegativeTolerance.into());
        }
        let nq = yq0.len();
        atol.check(nq)?;

        let mut state = QuadState::new(Box::new(fq), nq, rtol, atol);
        let mut tmp = V::zeros(nq);
        if !ewt_set(yq0, state.rtol, &state.atol, &mut tmp, &mut state.ewt) {
            return Err(OdeSolverError::EwtInvalid.into());
        }
        self.hist.enable_quad(nq);
        self.hist.znq[0].copy_from(yq0);
        state.yq.copy_from(yq0);
        self.quad = Some(state);
        Ok(())
    }

    /// Reset the quadrature variables to `yq0`, keeping the RHS and
    /// allocations.
    pub fn quad_reinit(
        &mut self,
        yq0: &V,
        rtol: V::T,
        atol: Atol<V>,
    ) -> Result<(), NordsolError> {
        let Some(qd) = self.quad.as_mut() else {
            return Err(OdeSolverError::QuadNotInitialized.into());
        };
        if yq0.len() != qd.nq {
            return Err(OdeSolverError::IllInput("quad_reinit with a different size").into());
        }
        if rtol < V::T::zero() {
            return Err(OdeSolverError::NegativeTolerance.into());
        }
        atol.check(qd.nq)?;
        qd.rtol = rtol;
        qd.atol = atol;
        let mut tmp = V::zeros(qd.nq);
        if !ewt_set(yq0, qd.rtol, &qd.atol, &mut tmp, &mut qd.ewt) {
            return Err(OdeSolverError::EwtInvalid.into());
        }
        qd.yq.copy_from(yq0);
        qd.nfqe = 0;
        qd.netf = 0;
        for col in self.hist.znq.iter_mut() {
            col.fill(V::T::zero());
        }
        self.hist.znq[0].copy_from(yq0);
        Ok(())
    }

    /// Whether quadrature variables take part in the step error test.
    pub fn set_quad_err_con(&mut self, errcon: ErrCon) -> Result<(), NordsolError> {
        let Some(qd) = self.quad.as_mut() else {
            return Err(OdeSolverError::QuadNotInitialized.into());
        };
        qd.errcon = errcon;
        Ok(())
    }

    /// Enable forward sensitivity analysis with the given coupling, RHS
    /// supplier, parameters and initial sensitivities.
    pub fn sens_init(
        &mut self,
        coupling: SensCoupling<V>,
        p: V,
        ys0: &[V],
        opts: SensOptions<V>,
    ) -> Result<(), NordsolError> {
        if !self.initialized {
            return Err(OdeSolverError::NotInitialized.into());
        }
        let ns = ys0.len();
        if ns == 0 {
            return Err(OdeSolverError::IllInput("at least one sensitivity is required").into());
        }
        for s in ys0 {
            if s.len() != self.n {
                return Err(OdeSolverError::IllInput("sensitivity shape mismatch").into());
            }
        }
        if let Some(plist) = opts.plist.as_ref() {
            if plist.len() != ns {
                return Err(OdeSolverError::IllInput("plist must have one entry per sensitivity").into());
            }
            for &pi in plist {
                if pi == 0 || (pi.unsigned_abs() as usize) > p.len() {
                    return Err(OdeSolverError::IllInput("plist entry out of range").into());
                }
            }
        } else if ns > p.len() {
            return Err(OdeSolverError::IllInput("more sensitivities than parameters").into());
        }
        if let Some(pbar) = opts.pbar.as_ref() {
            if pbar.len() != p.len() {
                return Err(OdeSolverError::IllInput("pbar must have one entry per parameter").into());
            }
        }
        let needs_pbar = coupling.is_dq() || opts.atol.is_none();
        if needs_pbar && opts.pbar.is_none() {
            return Err(OdeSolverError::IllInput(
                "pbar is required for difference-quotient sensitivities or derived tolerances",
            )
            .into());
        }
        let rtol_s = opts.rtol.unwrap_or(self.rtol);
        if rtol_s < V::T::zero() {
            return Err(OdeSolverError::NegativeTolerance.into());
        }
        if opts.max_nonlin_iters == 0 {
            return Err(OdeSolverError::IllInput("maxcor must be positive").into());
        }

        let atol_s = match opts.atol {
            Some(atols) => {
                if atols.len() != ns {
                    return Err(OdeSolverError::IllInput("one atol per sensitivity is required").into());
                }
                for a in &atols {
                    a.check(self.n)?;
                }
                atols
            }
            None => {
                // derive per-selected-parameter tolerances from pbar
                let pbar = opts.pbar.as_ref().unwrap();
                let selected: Vec<V::T> = (0..ns)
                    .map(|is| {
                        let which = match opts.plist.as_ref() {
                            Some(plist) => (plist[is].unsigned_abs() as usize) - 1,
                            None => is,
                        };
                        pbar[which]
                    })
                    .collect();
                derive_sens_atol(&self.atol, &selected)?
            }
        };

        let mut state = SensState::new(
            coupling,
            ns,
            self.n,
            rtol_s,
            atol_s,
            opts.pbar.unwrap_or_default(),
            opts.plist.unwrap_or_default(),
            opts.rhomax,
            opts.max_nonlin_iters,
        );
        state.errcon = opts.errcon;

        let mut tmp = V::zeros(self.n);
        for is in 0..ns {
            if !ewt_set(&ys0[is], state.rtol, &state.atol[is], &mut tmp, &mut state.ewt[is]) {
                return Err(OdeSolverError::EwtInvalid.into());
            }
        }

        self.p = p;
        self.hist.enable_sens(ns);
        for is in 0..ns {
            self.hist.zns[is][0].copy_from(&ys0[is]);
        }
        self.sens = Some(state);
        Ok(())
    }

    /// Reset the sensitivity vectors (and optionally the coupling mode),
    /// keeping tolerances and allocations.
    pub fn sens_reinit(
        &mut self,
        coupling: SensCoupling<V>,
        ys0: &[V],
    ) -> Result<(), NordsolError> {
        let Some(s) = self.sens.as_mut() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        if ys0.len() != s.ns {
            return Err(OdeSolverError::IllInput("sens_reinit with a different count").into());
        }
        for v in ys0 {
            if v.len() != self.n {
                return Err(OdeSolverError::IllInput("sensitivity shape mismatch").into());
            }
        }
        if coupling.is_dq() && s.pbar.is_empty() {
            return Err(OdeSolverError::IllInput(
                "pbar is required for difference-quotient sensitivities",
            )
            .into());
        }
        s.coupling = coupling;

        let mut tmp = V::zeros(self.n);
        for is in 0..s.ns {
            if !ewt_set(&ys0[is], s.rtol, &s.atol[is], &mut tmp, &mut s.ewt[is]) {
                return Err(OdeSolverError::EwtInvalid.into());
            }
        }
        s.nfse = 0;
        s.nfes = 0;
        s.nni = 0;
        s.ncfn = 0;
        s.netf = 0;
        s.nsetups = 0;
        s.nni1.iter_mut().for_each(|c| *c = 0);
        s.ncfn1.iter_mut().for_each(|c| *c = 0);

        for (is, v) in ys0.iter().enumerate() {
            for col in self.hist.zns[is].iter_mut() {
                col.fill(V::T::zero());
            }
            self.hist.zns[is][0].copy_from(v);
        }
        Ok(())
    }

    pub fn set_sens_err_con(&mut self, errcon: ErrCon) -> Result<(), NordsolError> {
        let Some(s) = self.sens.as_mut() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        s.errcon = errcon;
        Ok(())
    }

    /// Difference-quotient scheme selector (see the DQ documentation).
    pub fn set_sens_rho(&mut self, rhomax: V::T) -> Result<(), NordsolError> {
        let Some(s) = self.sens.as_mut() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        s.rhomax = rhomax;
        Ok(())
    }

    /// Replace the parameter scaling magnitudes.
    pub fn set_sens_pbar(&mut self, pbar: Vec<V::T>) -> Result<(), NordsolError> {
        if pbar.len() != self.p.len() {
            return Err(OdeSolverError::IllInput("pbar must have one entry per parameter").into());
        }
        let Some(s) = self.sens.as_mut() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        s.pbar = pbar;
        Ok(())
    }

    /// Replace the sensitivity tolerances.
    pub fn set_sens_tolerances(
        &mut self,
        rtol: V::T,
        atol: Vec<Atol<V>>,
    ) -> Result<(), NordsolError> {
        if rtol < V::T::zero() {
            return Err(OdeSolverError::NegativeTolerance.into());
        }
        let n = self.n;
        let Some(s) = self.sens.as_mut() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        if atol.len() != s.ns {
            return Err(OdeSolverError::IllInput("one atol per sensitivity is required").into());
        }
        for a in &atol {
            a.check(n)?;
        }
        s.rtol = rtol;
        s.atol = atol;
        Ok(())
    }

    pub fn set_sens_max_nonlin_iters(&mut self, maxcor: usize) -> Result<(), NordsolError> {
        if maxcor == 0 {
            return Err(OdeSolverError::IllInput("maxcor must be positive").into());
        }
        let Some(s) = self.sens.as_mut() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        s.maxcor = maxcor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode_solver::equations::RhsResult;
    use nalgebra::DVector;
    use std::rc::Rc;

    type V = DVector<f64>;

    fn decay(_t: f64, y: &V, _p: &V, ydot: &mut V) -> RhsResult {
        ydot.copy_from(y);
        *ydot *= crate::scalar::scale(-1.0);
        Ok(())
    }

    fn solver() -> MultistepSolver<V, fn(f64, &V, &V, &mut V) -> RhsResult> {
        MultistepSolver::new(Method::Adams, IterType::Functional, decay)
    }

    #[test]
    fn test_init_validates_tolerances() {
        let mut s = solver();
        let y0 = V::from_vec(vec![1.0]);
        assert!(s.init(0.0, &y0, -1.0, Atol::Scalar(1e-8)).is_err());
        assert!(s.init(0.0, &y0, 1e-6, Atol::Scalar(-1.0)).is_err());
        let bad_len = Atol::Vector(Rc::new(V::from_vec(vec![1e-8, 1e-8])));
        assert!(s.init(0.0, &y0, 1e-6, bad_len).is_err());
        assert!(s.init(0.0, &y0, 1e-6, Atol::Scalar(1e-8)).is_ok());
    }

    #[test]
    fn test_init_rejects_zero_weight() {
        let mut s = solver();
        // y0 = 0 with a zero atol entry makes a weight denominator vanish
        let y0 = V::from_vec(vec![0.0]);
        let atol = Atol::Vector(Rc::new(V::from_vec(vec![0.0])));
        let err = s.init(0.0, &y0, 1e-6, atol).unwrap_err();
        assert!(matches!(
            err,
            NordsolError::OdeSolverError(OdeSolverError::EwtInvalid)
        ));
    }

    #[test]
    fn test_option_ranges() {
        let mut s = solver();
        assert!(s.set_max_ord(0).is_err());
        assert!(s.set_max_ord(13).is_err());
        assert!(s.set_max_ord(5).is_ok());
        // cannot raise the cap again once lowered
        assert!(s.set_max_ord(6).is_err());
        assert!(s.set_max_num_steps(0).is_err());
        assert!(s.set_max_step(0.0).is_err());
        assert!(s.set_max_step(1.0).is_ok());
        assert!(s.set_min_step(2.0).is_err());
        assert!(s.set_min_step(0.5).is_ok());
        assert!(s.set_nonlin_conv_coef(0.0).is_err());
        // Adams family has no stability-limit detector
        assert!(s.set_stab_lim_det(true).is_err());
    }

    #[test]
    fn test_subsystem_init_requires_state() {
        let mut s = solver();
        let yq0 = V::from_vec(vec![0.0]);
        let r = s.quad_init(
            |_t: f64, _y: &V, _p: &V, q: &mut V| -> RhsResult {
                q.fill(0.0);
                Ok(())
            },
            &yq0,
            1e-6,
            Atol::Scalar(1e-8),
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_sens_init_requires_pbar_for_dq() {
        use crate::ode_solver::sens::{SensCoupling, SensRhsFn};
        let mut s = solver();
        let y0 = V::from_vec(vec![1.0]);
        s.init(0.0, &y0, 1e-6, Atol::Scalar(1e-8)).unwrap();
        let ys0 = [V::from_vec(vec![0.0])];
        let r = s.sens_init(
            SensCoupling::Staggered(SensRhsFn::DiffQuotient),
            V::from_vec(vec![1.0]),
            &ys0,
            SensOptions::default(),
        );
        assert!(r.is_err());
        let r = s.sens_init(
            SensCoupling::Staggered(SensRhsFn::DiffQuotient),
            V::from_vec(vec![1.0]),
            &ys0,
            SensOptions {
                pbar: Some(vec![1.0]),
                ..Default::default()
            },
        );
        assert!(r.is_ok());
    }
}
