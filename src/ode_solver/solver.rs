use num_traits::{One, Pow, Zero};
use nalgebra::ComplexField;
use serde::Serialize;

use crate::error::{NordsolError, OdeSolverError};
use crate::linear_solver::LinearSolver;
use crate::scalar::{scale, Scalar};
use crate::vector::{column_pair, Vector};

use super::coeffs::{MethodCoeffs, ADAMS_Q_MAX, BDF_Q_MAX, L_MAX};
use super::equations::{OdeRhs, RhsError};
use super::history::Nordsieck;
use super::nonlinear::{CfTarget, DotSel, NlsFlag, NlsOutcome, OutSel, StepAttempt, YSel};
use super::quad::QuadState;
use super::sens::{SensMethod, SensState};
use super::sldet::{dominant_root, shift_and_store};
use super::weights::{ewt_set, update_norm, Atol};
use super::{ErrCon, IterType, Method, SolveStatus, Task};

// Step-size heuristics.
pub(crate) const THRESH: f64 = 1.5;
pub(crate) const ETAMX1: f64 = 10000.0;
pub(crate) const ETAMX2: f64 = 10.0;
pub(crate) const ETAMX3: f64 = 10.0;
pub(crate) const ETAMXF: f64 = 0.2;
pub(crate) const ETAMIN: f64 = 0.1;
pub(crate) const ETACF: f64 = 0.25;
pub(crate) const ADDON: f64 = 0.000001;
pub(crate) const BIAS1: f64 = 6.0;
pub(crate) const BIAS2: f64 = 6.0;
pub(crate) const BIAS3: f64 = 10.0;
pub(crate) const ONEPSM: f64 = 1.000001;
/// Steps after which the post-step ceiling on `eta` relaxes from `ETAMX2`.
pub(crate) const SMALL_NST: usize = 10;
/// Error test failures before an order reduction is forced.
pub(crate) const MXNEF1: usize = 3;
/// Error test failures after which `eta` is capped at `ETAMXF`.
pub(crate) const SMALL_NEF: usize = 2;
/// Order-change hold-off after an order-1 restart.
pub(crate) const LONG_WAIT: usize = 10;

// Initial-step search.
const FUZZ_FACTOR: f64 = 100.0;
const HLB_FACTOR: f64 = 100.0;
const HUB_FACTOR: f64 = 0.1;
const H_BIAS: f64 = 0.5;
const H0_MAX_ITERS: usize = 4;

// Defaults.
const MXSTEP_DEFAULT: usize = 500;
const MXHNIL_DEFAULT: usize = 10;
const NLS_MAXCOR: usize = 3;
const MXNCF: usize = 10;
const MXNEF: usize = 7;
const CORTES: f64 = 0.1;

/// Which subsystem an error-test failure is charged to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TestTarget {
    State,
    Quad,
    Sens,
}

/// Outcome of a local error test that did not hard-fail.
pub(crate) enum ErrTest<T> {
    Pass(T),
    Retry,
}

/// Variable-order, variable-step linear multistep integrator on a Nordsieck
/// history, in the Adams-Moulton (non-stiff) and BDF (stiff) families, with
/// functional or Newton correctors, optional pure quadratures, and optional
/// forward sensitivity analysis in three coupling modes.
///
/// The solver owns the entire integration state by composition: history,
/// method coefficients, work vectors, counters, and the optional quadrature
/// and sensitivity subsystems. The step machinery addresses these fields
/// directly; external collaborators (the vector backend and the linear
/// solver) are reached only through their traits.
pub struct MultistepSolver<V: Vector, F: OdeRhs<V>> {
    // problem
    pub(crate) rhs: F,
    pub(crate) p: V,
    pub(crate) method: Method,
    pub(crate) iter: IterType,
    pub(crate) rtol: V::T,
    pub(crate) atol: Atol<V>,
    pub(crate) n: usize,

    // history and coefficients
    pub(crate) hist: Nordsieck<V>,
    pub(crate) coeffs: MethodCoeffs<V::T>,
    pub(crate) tau: [V::T; L_MAX + 1],

    // step state
    pub(crate) q: usize,
    pub(crate) qprime: usize,
    pub(crate) next_q: usize,
    pub(crate) qwait: usize,
    pub(crate) qu: usize,
    pub(crate) h: V::T,
    pub(crate) hprime: V::T,
    pub(crate) next_h: V::T,
    pub(crate) eta: V::T,
    pub(crate) etaq: V::T,
    pub(crate) etaqm1: V::T,
    pub(crate) etaqp1: V::T,
    pub(crate) hscale: V::T,
    pub(crate) hu: V::T,
    pub(crate) h0u: V::T,
    pub(crate) tn: V::T,
    pub(crate) saved_tq5: V::T,
    pub(crate) etamax: V::T,

    // work vectors
    pub(crate) ewt: V,
    pub(crate) y: V,
    pub(crate) acor: V,
    pub(crate) tempv: V,
    pub(crate) ftemp: V,

    // corrector state
    pub(crate) conv_rate: V::T,
    pub(crate) jcur: bool,
    pub(crate) force_setup: bool,
    pub(crate) nstlp: usize,
    pub(crate) acnrm: V::T,

    // counters
    pub(crate) nst: usize,
    pub(crate) nfe: usize,
    pub(crate) ncfn: usize,
    pub(crate) netf: usize,
    pub(crate) nni: usize,
    pub(crate) nsetups: usize,
    pub(crate) nhnil: usize,
    pub(crate) nscon: usize,
    pub(crate) nor: usize,
    pub(crate) tolsf: V::T,

    // linear solver attachment
    pub(crate) lsolver: Option<Box<dyn LinearSolver<V>>>,
    pub(crate) lsolver_ready: bool,

    // options
    pub(crate) qmax: usize,
    pub(crate) mxstep: usize,
    pub(crate) mxhnil: usize,
    pub(crate) hin: V::T,
    pub(crate) hmin: V::T,
    pub(crate) hmax_inv: V::T,
    pub(crate) nlscoef: V::T,
    pub(crate) maxcor: usize,
    pub(crate) maxnef: usize,
    pub(crate) maxncf: usize,
    pub(crate) sldet_on: bool,
    pub(crate) tstop: Option<V::T>,

    // stability-limit window
    pub(crate) ssdat: [[V::T; 3]; 5],

    // subsystems
    pub(crate) quad: Option<QuadState<V>>,
    pub(crate) sens: Option<SensState<V>>,

    pub(crate) initialized: bool,
}

impl<V: Vector, F: OdeRhs<V>> MultistepSolver<V, F> {
    /// Create a solver for `y' = f(t, y, p)` with the given method family
    /// and corrector type. The problem itself is supplied via
    /// [MultistepSolver::init] before stepping.
    pub fn new(method: Method, iter: IterType, rhs: F) -> Self {
        let qmax = match method {
            Method::Adams => ADAMS_Q_MAX,
            Method::Bdf => BDF_Q_MAX,
        };
        let zero = V::T::zero();
        Self {
            rhs,
            p: V::zeros(0),
            method,
            iter,
            rtol: zero,
            atol: Atol::Scalar(zero),
            n: 0,
            hist: Nordsieck::new(0, qmax),
            coeffs: MethodCoeffs::new(),
            tau: [zero; L_MAX + 1],
            q: 1,
            qprime: 1,
            next_q: 1,
            qwait: 2,
            qu: 0,
            h: zero,
            hprime: zero,
            next_h: zero,
            eta: V::T::one(),
            etaq: V::T::one(),
            etaqm1: V::T::one(),
            etaqp1: V::T::one(),
            hscale: zero,
            hu: zero,
            h0u: zero,
            tn: zero,
            saved_tq5: V::T::one(),
            etamax: V::T::from(ETAMX1),
            ewt: V::zeros(0),
            y: V::zeros(0),
            acor: V::zeros(0),
            tempv: V::zeros(0),
            ftemp: V::zeros(0),
            conv_rate: V::T::one(),
            jcur: false,
            force_setup: false,
            nstlp: 0,
            acnrm: zero,
            nst: 0,
            nfe: 0,
            ncfn: 0,
            netf: 0,
            nni: 0,
            nsetups: 0,
            nhnil: 0,
            nscon: 0,
            nor: 0,
            tolsf: V::T::one(),
            lsolver: None,
            lsolver_ready: false,
            qmax,
            mxstep: MXSTEP_DEFAULT,
            mxhnil: MXHNIL_DEFAULT,
            hin: zero,
            hmin: zero,
            hmax_inv: zero,
            nlscoef: V::T::from(CORTES),
            maxcor: NLS_MAXCOR,
            maxnef: MXNEF,
            maxncf: MXNCF,
            sldet_on: false,
            tstop: None,
            ssdat: [[zero; 3]; 5],
            quad: None,
            sens: None,
            initialized: false,
        }
    }

    /// Advance the solution toward `tout` according to `task`, writing the
    /// output state (interpolated at `tout`, at the stop time, or at the
    /// last internal mesh point) into `yout`. Returns the time the output
    /// corresponds to. On error, `yout` holds the last accepted state.
    pub fn solve_to(
        &mut self,
        tout: V::T,
        yout: &mut V,
        task: Task,
    ) -> Result<(V::T, SolveStatus), NordsolError> {
        let zero = V::T::zero();
        let one = V::T::one();
        let uround = V::T::EPSILON;

        if !self.initialized {
            return Err(OdeSolverError::NotInitialized.into());
        }
        let istop = task.uses_tstop();
        if istop && self.tstop.is_none() {
            return Err(OdeSolverError::IllInput("tstop task without a configured stop time").into());
        }

        // First-call block: evaluate derivatives at (t0, y0), determine the
        // initial step, and scale column 1 of the history by it.
        if self.nst == 0 {
            if self.iter == IterType::Newton {
                let ls = self
                    .lsolver
                    .as_mut()
                    .ok_or(crate::error::LinearSolverError::NotAttached)?;
                if !self.lsolver_ready {
                    ls.init(self.n).map_err(NordsolError::LinearSolverError)?;
                    self.lsolver_ready = true;
                }
            }

            {
                let (zn1, zn0) = column_pair(&mut self.hist.zn, 1, 0);
                self.rhs
                    .call(self.tn, zn0, &self.p, zn1)
                    .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
            }
            self.nfe += 1;

            if self.sens.is_some() {
                self.sens_rhs_all(self.tn, YSel::Predicted, DotSel::Zn1, true, OutSel::Tempv)
                    .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
                self.copy_sens_tempv_to_zn1();
            }
            if self.quad.is_some() {
                let qd = self.quad.as_mut().unwrap();
                qd.fq
                    .call(self.tn, &self.hist.zn[0], &self.p, &mut self.hist.znq[1])
                    .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
                qd.nfqe += 1;
            }

            self.h = self.hin;
            if self.h != zero && (tout - self.tn) * self.h < zero {
                return Err(OdeSolverError::IllInput("initial step and tout - t0 have opposite signs").into());
            }
            if self.h == zero {
                self.estimate_initial_step(tout)?;
            }
            let rh = self.h.abs() * self.hmax_inv;
            if rh > one {
                self.h /= rh;
            }
            if self.h.abs() < self.hmin {
                self.h *= self.hmin / self.h.abs();
            }

            if istop {
                let tstop = self.tstop.unwrap();
                if (tstop - self.tn) * self.h < zero {
                    return Err(OdeSolverError::StopTimeBeforeCurrentTime {
                        stop_time: tstop.as_f64(),
                        state_time: self.tn.as_f64(),
                    }
                    .into());
                }
                if (self.tn + self.h - tstop) * self.h > zero {
                    self.h = tstop - self.tn;
                }
            }

            self.hscale = self.h;
            self.h0u = self.h;
            self.hprime = self.h;

            self.hist.zn[1] *= scale(self.h);
            if let Some(s) = self.sens.as_ref() {
                for is in 0..s.ns {
                    self.hist.zns[is][1] *= scale(self.h);
                }
            }
            if self.quad.is_some() {
                self.hist.znq[1] *= scale(self.h);
            }
        }

        // Stop tests against work already done.
        if self.nst > 0 {
            if istop {
                let tstop = self.tstop.unwrap();
                if (tstop - self.tn) * self.h < zero {
                    return Err(OdeSolverError::StopTimeBeforeCurrentTime {
                        stop_time: tstop.as_f64(),
                        state_time: self.tn.as_f64(),
                    }
                    .into());
                }
            }

            if !task.is_one_step() && (self.tn - tout) * self.h >= zero {
                self.interpolate_dky(tout, 0, yout)?;
                return Ok((tout, SolveStatus::Success));
            }

            if istop {
                let tstop = self.tstop.unwrap();
                let troundoff = V::T::from(FUZZ_FACTOR) * uround * (self.tn.abs() + self.h.abs());
                if (self.tn - tstop).abs() <= troundoff {
                    self.interpolate_dky(tstop, 0, yout)?;
                    return Ok((tstop, SolveStatus::TstopReturn));
                }
                if (self.tn + self.hprime - tstop) * self.h > zero {
                    self.hprime = tstop - self.tn;
                    self.eta = self.hprime / self.h;
                }
            }
        }

        // Internal step loop.
        let mut nstloc = 0;
        loop {
            self.next_h = self.h;
            self.next_q = self.q;

            if self.nst > 0 && !self.refresh_weights() {
                yout.copy_from(&self.hist.zn[0]);
                return Err(OdeSolverError::EwtNowBad { t: self.tn.as_f64() }.into());
            }

            if nstloc >= self.mxstep {
                yout.copy_from(&self.hist.zn[0]);
                return Err(OdeSolverError::TooMuchWork {
                    t: self.tn.as_f64(),
                    mxstep: self.mxstep,
                }
                .into());
            }

            let mut nrm = self.hist.zn[0].wrms_norm(&self.ewt);
            if let Some(qd) = self.quad.as_ref() {
                if qd.in_error_test() {
                    nrm = update_norm(nrm, self.hist.znq[0].wrms_norm(&qd.ewt));
                }
            }
            if let Some(s) = self.sens.as_ref() {
                if s.errcon == ErrCon::Full {
                    for is in 0..s.ns {
                        nrm = update_norm(nrm, self.hist.zns[is][0].wrms_norm(&s.ewt[is]));
                    }
                }
            }
            self.tolsf = uround * nrm;
            if self.tolsf > one {
                yout.copy_from(&self.hist.zn[0]);
                self.tolsf *= V::T::from(2.0);
                return Err(OdeSolverError::TooMuchAccuracy {
                    t: self.tn.as_f64(),
                    tolsf: self.tolsf.as_f64(),
                }
                .into());
            }

            if self.tn + self.hprime == self.tn {
                self.nhnil += 1;
                if self.nhnil <= self.mxhnil {
                    tracing::warn!(
                        t = self.tn.as_f64(),
                        h = self.hprime.as_f64(),
                        "internal t + h == t; step size is at roundoff level"
                    );
                }
                if self.nhnil == self.mxhnil {
                    tracing::warn!("further step-size-at-roundoff warnings will be suppressed");
                }
            }

            if let Err(e) = self.step_once() {
                yout.copy_from(&self.hist.zn[0]);
                return Err(e);
            }
            nstloc += 1;

            if istop {
                let tstop = self.tstop.unwrap();
                let troundoff = V::T::from(FUZZ_FACTOR) * uround * (self.tn.abs() + self.h.abs());
                if (self.tn - tstop).abs() <= troundoff {
                    self.interpolate_dky(tstop, 0, yout)?;
                    return Ok((tstop, SolveStatus::TstopReturn));
                }
                if (self.tn + self.hprime - tstop) * self.h > zero {
                    self.hprime = tstop - self.tn;
                    self.eta = self.hprime / self.h;
                }
            }

            if task.is_one_step() {
                yout.copy_from(&self.hist.zn[0]);
                self.next_q = self.qprime;
                self.next_h = self.hprime;
                return Ok((self.tn, SolveStatus::Success));
            }

            if (self.tn - tout) * self.h >= zero {
                self.interpolate_dky(tout, 0, yout)?;
                self.next_q = self.qprime;
                self.next_h = self.hprime;
                return Ok((tout, SolveStatus::Success));
            }
        }
    }

    /// One internal step from `tn` to `tn + h`: predict, set coefficients,
    /// correct, test, and on success update the history and pick the next
    /// step size and order.
    fn step_once(&mut self) -> Result<(), NordsolError> {
        let one = V::T::one();
        let saved_t = self.tn;
        let mut ncf = 0usize;
        let mut nef = 0usize;
        let mut nef_q = 0usize;
        let mut ncf_s = 0usize;
        let mut nef_s = 0usize;
        let mut nflag = NlsFlag::FirstCall;

        let sens_method = self.sens.as_ref().map(|s| s.coupling.method());
        let do_stgr = sens_method == Some(SensMethod::Staggered);
        let do_stgr1 = sens_method == Some(SensMethod::Staggered1);

        if let Some(s) = self.sens.as_mut() {
            if do_stgr1 {
                s.ncf1_step.iter_mut().for_each(|c| *c = 0);
            }
        }

        if self.nst > 0 && self.hprime != self.h {
            self.adjust_params();
        }

        let dsm = 'attempt: loop {
            self.hist.predict(self.q);
            self.tn += self.h;
            self.coeffs.set(
                self.method,
                self.q,
                self.qwait,
                self.h,
                &self.tau,
                self.nlscoef,
                self.nst,
            );

            let outcome = self.nls(nflag);
            match self.handle_nflag(outcome, saved_t, &mut ncf, CfTarget::State)? {
                StepAttempt::PredictAgain => {
                    nflag = NlsFlag::PrevConvFail;
                    continue 'attempt;
                }
                StepAttempt::DoErrorTest => {}
            }

            let mut dsm = match self.do_error_test(self.acnrm, &mut nef, TestTarget::State, saved_t)? {
                ErrTest::Retry => {
                    nflag = NlsFlag::PrevErrFail;
                    continue 'attempt;
                }
                ErrTest::Pass(dsm) => dsm,
            };

            // Quadrature correction rides on the converged state.
            if self.quad.is_some() {
                self.quad_correct()?;
                let qd = self.quad.as_mut().unwrap();
                if qd.in_error_test() {
                    qd.acnrm = qd.acor.wrms_norm(&qd.ewt);
                    let acnrm_q = qd.acnrm;
                    match self.do_error_test(acnrm_q, &mut nef_q, TestTarget::Quad, saved_t)? {
                        ErrTest::Retry => {
                            nflag = NlsFlag::PrevErrFail;
                            continue 'attempt;
                        }
                        ErrTest::Pass(dsm_q) => dsm = update_norm(dsm, dsm_q),
                    }
                }
            }

            // Staggered sensitivity correctors run after the state has
            // passed its own test, against the accepted y_n.
            if do_stgr || do_stgr1 {
                ncf = 0;
                nef = 0;
                match self.rhs.call(self.tn, &self.y, &self.p, &mut self.ftemp) {
                    Ok(()) => {}
                    Err(RhsError::Unrecoverable) => {
                        self.hist.restore(self.q);
                        self.tn = saved_t;
                        return Err(OdeSolverError::RhsFailed { t: saved_t.as_f64() }.into());
                    }
                    Err(RhsError::Recoverable) => {
                        match self.handle_nflag(
                            NlsOutcome::ConvFail,
                            saved_t,
                            &mut ncf_s,
                            CfTarget::Sens,
                        )? {
                            StepAttempt::PredictAgain => {
                                nflag = NlsFlag::PrevConvFail;
                                continue 'attempt;
                            }
                            StepAttempt::DoErrorTest => unreachable!(),
                        }
                    }
                }
                self.nfe += 1;

                if do_stgr {
                    let outcome = self.stgr_nls();
                    match self.handle_nflag(outcome, saved_t, &mut ncf_s, CfTarget::Sens)? {
                        StepAttempt::PredictAgain => {
                            nflag = NlsFlag::PrevConvFail;
                            continue 'attempt;
                        }
                        StepAttempt::DoErrorTest => {}
                    }
                } else {
                    let ns = self.sens.as_ref().unwrap().ns;
                    let mut retry = false;
                    for is in 0..ns {
                        let outcome = self.stgr1_nls(is);
                        match self.handle_nflag(outcome, saved_t, &mut ncf_s, CfTarget::Sens1(is))? {
                            StepAttempt::PredictAgain => {
                                retry = true;
                                break;
                            }
                            StepAttempt::DoErrorTest => {}
                        }
                    }
                    if retry {
                        nflag = NlsFlag::PrevConvFail;
                        continue 'attempt;
                    }
                    let s = self.sens.as_mut().unwrap();
                    s.acnrm = super::weights::sens_norm(&s.acor, &s.ewt);
                }

                let s = self.sens.as_ref().unwrap();
                if s.errcon == ErrCon::Full {
                    let acnrm_s = s.acnrm;
                    match self.do_error_test(acnrm_s, &mut nef_s, TestTarget::Sens, saved_t)? {
                        ErrTest::Retry => {
                            nflag = NlsFlag::PrevErrFail;
                            continue 'attempt;
                        }
                        ErrTest::Pass(dsm_s) => dsm = update_norm(dsm, dsm_s),
                    }
                }
            }

            break dsm;
        };

        self.complete_step();
        self.prepare_next_step(dsm);

        if self.sldet_on && self.method == Method::Bdf {
            self.bdf_stab();
        }

        self.etamax = if self.nst <= SMALL_NST {
            V::T::from(ETAMX2)
        } else {
            V::T::from(ETAMX3)
        };

        // Leave the correction vectors holding the estimated local errors.
        let r = one / self.coeffs.tq[2];
        self.acor *= scale(r);
        if let Some(qd) = self.quad.as_mut() {
            qd.acor *= scale(r);
        }
        if let Some(s) = self.sens.as_mut() {
            for a in s.acor.iter_mut() {
                *a *= scale(r);
            }
        }

        Ok(())
    }

    /// Apply a pending order change and rescale the history for `hprime`.
    fn adjust_params(&mut self) {
        if self.qprime != self.q {
            let delta_q = self.qprime as i32 - self.q as i32;
            self.hist
                .adjust_order(self.method, delta_q, self.q, self.qmax, &self.tau, self.hscale);
            self.q = self.qprime;
            self.qwait = self.q + 1;
        }
        self.rescale();
    }

    /// Rescale the history by `eta` and commit the new step size.
    pub(crate) fn rescale(&mut self) {
        self.hist.rescale(self.q, self.eta);
        self.h = self.hscale * self.eta;
        self.hscale = self.h;
        self.nscon = 0;
    }

    /// Quadrature correction `acorQ = rl1 * (h * fQ(tn, yn) - znQ[1])`.
    fn quad_correct(&mut self) -> Result<(), NordsolError> {
        let one = V::T::one();
        let qd = self.quad.as_mut().unwrap();
        qd.fq
            .call(self.tn, &self.y, &self.p, &mut qd.acor)
            .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
        qd.nfqe += 1;
        qd.acor.axpy(-one, &self.hist.znq[1], self.h);
        qd.acor *= scale(self.coeffs.rl1);
        qd.yq.linear_sum(one, &self.hist.znq[0], one, &qd.acor);
        Ok(())
    }

    /// Local error test on `acnrm / tq[2]`, shared between the state, the
    /// quadratures, and the sensitivities.
    ///
    /// On failure the history is restored and the retry policy applied:
    /// shrink the step, then force an order reduction, and at order one
    /// rebuild the first derivative column from scratch. A failure budget
    /// exhaustion or a step at `hmin` surfaces as
    /// [OdeSolverError::ErrFailure].
    pub(crate) fn do_error_test(
        &mut self,
        acnrm: V::T,
        nef: &mut usize,
        target: TestTarget,
        saved_t: V::T,
    ) -> Result<ErrTest<V::T>, NordsolError> {
        let one = V::T::one();
        let dsm = acnrm / self.coeffs.tq[2];
        if dsm <= one {
            return Ok(ErrTest::Pass(dsm));
        }

        *nef += 1;
        match target {
            TestTarget::State => self.netf += 1,
            TestTarget::Quad => self.quad.as_mut().unwrap().netf += 1,
            TestTarget::Sens => self.sens.as_mut().unwrap().netf += 1,
        }
        self.hist.restore(self.q);
        self.tn = saved_t;

        if self.h.abs() <= self.hmin * V::T::from(ONEPSM) || *nef == self.maxnef {
            return Err(OdeSolverError::ErrFailure { t: self.tn.as_f64() }.into());
        }

        self.etamax = one;

        if *nef <= MXNEF1 {
            let l = V::T::from((self.q + 1) as f64);
            self.eta = one / ((V::T::from(BIAS2) * dsm).pow(one / l) + V::T::from(ADDON));
            let floor = self.hmin / self.h.abs();
            if floor > self.eta {
                self.eta = floor;
            }
            if self.eta < V::T::from(ETAMIN) {
                self.eta = V::T::from(ETAMIN);
            }
            if *nef >= SMALL_NEF && self.eta > V::T::from(ETAMXF) {
                self.eta = V::T::from(ETAMXF);
            }
            self.rescale();
            return Ok(ErrTest::Retry);
        }

        if self.q > 1 {
            self.eta = eta_floor::<V>(self.hmin, self.h);
            self.hist
                .adjust_order(self.method, -1, self.q, self.qmax, &self.tau, self.hscale);
            self.qwait = self.q;
            self.q -= 1;
            self.rescale();
            return Ok(ErrTest::Retry);
        }

        // Already at order 1: restart with a fresh derivative column.
        self.eta = eta_floor::<V>(self.hmin, self.h);
        self.h *= self.eta;
        self.hscale = self.h;
        self.qwait = LONG_WAIT;
        self.nscon = 0;

        self.rhs
            .call(self.tn, &self.hist.zn[0], &self.p, &mut self.tempv)
            .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
        self.nfe += 1;
        self.hist.zn[1].copy_from(&self.tempv);
        self.hist.zn[1] *= scale(self.h);

        if self.quad.is_some() {
            {
                let qd = self.quad.as_mut().unwrap();
                qd.fq
                    .call(self.tn, &self.hist.zn[0], &self.p, &mut qd.tempv)
                    .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
                qd.nfqe += 1;
            }
            let qd = self.quad.as_ref().unwrap();
            self.hist.znq[1].copy_from(&qd.tempv);
            self.hist.znq[1] *= scale(self.h);
        }

        if self.sens.is_some() {
            self.sens_rhs_all(self.tn, YSel::Predicted, DotSel::Tempv, true, OutSel::Tempv)
                .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
            self.copy_sens_tempv_to_zn1();
            let ns = self.sens.as_ref().unwrap().ns;
            for is in 0..ns {
                self.hist.zns[is][1] *= scale(self.h);
            }
        }

        Ok(ErrTest::Retry)
    }

    /// Update counters, the step history `tau`, and the Nordsieck columns
    /// after all tests have passed; save the correction for a later order
    /// increase when the hold-off is about to expire.
    fn complete_step(&mut self) {
        self.nst += 1;
        self.nscon += 1;
        self.hu = self.h;
        self.qu = self.q;

        for i in (2..=self.q).rev() {
            self.tau[i] = self.tau[i - 1];
        }
        if self.q == 1 && self.nst > 1 {
            self.tau[2] = self.tau[1];
        }
        self.tau[1] = self.h;

        self.hist.correct(
            self.q,
            &self.coeffs.l,
            &self.acor,
            self.quad.as_ref().map(|qd| &qd.acor),
            self.sens.as_ref().map(|s| s.acor.as_slice()),
        );

        self.qwait -= 1;
        if self.qwait == 1 && self.q != self.qmax {
            let qmax = self.qmax;
            self.hist.zn[qmax].copy_from(&self.acor);
            if let Some(qd) = self.quad.as_ref() {
                if qd.in_error_test() {
                    self.hist.znq[qmax].copy_from(&qd.acor);
                }
            }
            if let Some(s) = self.sens.as_ref() {
                if s.errcon == ErrCon::Full {
                    for is in 0..s.ns {
                        self.hist.zns[is][qmax].copy_from(&s.acor[is]);
                    }
                }
            }
            self.saved_tq5 = self.coeffs.tq[5];
        }
    }

    /// Choose the next step size and order (`hprime`, `qprime`, `eta`).
    fn prepare_next_step(&mut self, dsm: V::T) {
        let one = V::T::one();
        if self.etamax == one {
            if self.qwait < 2 {
                self.qwait = 2;
            }
            self.qprime = self.q;
            self.hprime = self.h;
            self.eta = one;
            return;
        }

        let l = V::T::from((self.q + 1) as f64);
        self.etaq = one / ((V::T::from(BIAS2) * dsm).pow(one / l) + V::T::from(ADDON));

        if self.qwait != 0 {
            self.eta = self.etaq;
            self.qprime = self.q;
            self.set_eta();
            return;
        }

        self.qwait = 2;
        self.etaqm1 = self.compute_etaqm1();
        self.etaqp1 = self.compute_etaqp1();
        self.choose_eta();
        self.set_eta();
    }

    /// Apply the change threshold and the `etamax`/`hmax` ceilings to `eta`,
    /// then fix `hprime`.
    fn set_eta(&mut self) {
        let one = V::T::one();
        if self.eta < V::T::from(THRESH) {
            self.eta = one;
            self.hprime = self.h;
        } else {
            if self.eta > self.etamax {
                self.eta = self.etamax;
            }
            let cap = self.h.abs() * self.hmax_inv * self.eta;
            if cap > one {
                self.eta /= cap;
            }
            self.hprime = self.h * self.eta;
            if self.qprime < self.q {
                self.nscon = 0;
            }
        }
    }

    /// Step ratio for a possible decrease to order `q - 1`.
    fn compute_etaqm1(&mut self) -> V::T {
        let one = V::T::one();
        let mut etaqm1 = V::T::zero();
        if self.q > 1 {
            let mut ddn = self.hist.zn[self.q].wrms_norm(&self.ewt);
            if let Some(qd) = self.quad.as_ref() {
                if qd.in_error_test() {
                    ddn = update_norm(ddn, self.hist.znq[self.q].wrms_norm(&qd.ewt));
                }
            }
            if let Some(s) = self.sens.as_ref() {
                if s.errcon == ErrCon::Full {
                    for is in 0..s.ns {
                        ddn = update_norm(ddn, self.hist.zns[is][self.q].wrms_norm(&s.ewt[is]));
                    }
                }
            }
            ddn /= self.coeffs.tq[1];
            let q = V::T::from(self.q as f64);
            etaqm1 = one / ((V::T::from(BIAS1) * ddn).pow(one / q) + V::T::from(ADDON));
        }
        etaqm1
    }

    /// Step ratio for a possible increase to order `q + 1`, comparing the
    /// latest correction against the one saved in the scratch column.
    fn compute_etaqp1(&mut self) -> V::T {
        let one = V::T::one();
        let mut etaqp1 = V::T::zero();
        if self.q != self.qmax {
            let qmax = self.qmax;
            let l = self.q + 1;
            let cquot =
                (self.coeffs.tq[5] / self.saved_tq5) * (self.h / self.tau[2]).pow(l as i32);
            self.tempv
                .linear_sum(-cquot, &self.hist.zn[qmax], one, &self.acor);
            let mut dup = self.tempv.wrms_norm(&self.ewt);
            if self.quad.is_some() {
                let qd = self.quad.as_mut().unwrap();
                if qd.in_error_test() {
                    qd.tempv
                        .linear_sum(-cquot, &self.hist.znq[qmax], one, &qd.acor);
                    dup = update_norm(dup, qd.tempv.wrms_norm(&qd.ewt));
                }
            }
            if self.sens.is_some() {
                let s = self.sens.as_mut().unwrap();
                if s.errcon == ErrCon::Full {
                    for is in 0..s.ns {
                        s.tempv[is].linear_sum(-cquot, &self.hist.zns[is][qmax], one, &s.acor[is]);
                        dup = update_norm(dup, s.tempv[is].wrms_norm(&s.ewt[is]));
                    }
                }
            }
            dup /= self.coeffs.tq[3];
            let lp1 = V::T::from((l + 1) as f64);
            etaqp1 = one / ((V::T::from(BIAS3) * dup).pow(one / lp1) + V::T::from(ADDON));
        }
        etaqp1
    }

    /// Pick the largest of the three candidate ratios, preferring in a tie
    /// to keep the order, then to decrease it. An increase saves the current
    /// correction into the scratch column for the adjustment that follows.
    fn choose_eta(&mut self) {
        let one = V::T::one();
        let mut etam = self.etaq;
        if self.etaqm1 > etam {
            etam = self.etaqm1;
        }
        if self.etaqp1 > etam {
            etam = self.etaqp1;
        }

        if etam < V::T::from(THRESH) {
            self.eta = one;
            self.qprime = self.q;
            return;
        }

        if etam == self.etaq {
            self.eta = self.etaq;
            self.qprime = self.q;
        } else if etam == self.etaqm1 {
            self.eta = self.etaqm1;
            self.qprime = self.q - 1;
        } else {
            self.eta = self.etaqp1;
            self.qprime = self.q + 1;

            let qmax = self.qmax;
            self.hist.zn[qmax].copy_from(&self.acor);
            if let Some(qd) = self.quad.as_ref() {
                if qd.in_error_test() {
                    self.hist.znq[qmax].copy_from(&qd.acor);
                }
            }
            if let Some(s) = self.sens.as_ref() {
                if s.errcon == ErrCon::Full {
                    for is in 0..s.ns {
                        self.hist.zns[is][qmax].copy_from(&s.acor[is]);
                    }
                }
            }
        }
    }

    /// Maintain the stability-limit window and force an order reduction when
    /// the dominant-root analysis reports a violation.
    fn bdf_stab(&mut self) {
        let one = V::T::one();
        if self.q >= 3 {
            let mut factorial = 1.0f64;
            for i in 1..self.q {
                factorial *= i as f64;
            }
            let fact = V::T::from(factorial);
            let qt = V::T::from(self.q as f64);
            let sq = fact * qt * (qt + one) * self.acnrm / self.coeffs.tq[5];
            let sqm1 = fact * qt * self.hist.zn[self.q].wrms_norm(&self.ewt);
            let sqm2 = fact * self.hist.zn[self.q - 1].wrms_norm(&self.ewt);
            shift_and_store(&mut self.ssdat, sqm2, sqm1, sq);
        }

        if self.qprime >= self.q {
            if self.q >= 3 && self.nscon >= self.q + 5 {
                let verdict = dominant_root(&self.ssdat, self.q);
                if verdict.is_violation() {
                    self.qprime = self.q - 1;
                    self.eta = self.etaqm1;
                    if self.eta > self.etamax {
                        self.eta = self.etamax;
                    }
                    let cap = self.h.abs() * self.hmax_inv * self.eta;
                    if cap > one {
                        self.eta /= cap;
                    }
                    self.hprime = self.h * self.eta;
                    self.nor += 1;
                    tracing::debug!(
                        t = self.tn.as_f64(),
                        q = self.qprime,
                        "stability limit detected; reducing order"
                    );
                }
            }
        } else {
            // an order increase is coming; restart the constant-order count
            self.nscon = 0;
        }
    }

    /// Refresh the error weights from the current solution. Returns `false`
    /// if any weight became non-positive.
    fn refresh_weights(&mut self) -> bool {
        if !ewt_set(
            &self.hist.zn[0],
            self.rtol,
            &self.atol,
            &mut self.tempv,
            &mut self.ewt,
        ) {
            return false;
        }
        if self.sens.is_some() {
            let s = self.sens.as_mut().unwrap();
            for is in 0..s.ns {
                if !ewt_set(
                    &self.hist.zns[is][0],
                    s.rtol,
                    &s.atol[is],
                    &mut self.tempv,
                    &mut s.ewt[is],
                ) {
                    return false;
                }
            }
        }
        if self.quad.is_some() {
            let qd = self.quad.as_mut().unwrap();
            if qd.in_error_test()
                && !ewt_set(&self.hist.znq[0], qd.rtol, &qd.atol, &mut qd.tempv, &mut qd.ewt)
            {
                return false;
            }
        }
        true
    }

    /// Find a viable first step size from `y0`, `y'(t0)` and the tolerances.
    fn estimate_initial_step(&mut self, tout: V::T) -> Result<(), NordsolError> {
        let zero = V::T::zero();
        let two = V::T::from(2.0);
        let half = V::T::from(0.5);
        let uround = V::T::EPSILON;

        let tdiff = tout - self.tn;
        if tdiff == zero {
            return Err(OdeSolverError::TooClose.into());
        }
        let neg = tdiff < zero;
        let tdist = tdiff.abs();
        let tmax = if self.tn.abs() > tout.abs() {
            self.tn.abs()
        } else {
            tout.abs()
        };
        let tround = uround * tmax;
        if tdist < two * tround {
            return Err(OdeSolverError::TooClose.into());
        }

        let hlb = V::T::from(HLB_FACTOR) * tround;
        let hub = self.upper_bound_h0(tdist);
        let mut hg = (hlb * hub).sqrt();
        if hub < hlb {
            self.h = if neg { -hg } else { hg };
            return Ok(());
        }

        // Iterate on an estimate of the second derivative; stop early when
        // successive values agree within a factor of two, or when a late
        // jump indicates cancellation error in the difference quotient.
        let mut hnew;
        let mut count = 0;
        loop {
            let hgs = if neg { -hg } else { hg };
            let yddnrm = self.ydd_norm(hgs)?;
            hnew = if yddnrm * hub * hub > two {
                (two / yddnrm).sqrt()
            } else {
                (hg * hub).sqrt()
            };
            count += 1;
            if count >= H0_MAX_ITERS {
                break;
            }
            let hrat = hnew / hg;
            if hrat > half && hrat < two {
                break;
            }
            if count >= 2 && hrat > two {
                hnew = hg;
                break;
            }
            hg = hnew;
        }

        let mut h0 = V::T::from(H_BIAS) * hnew;
        if h0 < hlb {
            h0 = hlb;
        }
        if h0 > hub {
            h0 = hub;
        }
        if neg {
            h0 = -h0;
        }
        self.h = h0;
        Ok(())
    }

    /// Upper bound on `|h0|` from `tdist` and the component ratios
    /// `|y'| / (0.1 |y| + atol)`, extended over quadratures and
    /// sensitivities that participate in the error test.
    fn upper_bound_h0(&mut self, tdist: V::T) -> V::T {
        let one = V::T::one();
        let hub_factor = V::T::from(HUB_FACTOR);

        let bound_group = |z0: &V, z1: &V, atol: &Atol<V>, t1: &mut V, t2: &mut V| {
            z0.abs_to(t1);
            z1.abs_to(t2);
            match atol {
                Atol::Scalar(a) => {
                    *t1 *= scale(hub_factor);
                    t1.add_scalar_mut(*a);
                }
                Atol::Vector(av) => t1.axpy(one, av, hub_factor),
            }
            t2.component_div_assign(t1);
            t2.max_norm()
        };

        let mut hub_inv = {
            let (t1, t2) = (&mut self.tempv, &mut self.acor);
            bound_group(&self.hist.zn[0], &self.hist.zn[1], &self.atol, t1, t2)
        };

        if self.quad.is_some() {
            let qd = self.quad.as_mut().unwrap();
            if qd.errcon == ErrCon::Full {
                let hq = bound_group(
                    &self.hist.znq[0],
                    &self.hist.znq[1],
                    &qd.atol,
                    &mut qd.tempv,
                    &mut qd.acor,
                );
                if hq > hub_inv {
                    hub_inv = hq;
                }
            }
        }

        if self.sens.is_some() {
            let s = self.sens.as_ref().unwrap();
            if s.errcon == ErrCon::Full {
                for is in 0..s.ns {
                    let hs = {
                        let (t1, t2) = (&mut self.tempv, &mut self.acor);
                        bound_group(&self.hist.zns[is][0], &self.hist.zns[is][1], &s.atol[is], t1, t2)
                    };
                    if hs > hub_inv {
                        hub_inv = hs;
                    }
                }
            }
        }

        let mut hub = hub_factor * tdist;
        if hub * hub_inv > one {
            hub = one / hub_inv;
        }
        hub
    }

    /// WRMS norm of a difference-quotient estimate of `y''` at step `hg`,
    /// combined over every group in the error test.
    fn ydd_norm(&mut self, hg: V::T) -> Result<V::T, NordsolError> {
        let one = V::T::one();

        self.y.linear_sum(hg, &self.hist.zn[1], one, &self.hist.zn[0]);
        let sens_full = self
            .sens
            .as_ref()
            .is_some_and(|s| s.errcon == ErrCon::Full);
        if sens_full {
            let s = self.sens.as_mut().unwrap();
            for is in 0..s.ns {
                s.ys[is].linear_sum(hg, &self.hist.zns[is][1], one, &self.hist.zns[is][0]);
            }
        }

        self.rhs
            .call(self.tn + hg, &self.y, &self.p, &mut self.tempv)
            .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
        self.nfe += 1;

        let quad_full = self
            .quad
            .as_ref()
            .is_some_and(|qd| qd.errcon == ErrCon::Full);
        if quad_full {
            let qd = self.quad.as_mut().unwrap();
            qd.fq
                .call(self.tn + hg, &self.y, &self.p, &mut qd.tempv)
                .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
            qd.nfqe += 1;
        }

        if sens_full {
            self.sens_rhs_all(self.tn + hg, YSel::Corrected, DotSel::Tempv, false, OutSel::Tempv)
                .map_err(|_| OdeSolverError::RhsFailed { t: self.tn.as_f64() })?;
        }

        self.tempv.axpy(-one, &self.hist.zn[1], one);
        self.tempv *= scale(one / hg);
        let mut yddnrm = self.tempv.wrms_norm(&self.ewt);

        if quad_full {
            let qd = self.quad.as_mut().unwrap();
            qd.tempv.axpy(-one, &self.hist.znq[1], one);
            qd.tempv *= scale(one / hg);
            yddnrm = update_norm(yddnrm, qd.tempv.wrms_norm(&qd.ewt));
        }

        if sens_full {
            let s = self.sens.as_mut().unwrap();
            for is in 0..s.ns {
                s.tempv[is].axpy(-one, &self.hist.zns[is][1], one);
                s.tempv[is] *= scale(one / hg);
                yddnrm = update_norm(yddnrm, s.tempv[is].wrms_norm(&s.ewt[is]));
            }
        }

        Ok(yddnrm)
    }

    /// Interpolate the `k`-th derivative of the solution polynomial at `t`
    /// into `dky`: `dky = sum_{j=k..q} c(j,k) ((t - tn)/h)^(j-k) h^(-k) zn[j]`.
    ///
    /// Valid for `t` within the last step (with a small fuzz); `k` must be
    /// in `[0, q]`.
    pub fn interpolate_dky(&self, t: V::T, k: usize, dky: &mut V) -> Result<(), NordsolError> {
        interp_columns(
            &self.hist.zn,
            self.q,
            self.tn,
            self.h,
            self.hu,
            t,
            k,
            dky,
        )
    }

    /// Interpolated solution at `t` (order-0 derivative).
    pub fn interpolate(&self, t: V::T) -> Result<V, NordsolError> {
        let mut out = V::zeros(self.n);
        self.interpolate_dky(t, 0, &mut out)?;
        Ok(out)
    }

    /// Interpolate the `k`-th derivative of the quadrature variables at `t`.
    pub fn interpolate_quad_dky(&self, t: V::T, k: usize, dky: &mut V) -> Result<(), NordsolError> {
        if self.quad.is_none() {
            return Err(OdeSolverError::QuadNotInitialized.into());
        }
        interp_columns(
            &self.hist.znq,
            self.q,
            self.tn,
            self.h,
            self.hu,
            t,
            k,
            dky,
        )
    }

    /// Interpolate the `k`-th derivative of sensitivity `is` at `t`.
    pub fn interpolate_sens_dky(
        &self,
        is: usize,
        t: V::T,
        k: usize,
        dky: &mut V,
    ) -> Result<(), NordsolError> {
        let Some(s) = self.sens.as_ref() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        if is >= s.ns {
            return Err(OdeSolverError::BadIs { is, ns: s.ns }.into());
        }
        interp_columns(
            &self.hist.zns[is],
            self.q,
            self.tn,
            self.h,
            self.hu,
            t,
            k,
            dky,
        )
    }

    /// Interpolate all sensitivities at `t` (order-0 derivative).
    pub fn interpolate_sens_all(&self, t: V::T) -> Result<Vec<V>, NordsolError> {
        let Some(s) = self.sens.as_ref() else {
            return Err(OdeSolverError::SensNotInitialized.into());
        };
        let mut out = Vec::with_capacity(s.ns);
        for is in 0..s.ns {
            let mut dky = V::zeros(self.n);
            self.interpolate_sens_dky(is, t, 0, &mut dky)?;
            out.push(dky);
        }
        Ok(out)
    }

    /// The solution at the last internal mesh point.
    pub fn current_state(&self) -> &V {
        &self.hist.zn[0]
    }

    /// The quadrature variables at the last internal mesh point.
    pub fn current_quad(&self) -> Option<&V> {
        self.quad.as_ref().map(|_| &self.hist.znq[0])
    }

    pub fn current_time(&self) -> V::T {
        self.tn
    }

    /// Current error weight vector.
    pub fn err_weights(&self) -> &V {
        &self.ewt
    }

    /// Estimated local error vector of the last step.
    pub fn est_local_errors(&self) -> &V {
        &self.acor
    }

    /// Counters and step data; per-sensitivity staggered counters are
    /// returned as owned arrays.
    pub fn statistics(&self) -> SolverStatistics<V::T> {
        let ls = self
            .lsolver
            .as_ref()
            .map(|ls| ls.counters())
            .unwrap_or_default();
        let quad = self.quad.as_ref().map(|qd| QuadStatistics {
            nfqe: qd.nfqe,
            netf: qd.netf,
        });
        let sens = self.sens.as_ref().map(|s| {
            let staggered1 = s.coupling.method() == SensMethod::Staggered1;
            SensStatistics {
                nfse: s.nfse,
                nfes: s.nfes,
                nni: if staggered1 {
                    s.nni1.iter().sum()
                } else {
                    s.nni
                },
                ncfn: if staggered1 {
                    s.ncfn1.iter().sum()
                } else {
                    s.ncfn
                },
                netf: s.netf,
                nsetups: s.nsetups,
                nni1: s.nni1.clone(),
                ncfn1: s.ncfn1.clone(),
            }
        });
        SolverStatistics {
            nst: self.nst,
            nfe: self.nfe,
            nsetups: self.nsetups,
            netf: self.netf,
            nni: self.nni,
            ncfn: self.ncfn,
            nhnil: self.nhnil,
            nor: self.nor,
            njev: ls.njev,
            nfev_dq: ls.nfev_dq,
            last_order: self.qu,
            current_order: self.next_q,
            last_step: self.hu,
            current_step: self.next_h,
            initial_step: self.h0u,
            current_time: self.tn,
            tolsf: self.tolsf,
            quad,
            sens,
        }
    }
}

/// `max(ETAMIN, hmin / |h|)`.
fn eta_floor<V: Vector>(hmin: V::T, h: V::T) -> V::T {
    let floor = hmin / h.abs();
    if floor > V::T::from(ETAMIN) {
        floor
    } else {
        V::T::from(ETAMIN)
    }
}

/// Differentiated-interpolation over one Nordsieck column group.
#[allow(clippy::too_many_arguments)]
fn interp_columns<V: Vector>(
    cols: &[V],
    q: usize,
    tn: V::T,
    h: V::T,
    hu: V::T,
    t: V::T,
    k: usize,
    dky: &mut V,
) -> Result<(), NordsolError> {
    let one = V::T::one();
    let zero = V::T::zero();
    let uround = V::T::EPSILON;

    if k > q {
        return Err(OdeSolverError::BadK { k, q }.into());
    }

    let mut tfuzz = V::T::from(FUZZ_FACTOR) * uround * (tn.abs() + hu.abs());
    if hu < zero {
        tfuzz = -tfuzz;
    }
    let tp = tn - hu - tfuzz;
    let tn1 = tn + tfuzz;
    if (t - tp) * (t - tn1) > zero {
        return Err(OdeSolverError::BadT {
            t: t.as_f64(),
            tlo: (tn - hu).as_f64(),
            thi: tn.as_f64(),
        }
        .into());
    }

    let s = (t - tn) / h;
    for j in (k..=q).rev() {
        let mut c = one;
        for i in (j - k + 1..=j).rev() {
            c *= V::T::from(i as f64);
        }
        if j == q {
            dky.copy_from(&cols[q]);
            *dky *= scale(c);
        } else {
            dky.axpy(c, &cols[j], s);
        }
    }
    if k == 0 {
        return Ok(());
    }
    let r = h.pow(-(k as i32));
    *dky *= scale(r);
    Ok(())
}

/// Counters of the core integrator plus the optional subsystems.
#[derive(Clone, Debug, Serialize)]
pub struct SolverStatistics<T: Scalar> {
    pub nst: usize,
    pub nfe: usize,
    pub nsetups: usize,
    pub netf: usize,
    pub nni: usize,
    pub ncfn: usize,
    pub nhnil: usize,
    /// Order reductions forced by the stability-limit detector.
    pub nor: usize,
    pub njev: usize,
    pub nfev_dq: usize,
    pub last_order: usize,
    pub current_order: usize,
    pub last_step: T,
    pub current_step: T,
    pub initial_step: T,
    pub current_time: T,
    pub tolsf: T,
    pub quad: Option<QuadStatistics>,
    pub sens: Option<SensStatistics>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QuadStatistics {
    pub nfqe: usize,
    pub netf: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SensStatistics {
    pub nfse: usize,
    pub nfes: usize,
    pub nni: usize,
    pub ncfn: usize,
    pub netf: usize,
    pub nsetups: usize,
    pub nni1: Vec<usize>,
    pub ncfn1: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_solver::{DenseDirect, DiagApprox};
    use crate::ode_solver::equations::RhsResult;
    use crate::ode_solver::problem::SensOptions;
    use crate::ode_solver::sens::{SensCoupling, SensRhs1Fn, SensRhsFn};
    use crate::ode_solver::test_models::exponential_decay::{
        decay_rhs, decay_sens_rhs, decay_sens_solution, decay_solution,
    };
    use crate::ode_solver::test_models::oscillator::{cosine_quad_rhs, harmonic_rhs};
    use crate::ode_solver::test_models::van_der_pol::{vdp_jac, vdp_rhs};
    use nalgebra::DVector;

    type V = DVector<f64>;
    type RhsFn = fn(f64, &V, &V, &mut V) -> RhsResult;

    fn decay_solver() -> MultistepSolver<V, RhsFn> {
        let mut s = MultistepSolver::new(Method::Adams, IterType::Functional, decay_rhs as RhsFn);
        s.set_params(V::from_vec(vec![1.0]));
        s.init(0.0, &V::from_vec(vec![1.0]), 1e-8, Atol::Scalar(1e-10))
            .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        s
    }

    #[test]
    fn test_adams_functional_decay() {
        let mut s = decay_solver();
        let mut y = V::zeros(1);
        let (t, status) = s.solve_to(1.0, &mut y, Task::Normal).unwrap();
        assert_eq!(status, SolveStatus::Success);
        assert_eq!(t, 1.0);
        let exact = decay_solution(1.0, 1.0, 1.0);
        assert!((y[0] - exact).abs() < 1e-6, "y = {}, exact = {exact}", y[0]);
        let stats = s.statistics();
        assert!(stats.nst > 0);
        assert!(stats.nfe > stats.nst);
        assert!(stats.nni > 0);
    }

    #[test]
    fn test_bdf_newton_van_der_pol() {
        let mut s = MultistepSolver::new(Method::Bdf, IterType::Newton, vdp_rhs as RhsFn);
        s.attach_linear_solver(Box::new(DenseDirect::with_jacobian(vdp_jac)));
        s.init(0.0, &V::from_vec(vec![2.0, 0.0]), 1e-6, Atol::Scalar(1e-8))
            .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        let mut y = V::zeros(2);
        s.solve_to(3000.0, &mut y, Task::Normal).unwrap();
        assert!(y[0] > -2.01 && y[0] < -1.99, "y1 = {}", y[0]);
        let stats = s.statistics();
        assert!(stats.nst < 1200, "nst = {}", stats.nst);
        assert!(stats.nsetups > 0);
        assert!(stats.njev > 0);
    }

    #[test]
    fn test_bdf_newton_dq_jacobian() {
        // same problem without a user Jacobian: the DQ approximation must
        // carry the Newton iteration on a short stiff stretch
        let mut s = MultistepSolver::new(Method::Bdf, IterType::Newton, vdp_rhs as RhsFn);
        s.attach_linear_solver(Box::new(DenseDirect::new()));
        s.init(0.0, &V::from_vec(vec![2.0, 0.0]), 1e-6, Atol::Scalar(1e-8))
            .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        let mut y = V::zeros(2);
        s.solve_to(100.0, &mut y, Task::Normal).unwrap();
        assert!(s.statistics().nfev_dq > 0);
    }

    #[test]
    fn test_bdf_newton_diag_on_decoupled_system() {
        let rhs = |_t: f64, y: &V, _p: &V, ydot: &mut V| -> RhsResult {
            ydot[0] = -1000.0 * y[0];
            ydot[1] = -y[1];
            Ok(())
        };
        let mut s = MultistepSolver::new(Method::Bdf, IterType::Newton, rhs);
        s.attach_linear_solver(Box::new(DiagApprox::new()));
        s.init(0.0, &V::from_vec(vec![1.0, 1.0]), 1e-6, Atol::Scalar(1e-10))
            .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        let mut y = V::zeros(2);
        s.solve_to(1.0, &mut y, Task::Normal).unwrap();
        assert!(y[0].abs() < 1e-6, "stiff component y0 = {}", y[0]);
        assert!((y[1] - (-1.0f64).exp()).abs() < 1e-4, "y1 = {}", y[1]);
    }

    #[test]
    fn test_adams_harmonic_oscillator() {
        let mut s =
            MultistepSolver::new(Method::Adams, IterType::Functional, harmonic_rhs as RhsFn);
        s.init(0.0, &V::from_vec(vec![1.0, 0.0]), 1e-10, Atol::Scalar(1e-12))
            .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        let two_pi = 2.0 * std::f64::consts::PI;
        let mut y = V::zeros(2);
        s.solve_to(two_pi, &mut y, Task::Normal).unwrap();
        let err = ((y[0] - 1.0).powi(2) + y[1].powi(2)).sqrt();
        assert!(err <= 1e-8, "err = {err}");
    }

    #[test]
    fn test_pure_quadrature_of_cosine() {
        let rhs = |_t: f64, _y: &V, _p: &V, ydot: &mut V| -> RhsResult {
            ydot.fill(0.0);
            Ok(())
        };
        let mut s = MultistepSolver::new(Method::Adams, IterType::Functional, rhs);
        s.init(0.0, &V::from_vec(vec![0.0]), 1e-6, Atol::Scalar(1e-8))
            .unwrap();
        s.quad_init(
            cosine_quad_rhs,
            &V::from_vec(vec![0.0]),
            1e-6,
            Atol::Scalar(1e-8),
        )
        .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        let pi = std::f64::consts::PI;
        let mut y = V::zeros(1);
        s.solve_to(pi, &mut y, Task::Normal).unwrap();
        let mut q = V::zeros(1);
        s.interpolate_quad_dky(pi, 0, &mut q).unwrap();
        // q(pi) = sin(pi) = 0
        assert!(q[0].abs() < 1e-4, "q = {}", q[0]);
        assert!(s.statistics().quad.unwrap().nfqe > 0);
    }

    fn run_decay_sens(coupling: SensCoupling<V>) -> (f64, f64) {
        let mut s = MultistepSolver::new(Method::Adams, IterType::Functional, decay_rhs as RhsFn);
        s.init(0.0, &V::from_vec(vec![1.0]), 1e-8, Atol::Scalar(1e-10))
            .unwrap();
        s.set_max_num_steps(100_000).unwrap();
        s.sens_init(
            coupling,
            V::from_vec(vec![1.0]),
            &[V::zeros(1)],
            SensOptions {
                pbar: Some(vec![1.0]),
                ..Default::default()
            },
        )
        .unwrap();
        let mut y = V::zeros(1);
        s.solve_to(1.0, &mut y, Task::Normal).unwrap();
        let sv = s.interpolate_sens_all(1.0).unwrap();
        (y[0], sv[0][0])
    }

    #[test]
    fn test_sensitivity_couplings_agree() {
        let y_exact = decay_solution(1.0, 1.0, 1.0);
        let s_exact = decay_sens_solution(1.0, 1.0, 1.0);

        let (y_sim, s_sim) = run_decay_sens(SensCoupling::Simultaneous(SensRhsFn::DiffQuotient));
        assert!((y_sim - y_exact).abs() < 1e-6, "y = {y_sim}");
        assert!((s_sim - s_exact).abs() < 1e-4, "s = {s_sim}, exact = {s_exact}");

        let (y_st, s_st) = run_decay_sens(SensCoupling::Staggered(SensRhsFn::DiffQuotient));
        let (y_s1, s_s1) = run_decay_sens(SensCoupling::Staggered1(SensRhs1Fn::DiffQuotient));
        assert!((y_st - y_sim).abs() < 1e-6);
        assert!((s_st - s_sim).abs() < 1e-6);
        assert!((y_s1 - y_sim).abs() < 1e-6);
        assert!((s_s1 - s_sim).abs() < 1e-6);
    }

    #[test]
    fn test_sensitivity_analytic_supplier() {
        let (y, sv) = run_decay_sens(SensCoupling::Staggered1(SensRhs1Fn::One(Box::new(
            decay_sens_rhs,
        ))));
        let y_exact = decay_solution(1.0, 1.0, 1.0);
        let s_exact = decay_sens_solution(1.0, 1.0, 1.0);
        assert!((y - y_exact).abs() < 1e-6);
        assert!((sv - s_exact).abs() < 1e-6, "s = {sv}, exact = {s_exact}");
    }

    #[test]
    fn test_tstop_halts_exactly() {
        let mut s = decay_solver();
        s.set_stop_time(5.0).unwrap();
        let mut y = V::zeros(1);
        let (t, status) = s.solve_to(10.0, &mut y, Task::NormalTstop).unwrap();
        assert_eq!(status, SolveStatus::TstopReturn);
        assert_eq!(t, 5.0);
        let y_interp = s.interpolate(5.0).unwrap();
        assert_eq!(y[0], y_interp[0]);
        // the mesh never moved past the stop time (within rounding)
        assert!(s.current_time() <= 5.0 + 1e-9);
    }

    #[test]
    fn test_tout_at_t0_is_too_close() {
        let mut s = decay_solver();
        let mut y = V::zeros(1);
        let err = s.solve_to(0.0, &mut y, Task::Normal).unwrap_err();
        assert!(matches!(
            err,
            NordsolError::OdeSolverError(OdeSolverError::TooClose)
        ));
    }

    #[test]
    fn test_mxstep_exhaustion() {
        let mut s = decay_solver();
        s.set_max_num_steps(5).unwrap();
        let mut y = V::zeros(1);
        let err = s.solve_to(1000.0, &mut y, Task::Normal).unwrap_err();
        assert!(matches!(
            err,
            NordsolError::OdeSolverError(OdeSolverError::TooMuchWork { .. })
        ));
        // the output still holds the last accepted state
        assert_eq!(y[0], s.current_state()[0]);
    }

    #[test]
    fn test_one_step_mode() {
        let mut s = decay_solver();
        let mut y = V::zeros(1);
        let (t, status) = s.solve_to(1.0, &mut y, Task::OneStep).unwrap();
        assert_eq!(status, SolveStatus::Success);
        assert_eq!(t, s.current_time());
        assert_eq!(s.statistics().nst, 1);
        assert!(t < 1.0);
    }

    #[test]
    fn test_reinit_reproduces_trajectory() {
        let mut s = decay_solver();
        let mut y1 = V::zeros(1);
        s.solve_to(1.0, &mut y1, Task::Normal).unwrap();
        let nst1 = s.statistics().nst;

        s.reinit(0.0, &V::from_vec(vec![1.0]), 1e-8, Atol::Scalar(1e-10))
            .unwrap();
        let mut y2 = V::zeros(1);
        s.solve_to(1.0, &mut y2, Task::Normal).unwrap();
        assert_eq!(y1[0], y2[0]);
        assert_eq!(nst1, s.statistics().nst);
    }

    #[test]
    fn test_interpolation_identities() {
        let mut s = decay_solver();
        let mut y = V::zeros(1);
        for _ in 0..5 {
            s.solve_to(10.0, &mut y, Task::OneStep).unwrap();
        }
        let tn = s.current_time();

        // order-0 interpolation at tn returns the state exactly
        let y0 = s.interpolate(tn).unwrap();
        assert_eq!(y0[0], s.current_state()[0]);

        // order-1 interpolation at tn returns zn[1] / h
        let mut d1 = V::zeros(1);
        s.interpolate_dky(tn, 1, &mut d1).unwrap();
        let expect = s.hist.zn[1][0] / s.h;
        assert!((d1[0] - expect).abs() <= 1e-12 * expect.abs().max(1.0));

        // out-of-range requests are rejected
        assert!(s.interpolate_dky(tn, s.q + 1, &mut d1).is_err());
        let far = tn + 1000.0;
        assert!(matches!(
            s.interpolate(far).unwrap_err(),
            NordsolError::OdeSolverError(OdeSolverError::BadT { .. })
        ));
    }

    #[test]
    fn test_sldet_runs_on_bdf() {
        let mut s = MultistepSolver::new(Method::Bdf, IterType::Newton, vdp_rhs as RhsFn);
        s.attach_linear_solver(Box::new(DenseDirect::with_jacobian(vdp_jac)));
        s.init(0.0, &V::from_vec(vec![2.0, 0.0]), 1e-6, Atol::Scalar(1e-8))
            .unwrap();
        s.set_stab_lim_det(true).unwrap();
        s.set_max_num_steps(100_000).unwrap();
        let mut y = V::zeros(2);
        s.solve_to(200.0, &mut y, Task::Normal).unwrap();
        // the detector ran without disturbing the integration
        assert!(y[0].abs() < 3.0);
    }

    #[test]
    fn test_statistics_serialize() {
        let mut s = decay_solver();
        let mut y = V::zeros(1);
        s.solve_to(0.5, &mut y, Task::Normal).unwrap();
        let stats = s.statistics();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"nst\""));
        assert!(json.contains("\"current_time\""));
    }
}
