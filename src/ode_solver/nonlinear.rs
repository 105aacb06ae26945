use num_traits::{One, Zero};
use nalgebra::ComplexField;
use crate::error::{NonLinearSolverError, NordsolError, OdeSolverError};
use crate::linear_solver::{ConvFail, LinearSolverCtx};
use crate::scalar::{scale, Scalar};
use crate::vector::Vector;

use super::equations::{OdeRhs, RhsError, RhsResult};
use super::sens::{SensMethod, SensRhsEval};
use super::solver::{MultistepSolver, ETACF, ONEPSM};
use super::weights::{sens_norm, update_norm};
use super::{ErrCon, IterType};

/// Lower bound factor in the convergence-rate estimate.
pub(crate) const CRDOWN: f64 = 0.3;
/// A `|gamrat - 1|` above this forces a linear solver setup.
pub(crate) const DGMAX: f64 = 0.3;
/// Divergence declared when successive correction norms grow by this factor.
pub(crate) const RDIV: f64 = 2.0;
/// Maximum steps between linear solver setups.
pub(crate) const MSBP: usize = 20;

/// What happened on the previous attempt of the current step, fed to the
/// corrector so it can decide on a linear solver setup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NlsFlag {
    FirstCall,
    PrevConvFail,
    PrevErrFail,
}

/// Corrector outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NlsOutcome {
    Solved,
    /// Recoverable: the step machinery retries with a smaller step.
    ConvFail,
    /// Unrecoverable linear solver setup failure.
    SetupFailed,
    /// Unrecoverable linear solver solve failure.
    SolveFailed,
    /// Unrecoverable RHS failure.
    RhsFailed,
}

/// Newton-specific internal status: `TryAgain` asks the outer loop to redo
/// the setup with fresh Jacobian data and repeat the iteration.
enum NewtonStatus {
    Outcome(NlsOutcome),
    TryAgain,
}

/// What the step loop does after the corrector and its failure handling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StepAttempt {
    DoErrorTest,
    PredictAgain,
}

/// Which convergence-failure counters a corrector failure is charged to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CfTarget {
    State,
    Sens,
    Sens1(usize),
}

/// Input-state selector for a sensitivity RHS evaluation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum YSel {
    /// The predicted state `zn[0]`.
    Predicted,
    /// The corrected state `y`.
    Corrected,
}

/// Which vector holds `f(t, y)` for a sensitivity RHS evaluation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DotSel {
    Zn1,
    Tempv,
    Ftemp,
}

/// Destination group for a sensitivity RHS evaluation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum OutSel {
    Tempv,
    Ftemp,
}

fn rhs_outcome(e: RhsError) -> NlsOutcome {
    match e {
        RhsError::Recoverable => NlsOutcome::ConvFail,
        RhsError::Unrecoverable => NlsOutcome::RhsFailed,
    }
}

impl<V: Vector, F: OdeRhs<V>> MultistepSolver<V, F> {
    /// Evaluate all sensitivity right-hand sides at the selected state, into
    /// the selected destination group.
    pub(crate) fn sens_rhs_all(
        &mut self,
        t: V::T,
        y_sel: YSel,
        dot_sel: DotSel,
        load_ys: bool,
        out_sel: OutSel,
    ) -> RhsResult {
        let sens = self.sens.as_mut().expect("sensitivities enabled");
        if load_ys {
            for (is, ysi) in sens.ys.iter_mut().enumerate() {
                ysi.copy_from(&self.hist.zns[is][0]);
            }
        }
        let y = match y_sel {
            YSel::Predicted => &self.hist.zn[0],
            YSel::Corrected => &self.y,
        };
        let ydot = match dot_sel {
            DotSel::Zn1 => &self.hist.zn[1],
            DotSel::Tempv => &self.tempv,
            DotSel::Ftemp => &self.ftemp,
        };
        let out = match out_sel {
            OutSel::Tempv => &mut sens.tempv,
            OutSel::Ftemp => &mut sens.ftemp,
        };
        let mut ev = SensRhsEval {
            coupling: &sens.coupling,
            p: &mut self.p,
            pbar: &sens.pbar,
            plist: &sens.plist,
            ewt: &self.ewt,
            rtol: self.rtol,
            rhomax: sens.rhomax,
            ytemp: &mut sens.ytemp_dq,
            ftemp: &mut sens.ftemp_dq,
            nfse: &mut sens.nfse,
            nfes: &mut sens.nfes,
        };
        ev.all(&self.rhs, t, y, ydot, &sens.ys, out)
    }

    /// Evaluate the `is`-th sensitivity right-hand side at the corrected
    /// state `y` with `f(t, y)` in `ftemp`.
    pub(crate) fn sens_rhs1(
        &mut self,
        t: V::T,
        is: usize,
        ys_from_zn0: bool,
        out_sel: OutSel,
    ) -> RhsResult {
        let sens = self.sens.as_mut().expect("sensitivities enabled");
        let ysi = if ys_from_zn0 {
            &self.hist.zns[is][0]
        } else {
            &sens.ys[is]
        };
        let out = match out_sel {
            OutSel::Tempv => &mut sens.tempv[is],
            OutSel::Ftemp => &mut sens.ftemp[is],
        };
        let mut ev = SensRhsEval {
            coupling: &sens.coupling,
            p: &mut self.p,
            pbar: &sens.pbar,
            plist: &sens.plist,
            ewt: &self.ewt,
            rtol: self.rtol,
            rhomax: sens.rhomax,
            ytemp: &mut sens.ytemp_dq,
            ftemp: &mut sens.ftemp_dq,
            nfse: &mut sens.nfse,
            nfes: &mut sens.nfes,
        };
        ev.one(&self.rhs, t, &self.y, &self.ftemp, is, ysi, out)
    }

    /// Copy the sensitivity scratch group into column 1 of the history.
    pub(crate) fn copy_sens_tempv_to_zn1(&mut self) {
        let s = self.sens.as_ref().expect("sensitivities enabled");
        for is in 0..s.ns {
            self.hist.zns[is][1].copy_from(&s.tempv[is]);
        }
    }

    fn sens_simultaneous(&self) -> bool {
        self.sens
            .as_ref()
            .is_some_and(|s| s.coupling.method() == SensMethod::Simultaneous)
    }

    fn sens_errcon_full(&self) -> bool {
        self.sens.as_ref().is_some_and(|s| s.errcon == ErrCon::Full)
    }

    /// Solve the nonlinear system of the current step attempt.
    pub(crate) fn nls(&mut self, nflag: NlsFlag) -> NlsOutcome {
        match self.iter {
            IterType::Functional => self.nls_functional(),
            IterType::Newton => self.nls_newton(nflag),
        }
    }

    /// Fixed-point iteration on the implicit step equation, accumulating the
    /// correction in `acor`. With the simultaneous coupling, the iteration
    /// runs on the combined state+sensitivity system and the convergence
    /// test uses the combined norm.
    fn nls_functional(&mut self) -> NlsOutcome {
        let zero = V::T::zero();
        let one = V::T::one();
        let h = self.h;
        let rl1 = self.coeffs.rl1;
        let tq4 = self.coeffs.tq[4];
        let do_sim = self.sens_simultaneous();

        self.conv_rate = one;
        let mut m = 0usize;

        if let Err(e) = self
            .rhs
            .call(self.tn, &self.hist.zn[0], &self.p, &mut self.tempv)
        {
            return rhs_outcome(e);
        }
        self.nfe += 1;

        if do_sim {
            if let Err(e) =
                self.sens_rhs_all(self.tn, YSel::Predicted, DotSel::Tempv, true, OutSel::Tempv)
            {
                return rhs_outcome(e);
            }
        }

        self.acor.fill(zero);
        if do_sim {
            let s = self.sens.as_mut().unwrap();
            for a in s.acor.iter_mut() {
                a.fill(zero);
            }
        }

        let mut delp = zero;
        loop {
            self.nni += 1;

            // y = zn[0] + rl1 * (h * f - zn[1])
            self.tempv.axpy(-one, &self.hist.zn[1], h);
            self.tempv *= scale(rl1);
            self.y
                .linear_sum(one, &self.hist.zn[0], one, &self.tempv);

            if do_sim {
                let s = self.sens.as_mut().unwrap();
                for is in 0..s.ns {
                    s.tempv[is].axpy(-one, &self.hist.zns[is][1], h);
                    s.tempv[is] *= scale(rl1);
                    s.ys[is].linear_sum(one, &self.hist.zns[is][0], one, &s.tempv[is]);
                }
            }

            // increment of the accumulated correction since last iterate
            self.acor.axpy(one, &self.tempv, -one);
            let del = self.acor.wrms_norm(&self.ewt);
            let mut del_total = del;
            if do_sim {
                let s = self.sens.as_mut().unwrap();
                for is in 0..s.ns {
                    s.acor[is].axpy(one, &s.tempv[is], -one);
                }
                del_total = update_norm(del, sens_norm(&s.acor, &s.ewt));
            }
            self.acor.copy_from(&self.tempv);
            if do_sim {
                let s = self.sens.as_mut().unwrap();
                for is in 0..s.ns {
                    s.acor[is].copy_from(&s.tempv[is]);
                }
            }

            if m > 0 {
                let r = del_total / delp;
                let lowered = V::T::from(CRDOWN) * self.conv_rate;
                self.conv_rate = if lowered > r { lowered } else { r };
            }
            let crate_capped = if self.conv_rate < one { self.conv_rate } else { one };
            let dcon = del_total * crate_capped / tq4;

            if dcon <= one {
                let full = do_sim && self.sens_errcon_full();
                self.acnrm = if m == 0 {
                    if full {
                        del_total
                    } else {
                        del
                    }
                } else {
                    let a = self.acor.wrms_norm(&self.ewt);
                    if full {
                        let s = self.sens.as_ref().unwrap();
                        update_norm(a, sens_norm(&s.acor, &s.ewt))
                    } else {
                        a
                    }
                };
                return NlsOutcome::Solved;
            }

            m += 1;
            if m == self.maxcor || (m >= 2 && del_total > V::T::from(RDIV) * delp) {
                return NlsOutcome::ConvFail;
            }
            delp = del_total;

            if let Err(e) = self.rhs.call(self.tn, &self.y, &self.p, &mut self.tempv) {
                return rhs_outcome(e);
            }
            self.nfe += 1;
            if do_sim {
                if let Err(e) =
                    self.sens_rhs_all(self.tn, YSel::Corrected, DotSel::Tempv, false, OutSel::Tempv)
                {
                    return rhs_outcome(e);
                }
            }
        }
    }

    /// Newton corrector: decide on a setup, run the iteration, and redo the
    /// setup with fresh Jacobian data if the iteration asks for it.
    ///
    /// With the simultaneous coupling the combined system is solved
    /// quasi-Newton: the iteration matrix is approximated by its block
    /// diagonal, so each right-hand side goes through the same factored
    /// matrix.
    fn nls_newton(&mut self, nflag: NlsFlag) -> NlsOutcome {
        let zero = V::T::zero();
        let one = V::T::one();
        let do_sim = self.sens_simultaneous();

        let mut convfail = if matches!(nflag, NlsFlag::FirstCall | NlsFlag::PrevErrFail) {
            ConvFail::NoFailures
        } else {
            ConvFail::FailOther
        };

        let mut call_setup = matches!(nflag, NlsFlag::PrevConvFail | NlsFlag::PrevErrFail)
            || self.nst == 0
            || self.nst >= self.nstlp + MSBP
            || (self.coeffs.gamrat - one).abs() > V::T::from(DGMAX);
        if self.force_setup {
            call_setup = true;
            convfail = ConvFail::FailOther;
        }

        loop {
            if let Err(e) = self
                .rhs
                .call(self.tn, &self.hist.zn[0], &self.p, &mut self.ftemp)
            {
                return rhs_outcome(e);
            }
            self.nfe += 1;

            if do_sim {
                if let Err(e) =
                    self.sens_rhs_all(self.tn, YSel::Predicted, DotSel::Ftemp, true, OutSel::Ftemp)
                {
                    return rhs_outcome(e);
                }
            }

            if call_setup {
                let setup_res = {
                    let ctx = LinearSolverCtx {
                        t: self.tn,
                        gamma: self.coeffs.gamma,
                        gammap: self.coeffs.gammap,
                        gamrat: self.coeffs.gamrat,
                        h: self.h,
                        nst: self.nst,
                        method: self.method,
                        ewt: &self.ewt,
                        rhs: &self.rhs,
                        p: &self.p,
                    };
                    let ls = self.lsolver.as_mut().expect("newton requires a linear solver");
                    ls.setup(ctx, convfail, &self.hist.zn[0], &self.ftemp)
                };
                self.nsetups += 1;
                call_setup = false;
                self.force_setup = false;
                self.coeffs.gamrat = one;
                self.coeffs.gammap = self.coeffs.gamma;
                self.conv_rate = one;
                if let Some(s) = self.sens.as_mut() {
                    s.conv_rate = one;
                }
                self.nstlp = self.nst;
                match setup_res {
                    Err(e) => {
                        return if e.is_recoverable() {
                            NlsOutcome::ConvFail
                        } else {
                            NlsOutcome::SetupFailed
                        }
                    }
                    Ok(jc) => self.jcur = jc,
                }
            }

            self.acor.fill(zero);
            self.y.copy_from(&self.hist.zn[0]);
            if do_sim {
                let s = self.sens.as_mut().unwrap();
                for is in 0..s.ns {
                    s.acor[is].fill(zero);
                    s.ys[is].copy_from(&self.hist.zns[is][0]);
                }
            }

            match self.newton_iteration() {
                NewtonStatus::Outcome(o) => return o,
                NewtonStatus::TryAgain => {
                    call_setup = true;
                    convfail = ConvFail::FailBadJ;
                }
            }
        }
    }

    fn newton_iteration(&mut self) -> NewtonStatus {
        let zero = V::T::zero();
        let one = V::T::one();
        let rl1 = self.coeffs.rl1;
        let gamma = self.coeffs.gamma;
        let tq4 = self.coeffs.tq[4];
        let do_sim = self.sens_simultaneous();

        let mut m = 0usize;
        let mut delp = zero;

        loop {
            // residual: b = gamma * f - (rl1 * zn[1] + acor)
            self.tempv
                .linear_sum(rl1, &self.hist.zn[1], one, &self.acor);
            self.tempv.axpy(gamma, &self.ftemp, -one);

            let solve_res = {
                let ctx = LinearSolverCtx {
                    t: self.tn,
                    gamma,
                    gammap: self.coeffs.gammap,
                    gamrat: self.coeffs.gamrat,
                    h: self.h,
                    nst: self.nst,
                    method: self.method,
                    ewt: &self.ewt,
                    rhs: &self.rhs,
                    p: &self.p,
                };
                let ls = self.lsolver.as_mut().unwrap();
                ls.solve(ctx, &mut self.tempv, &self.ewt, &self.y, &self.ftemp)
            };
            self.nni += 1;
            if let Err(e) = solve_res {
                return self.solve_failure_status(e.is_recoverable());
            }

            if do_sim {
                let ns = self.sens.as_ref().unwrap().ns;
                {
                    let s = self.sens.as_mut().unwrap();
                    for is in 0..ns {
                        s.tempv[is].linear_sum(rl1, &self.hist.zns[is][1], one, &s.acor[is]);
                        s.tempv[is].axpy(gamma, &s.ftemp[is], -one);
                    }
                }
                for is in 0..ns {
                    let res = {
                        let ctx = LinearSolverCtx {
                            t: self.tn,
                            gamma,
                            gammap: self.coeffs.gammap,
                            gamrat: self.coeffs.gamrat,
                            h: self.h,
                            nst: self.nst,
                            method: self.method,
                            ewt: &self.ewt,
                            rhs: &self.rhs,
                            p: &self.p,
                        };
                        let ls = self.lsolver.as_mut().unwrap();
                        let s = self.sens.as_mut().unwrap();
                        ls.solve(ctx, &mut s.tempv[is], &s.ewt[is], &self.y, &self.ftemp)
                    };
                    if let Err(e) = res {
                        return self.solve_failure_status(e.is_recoverable());
                    }
                }
            }

            let del = self.tempv.wrms_norm(&self.ewt);
            self.acor.axpy(one, &self.tempv, one);
            self.y.linear_sum(one, &self.hist.zn[0], one, &self.acor);

            let mut del_total = del;
            if do_sim {
                let s = self.sens.as_mut().unwrap();
                del_total = update_norm(del, sens_norm(&s.tempv, &s.ewt));
                for is in 0..s.ns {
                    s.acor[is].axpy(one, &s.tempv[is], one);
                    s.ys[is].linear_sum(one, &self.hist.zns[is][0], one, &s.acor[is]);
                }
            }

            if m > 0 {
                let r = del_total / delp;
                let lowered = V::T::from(CRDOWN) * self.conv_rate;
                self.conv_rate = if lowered > r { lowered } else { r };
            }
            let crate_capped = if self.conv_rate < one { self.conv_rate } else { one };
            let dcon = del_total * crate_capped / tq4;

            if dcon <= one {
                let full = do_sim && self.sens_errcon_full();
                self.acnrm = if m == 0 {
                    if full {
                        del_total
                    } else {
                        del
                    }
                } else {
                    let a = self.acor.wrms_norm(&self.ewt);
                    if full {
                        let s = self.sens.as_ref().unwrap();
                        update_norm(a, sens_norm(&s.acor, &s.ewt))
                    } else {
                        a
                    }
                };
                self.jcur = false;
                return NewtonStatus::Outcome(NlsOutcome::Solved);
            }

            m += 1;
            if m == self.maxcor || (m >= 2 && del_total > V::T::from(RDIV) * delp) {
                return if !self.jcur {
                    NewtonStatus::TryAgain
                } else {
                    NewtonStatus::Outcome(NlsOutcome::ConvFail)
                };
            }
            delp = del_total;

            if let Err(e) = self.rhs.call(self.tn, &self.y, &self.p, &mut self.ftemp) {
                return NewtonStatus::Outcome(rhs_outcome(e));
            }
            self.nfe += 1;
            if do_sim {
                if let Err(e) =
                    self.sens_rhs_all(self.tn, YSel::Corrected, DotSel::Ftemp, false, OutSel::Ftemp)
                {
                    return NewtonStatus::Outcome(rhs_outcome(e));
                }
            }
        }
    }

    fn solve_failure_status(&self, recoverable: bool) -> NewtonStatus {
        if !recoverable {
            NewtonStatus::Outcome(NlsOutcome::SolveFailed)
        } else if !self.jcur {
            NewtonStatus::TryAgain
        } else {
            NewtonStatus::Outcome(NlsOutcome::ConvFail)
        }
    }

    /// Staggered sensitivity corrector: solve all sensitivities as one
    /// system against the accepted state.
    pub(crate) fn stgr_nls(&mut self) -> NlsOutcome {
        match self.iter {
            IterType::Functional => self.stgr_nls_functional(),
            IterType::Newton => self.stgr_nls_newton(),
        }
    }

    fn stgr_nls_functional(&mut self) -> NlsOutcome {
        let zero = V::T::zero();
        let one = V::T::one();
        let h = self.h;
        let rl1 = self.coeffs.rl1;
        let tq4 = self.coeffs.tq[4];

        {
            let s = self.sens.as_mut().unwrap();
            s.conv_rate = one;
        }
        let mut m = 0usize;

        if let Err(e) = self.sens_rhs_all(self.tn, YSel::Corrected, DotSel::Ftemp, true, OutSel::Tempv)
        {
            return rhs_outcome(e);
        }
        {
            let s = self.sens.as_mut().unwrap();
            for a in s.acor.iter_mut() {
                a.fill(zero);
            }
        }

        let mut delp = zero;
        loop {
            let del = {
                let s = self.sens.as_mut().unwrap();
                s.nni += 1;
                for is in 0..s.ns {
                    s.tempv[is].axpy(-one, &self.hist.zns[is][1], h);
                    s.tempv[is] *= scale(rl1);
                    s.ys[is].linear_sum(one, &self.hist.zns[is][0], one, &s.tempv[is]);
                }
                for is in 0..s.ns {
                    s.acor[is].axpy(one, &s.tempv[is], -one);
                }
                let del = sens_norm(&s.acor, &s.ewt);
                for is in 0..s.ns {
                    s.acor[is].copy_from(&s.tempv[is]);
                }
                if m > 0 {
                    let r = del / delp;
                    let lowered = V::T::from(CRDOWN) * s.conv_rate;
                    s.conv_rate = if lowered > r { lowered } else { r };
                }
                let crate_capped = if s.conv_rate < one { s.conv_rate } else { one };
                let dcon = del * crate_capped / tq4;
                if dcon <= one {
                    if s.errcon == ErrCon::Full {
                        s.acnrm = if m == 0 { del } else { sens_norm(&s.acor, &s.ewt) };
                    }
                    return NlsOutcome::Solved;
                }
                del
            };

            m += 1;
            let (maxcor_s, diverging) = {
                let s = self.sens.as_ref().unwrap();
                (s.maxcor, m >= 2 && del > V::T::from(RDIV) * delp)
            };
            if m == maxcor_s || diverging {
                return NlsOutcome::ConvFail;
            }
            delp = del;

            if let Err(e) =
                self.sens_rhs_all(self.tn, YSel::Corrected, DotSel::Ftemp, false, OutSel::Tempv)
            {
                return rhs_outcome(e);
            }
        }
    }

    fn stgr_nls_newton(&mut self) -> NlsOutcome {
        let zero = V::T::zero();
        let one = V::T::one();

        loop {
            {
                let s = self.sens.as_mut().unwrap();
                for is in 0..s.ns {
                    s.acor[is].fill(zero);
                    s.ys[is].copy_from(&self.hist.zns[is][0]);
                }
            }
            if let Err(e) =
                self.sens_rhs_all(self.tn, YSel::Corrected, DotSel::Ftemp, false, OutSel::Ftemp)
            {
                return rhs_outcome(e);
            }

            match self.stgr_newton_iteration() {
                NewtonStatus::Outcome(o) => return o,
                NewtonStatus::TryAgain => {
                    // fresh Jacobian data at the accepted state, then retry
                    let setup_res = {
                        let ctx = LinearSolverCtx {
                            t: self.tn,
                            gamma: self.coeffs.gamma,
                            gammap: self.coeffs.gammap,
                            gamrat: self.coeffs.gamrat,
                            h: self.h,
                            nst: self.nst,
                            method: self.method,
                            ewt: &self.ewt,
                            rhs: &self.rhs,
                            p: &self.p,
                        };
                        let ls = self.lsolver.as_mut().expect("newton requires a linear solver");
                        ls.setup(ctx, ConvFail::FailBadJ, &self.y, &self.ftemp)
                    };
                    self.nsetups += 1;
                    self.coeffs.gamrat = one;
                    self.coeffs.gammap = self.coeffs.gamma;
                    self.conv_rate = one;
                    self.nstlp = self.nst;
                    {
                        let s = self.sens.as_mut().unwrap();
                        s.nsetups += 1;
                        s.conv_rate = one;
                    }
                    match setup_res {
                        Err(e) => {
                            return if e.is_recoverable() {
                                NlsOutcome::ConvFail
                            } else {
                                NlsOutcome::SetupFailed
                            }
                        }
                        Ok(jc) => self.jcur = jc,
                    }
                }
            }
        }
    }

    fn stgr_newton_iteration(&mut self) -> NewtonStatus {
        let zero = V::T::zero();
        let one = V::T::one();
        let rl1 = self.coeffs.rl1;
        let gamma = self.coeffs.gamma;
        let tq4 = self.coeffs.tq[4];

        let mut m = 0usize;
        let mut delp = zero;

        loop {
            {
                let s = self.sens.as_mut().unwrap();
                for is in 0..s.ns {
                    s.tempv[is].linear_sum(rl1, &self.hist.zns[is][1], one, &s.acor[is]);
                    s.tempv[is].axpy(gamma, &s.ftemp[is], -one);
                }
                s.nni += 1;
            }

            let ns = self.sens.as_ref().unwrap().ns;
            for is in 0..ns {
                let res = {
                    let ctx = LinearSolverCtx {
                        t: self.tn,
                        gamma,
                        gammap: self.coeffs.gammap,
                        gamrat: self.coeffs.gamrat,
                        h: self.h,
                        nst: self.nst,
                        method: self.method,
                        ewt: &self.ewt,
                        rhs: &self.rhs,
                        p: &self.p,
                    };
                    let ls = self.lsolver.as_mut().unwrap();
                    let s = self.sens.as_mut().unwrap();
                    ls.solve(ctx, &mut s.tempv[is], &s.ewt[is], &self.y, &self.ftemp)
                };
                if let Err(e) = res {
                    return self.solve_failure_status(e.is_recoverable());
                }
            }

            let (del, dcon, maxcor_s) = {
                let s = self.sens.as_mut().unwrap();
                let del = sens_norm(&s.tempv, &s.ewt);
                for is in 0..s.ns {
                    s.acor[is].axpy(one, &s.tempv[is], one);
                    s.ys[is].linear_sum(one, &self.hist.zns[is][0], one, &s.acor[is]);
                }
                if m > 0 {
                    let r = del / delp;
                    let lowered = V::T::from(CRDOWN) * s.conv_rate;
                    s.conv_rate = if lowered > r { lowered } else { r };
                }
                let crate_capped = if s.conv_rate < one { s.conv_rate } else { one };
                (del, del * crate_capped / tq4, s.maxcor)
            };

            if dcon <= one {
                let s = self.sens.as_mut().unwrap();
                if s.errcon == ErrCon::Full {
                    s.acnrm = if m == 0 { del } else { sens_norm(&s.acor, &s.ewt) };
                }
                self.jcur = false;
                return NewtonStatus::Outcome(NlsOutcome::Solved);
            }

            m += 1;
            if m == maxcor_s || (m >= 2 && del > V::T::from(RDIV) * delp) {
                return if !self.jcur {
                    NewtonStatus::TryAgain
                } else {
                    NewtonStatus::Outcome(NlsOutcome::ConvFail)
                };
            }
            delp = del;

            if let Err(e) =
                self.sens_rhs_all(self.tn, YSel::Corrected, DotSel::Ftemp, false, OutSel::Ftemp)
            {
                return NewtonStatus::Outcome(rhs_outcome(e));
            }
        }
    }

    /// One-at-a-time staggered corrector for sensitivity `is`.
    pub(crate) fn stgr1_nls(&mut self, is: usize) -> NlsOutcome {
        match self.iter {
            IterType::Functional => self.stgr1_nls_functional(is),
            IterType::Newton => self.stgr1_nls_newton(is),
        }
    }

    fn stgr1_nls_functional(&mut self, is: usize) -> NlsOutcome {
        let zero = V::T::zero();
        let one = V::T::one();
        let h = self.h;
        let rl1 = self.coeffs.rl1;
        let tq4 = self.coeffs.tq[4];

        {
            let s = self.sens.as_mut().unwrap();
            s.conv_rate = one;
        }
        let mut m = 0usize;

        if let Err(e) = self.sens_rhs1(self.tn, is, true, OutSel::Tempv) {
            return rhs_outcome(e);
        }
        {
            let s = self.sens.as_mut().unwrap();
            s.acor[is].fill(zero);
        }

        let mut delp = zero;
        loop {
            let (del, dcon, maxcor_s) = {
                let s = self.sens.as_mut().unwrap();
                s.nni1[is] += 1;
                s.tempv[is].axpy(-one, &self.hist.zns[is][1], h);
                s.tempv[is] *= scale(rl1);
                s.ys[is].linear_sum(one, &self.hist.zns[is][0], one, &s.tempv[is]);

                s.acor[is].axpy(one, &s.tempv[is], -one);
                let del = s.acor[is].wrms_norm(&s.ewt[is]);
                s.acor[is].copy_from(&s.tempv[is]);

                if m > 0 {
                    let r = del / delp;
                    let lowered = V::T::from(CRDOWN) * s.conv_rate;
                    s.conv_rate = if lowered > r { lowered } else { r };
                }
                let crate_capped = if s.conv_rate < one { s.conv_rate } else { one };
                (del, del * crate_capped / tq4, s.maxcor)
            };

            if dcon <= one {
                return NlsOutcome::Solved;
            }

            m += 1;
            if m == maxcor_s || (m >= 2 && del > V::T::from(RDIV) * delp) {
                return NlsOutcome::ConvFail;
            }
            delp = del;

            if let Err(e) = self.sens_rhs1(self.tn, is, false, OutSel::Tempv) {
                return rhs_outcome(e);
            }
        }
    }

    fn stgr1_nls_newton(&mut self, is: usize) -> NlsOutcome {
        let zero = V::T::zero();
        let one = V::T::one();

        loop {
            {
                let s = self.sens.as_mut().unwrap();
                s.acor[is].fill(zero);
                s.ys[is].copy_from(&self.hist.zns[is][0]);
            }
            if let Err(e) = self.sens_rhs1(self.tn, is, false, OutSel::Ftemp) {
                return rhs_outcome(e);
            }

            match self.stgr1_newton_iteration(is) {
                NewtonStatus::Outcome(o) => return o,
                NewtonStatus::TryAgain => {
                    let setup_res = {
                        let ctx = LinearSolverCtx {
                            t: self.tn,
                            gamma: self.coeffs.gamma,
                            gammap: self.coeffs.gammap,
                            gamrat: self.coeffs.gamrat,
                            h: self.h,
                            nst: self.nst,
                            method: self.method,
                            ewt: &self.ewt,
                            rhs: &self.rhs,
                            p: &self.p,
                        };
                        let ls = self.lsolver.as_mut().expect("newton requires a linear solver");
                        ls.setup(ctx, ConvFail::FailBadJ, &self.y, &self.ftemp)
                    };
                    self.nsetups += 1;
                    self.coeffs.gamrat = one;
                    self.coeffs.gammap = self.coeffs.gamma;
                    self.conv_rate = one;
                    self.nstlp = self.nst;
                    {
                        let s = self.sens.as_mut().unwrap();
                        s.nsetups += 1;
                        s.conv_rate = one;
                    }
                    match setup_res {
                        Err(e) => {
                            return if e.is_recoverable() {
                                NlsOutcome::ConvFail
                            } else {
                                NlsOutcome::SetupFailed
                            }
                        }
                        Ok(jc) => self.jcur = jc,
                    }
                }
            }
        }
    }

    fn stgr1_newton_iteration(&mut self, is: usize) -> NewtonStatus {
        let zero = V::T::zero();
        let one = V::T::one();
        let rl1 = self.coeffs.rl1;
        let gamma = self.coeffs.gamma;
        let tq4 = self.coeffs.tq[4];

        let mut m = 0usize;
        let mut delp = zero;

        loop {
            {
                let s = self.sens.as_mut().unwrap();
                s.tempv[is].linear_sum(rl1, &self.hist.zns[is][1], one, &s.acor[is]);
                s.tempv[is].axpy(gamma, &s.ftemp[is], -one);
                s.nni1[is] += 1;
            }

            let res = {
                let ctx = LinearSolverCtx {
                    t: self.tn,
                    gamma,
                    gammap: self.coeffs.gammap,
                    gamrat: self.coeffs.gamrat,
                    h: self.h,
                    nst: self.nst,
                    method: self.method,
                    ewt: &self.ewt,
                    rhs: &self.rhs,
                    p: &self.p,
                };
                let ls = self.lsolver.as_mut().unwrap();
                let s = self.sens.as_mut().unwrap();
                ls.solve(ctx, &mut s.tempv[is], &s.ewt[is], &self.y, &self.ftemp)
            };
            if let Err(e) = res {
                return self.solve_failure_status(e.is_recoverable());
            }

            let (del, dcon, maxcor_s) = {
                let s = self.sens.as_mut().unwrap();
                let del = s.tempv[is].wrms_norm(&s.ewt[is]);
                s.acor[is].axpy(one, &s.tempv[is], one);
                s.ys[is].linear_sum(one, &self.hist.zns[is][0], one, &s.acor[is]);
                if m > 0 {
                    let r = del / delp;
                    let lowered = V::T::from(CRDOWN) * s.conv_rate;
                    s.conv_rate = if lowered > r { lowered } else { r };
                }
                let crate_capped = if s.conv_rate < one { s.conv_rate } else { one };
                (del, del * crate_capped / tq4, s.maxcor)
            };

            if dcon <= one {
                self.jcur = false;
                return NewtonStatus::Outcome(NlsOutcome::Solved);
            }

            m += 1;
            if m == maxcor_s || (m >= 2 && del > V::T::from(RDIV) * delp) {
                return if !self.jcur {
                    NewtonStatus::TryAgain
                } else {
                    NewtonStatus::Outcome(NlsOutcome::ConvFail)
                };
            }
            delp = del;

            if let Err(e) = self.sens_rhs1(self.tn, is, false, OutSel::Ftemp) {
                return NewtonStatus::Outcome(rhs_outcome(e));
            }
        }
    }

    /// Act on a corrector outcome: restore the history on any failure, then
    /// either surface a hard error, or shrink the step and ask for a new
    /// attempt.
    pub(crate) fn handle_nflag(
        &mut self,
        outcome: NlsOutcome,
        saved_t: V::T,
        ncf_local: &mut usize,
        target: CfTarget,
    ) -> Result<StepAttempt, NordsolError> {
        let one = V::T::one();

        if outcome == NlsOutcome::Solved {
            return Ok(StepAttempt::DoErrorTest);
        }

        match target {
            CfTarget::State => self.ncfn += 1,
            CfTarget::Sens => self.sens.as_mut().unwrap().ncfn += 1,
            CfTarget::Sens1(is) => self.sens.as_mut().unwrap().ncfn1[is] += 1,
        }
        self.hist.restore(self.q);
        self.tn = saved_t;

        match outcome {
            NlsOutcome::SetupFailed => Err(NonLinearSolverError::SetupFailed {
                t: saved_t.as_f64(),
            }
            .into()),
            NlsOutcome::SolveFailed => Err(NonLinearSolverError::SolveFailed {
                t: saved_t.as_f64(),
            }
            .into()),
            NlsOutcome::RhsFailed => Err(OdeSolverError::RhsFailed {
                t: saved_t.as_f64(),
            }
            .into()),
            NlsOutcome::ConvFail => {
                let ncf = match target {
                    CfTarget::Sens1(is) => {
                        let s = self.sens.as_mut().unwrap();
                        s.ncf1_step[is] += 1;
                        s.ncf1_step[is]
                    }
                    _ => {
                        *ncf_local += 1;
                        *ncf_local
                    }
                };
                self.etamax = one;
                if self.h.abs() <= self.hmin * V::T::from(ONEPSM) || ncf == self.maxncf {
                    return Err(NonLinearSolverError::ConvergenceFailed {
                        t: saved_t.as_f64(),
                    }
                    .into());
                }
                let floor = self.hmin / self.h.abs();
                self.eta = if floor > V::T::from(ETACF) {
                    floor
                } else {
                    V::T::from(ETACF)
                };
                self.rescale();
                Ok(StepAttempt::PredictAgain)
            }
            NlsOutcome::Solved => unreachable!(),
        }
    }
}
