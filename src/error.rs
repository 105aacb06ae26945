use thiserror::Error;

/// Custom error type for nordsol
///
/// This error type wraps all possible errors that can occur when using nordsol.
#[derive(Error, Debug)]
pub enum NordsolError {
    #[error("ODE solver error: {0}")]
    OdeSolverError(#[from] OdeSolverError),
    #[error("Linear solver error: {0}")]
    LinearSolverError(#[from] LinearSolverError),
    #[error("Non-linear solver error: {0}")]
    NonLinearSolverError(#[from] NonLinearSolverError),
    #[error("Other error: {0}")]
    Other(String),
}

/// Failures surfaced by the time-stepping loop and its configuration surface.
#[derive(Error, Debug)]
pub enum OdeSolverError {
    #[error("illegal input: {0}")]
    IllInput(&'static str),
    #[error("atol must have length equal to the number of states")]
    AtolLengthMismatch,
    #[error("tolerances must be non-negative")]
    NegativeTolerance,
    #[error("the problem has not been initialized")]
    NotInitialized,
    #[error("quadrature integration has not been initialized")]
    QuadNotInitialized,
    #[error("sensitivity analysis has not been initialized")]
    SensNotInitialized,
    #[error("a component of the error weight vector is non-positive")]
    EwtInvalid,
    #[error("a component of the error weight vector became non-positive at t = {t}")]
    EwtNowBad { t: f64 },
    #[error("tout is too close to t0 to start integration")]
    TooClose,
    #[error("maximum number of steps ({mxstep}) taken before reaching tout, at t = {t}")]
    TooMuchWork { t: f64, mxstep: usize },
    #[error("requested accuracy not achievable at t = {t}; suggested tolerance scale factor {tolsf}")]
    TooMuchAccuracy { t: f64, tolsf: f64 },
    #[error("repeated local error test failures at t = {t}")]
    ErrFailure { t: f64 },
    #[error("right-hand side function failed unrecoverably at t = {t}")]
    RhsFailed { t: f64 },
    #[error("stop time = {stop_time} is not beyond current time = {state_time}")]
    StopTimeBeforeCurrentTime { stop_time: f64, state_time: f64 },
    #[error("interpolation order k = {k} is outside [0, {q}]")]
    BadK { k: usize, q: usize },
    #[error("interpolation time t = {t} is outside the last step interval [{tlo}, {thi}]")]
    BadT { t: f64, tlo: f64, thi: f64 },
    #[error("sensitivity index is = {is} is outside [0, {ns})")]
    BadIs { is: usize, ns: usize },
    #[error("zero scaling factor pbar for parameter {index}")]
    ZeroPbar { index: usize },
    #[error("Other error: {0}")]
    Other(String),
}

/// Failures from the attached linear solver.
///
/// [LinearSolverError::is_recoverable] mirrors the setup/solve return-code
/// contract: recoverable failures make the step machinery retry with a fresh
/// Jacobian or a smaller step, unrecoverable ones surface immediately.
#[derive(Error, Debug)]
pub enum LinearSolverError {
    #[error("linear solver used before init")]
    NotInitialized,
    #[error("no linear solver attached for Newton iteration")]
    NotAttached,
    #[error("iteration matrix factorization failed")]
    FactorizationFailed,
    #[error("linear solve failed")]
    SolveFailed,
    #[error("right-hand side failed during Jacobian approximation")]
    JacobianRhsFailed { recoverable: bool },
    #[error("Other error: {0}")]
    Other(String),
}

impl LinearSolverError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            LinearSolverError::FactorizationFailed => true,
            LinearSolverError::SolveFailed => true,
            LinearSolverError::JacobianRhsFailed { recoverable } => *recoverable,
            _ => false,
        }
    }
}

/// Failures from the nonlinear corrector after its retry budget is spent.
#[derive(Error, Debug)]
pub enum NonLinearSolverError {
    #[error("repeated corrector convergence failures at t = {t}")]
    ConvergenceFailed { t: f64 },
    #[error("linear solver setup failed unrecoverably at t = {t}")]
    SetupFailed { t: f64 },
    #[error("linear solver solve failed unrecoverably at t = {t}")]
    SolveFailed { t: f64 },
}

#[macro_export]
macro_rules! ode_solver_error {
    ($variant:ident) => {
        $crate::error::NordsolError::from($crate::error::OdeSolverError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::NordsolError::from($crate::error::OdeSolverError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! linear_solver_error {
    ($variant:ident) => {
        $crate::error::NordsolError::from($crate::error::LinearSolverError::$variant)
    };
}

#[macro_export]
macro_rules! non_linear_solver_error {
    ($variant:ident) => {
        $crate::error::NordsolError::from($crate::error::NonLinearSolverError::$variant)
    };
}
