use crate::scalar::Scalar;

/// Magnitude cutoff: a dominant root above this is a stability violation.
const RRCUT: f64 = 0.98;
/// Variance tolerance identifying the normal-matrix case.
const VRRTOL: f64 = 1.0e-4;
/// Spread tolerance on the three row ratios in the normal-matrix case.
const VRRT2: f64 = 5.0e-4;
/// Residual tolerance on the quartic values.
const SQTOL: f64 = 1.0e-3;
/// Agreement tolerance between the two root estimates.
const RRTOL: f64 = 1.0e-2;
/// Generic small number guarding divisions.
const TINY: f64 = 1.0e-10;

/// Verdict of the dominant-root analysis.
///
/// The step controller acts only on the violation variants; the stable and
/// inconclusive ones are diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Sldet {
    /// Stable root found, normal-matrix case.
    StableNormal,
    /// Stable root found from the quartic elimination.
    StableQuartic,
    /// Stable root found after Newton correction of the quartic root.
    StableNewton,
    /// Violation detected, normal-matrix case.
    ViolationNormal,
    /// Violation detected from the quartic elimination.
    ViolationQuartic,
    /// Violation detected after Newton correction.
    ViolationNewton,
    /// No conclusion; the tag records which guard tripped (-1..=-9).
    Inconclusive(i8),
}

impl Sldet {
    pub(crate) fn is_violation(self) -> bool {
        matches!(
            self,
            Sldet::ViolationNormal | Sldet::ViolationQuartic | Sldet::ViolationNewton
        )
    }
}

/// Push a new triple of squared scaled-derivative norms into the five-step
/// window. Row 0 is the current step; column `k` is the data for polynomial
/// degree `q - 1 + k`.
pub(crate) fn shift_and_store<T: Scalar>(ssdat: &mut [[T; 3]; 5], sqm2: T, sqm1: T, sq: T) {
    for i in (1..5).rev() {
        ssdat[i] = ssdat[i - 1];
    }
    ssdat[0] = [sqm2 * sqm2, sqm1 * sqm1, sq * sq];
}

/// Detect a stability limitation from the stored window.
///
/// Derives the magnitude `rr` of the dominant characteristic root either
/// from the agreement of the three geometric-average row ratios (normal
/// matrix case) or by eliminating the quartics the window data satisfies,
/// optionally polished by up to three Newton iterations; then cross-checks
/// `rr` through the `sigsq` consistency relations. Valid only for BDF with
/// `q >= 3` and a full window (five steps at constant order and step).
pub(crate) fn dominant_root<T: Scalar>(ssdat: &[[T; 3]; 5], q: usize) -> Sldet {
    let tiny = T::from(TINY);
    let zero = T::zero();
    let one = T::one();

    let mut smax = [zero; 3];
    let mut ssmax = [zero; 3];
    let mut rav = [zero; 3];
    let mut vrat = [zero; 3];
    // quartic coefficients qc[k] = [c0, c1, c2, c3, c4] of
    // c0 + c1 r + c2 r^2 + c3 r^3 + c4 r^4 (c2 is identically zero)
    let mut qc = [[zero; 5]; 3];

    for k in 0..3 {
        let mut smink = ssdat[0][k];
        let mut smaxk = zero;
        for row in ssdat.iter() {
            if row[k] < smink {
                smink = row[k];
            }
            if row[k] > smaxk {
                smaxk = row[k];
            }
        }
        if smink < tiny * smaxk {
            return Sldet::Inconclusive(-1);
        }
        smax[k] = smaxk;
        ssmax[k] = smaxk * smaxk;

        let mut sumrat = zero;
        let mut sumrsq = zero;
        for i in 0..4 {
            let rat = ssdat[i][k] / ssdat[i + 1][k];
            sumrat += rat;
            sumrsq += rat * rat;
        }
        rav[k] = T::from(0.25) * sumrat;
        vrat[k] = (T::from(0.25) * sumrsq - rav[k] * rav[k]).abs();

        let s = |i: usize| ssdat[i][k];
        qc[k][0] = s(0) * s(2) - s(1) * s(1);
        qc[k][1] = s(1) * s(2) - s(0) * s(3);
        qc[k][2] = zero;
        qc[k][3] = s(1) * s(4) - s(2) * s(3);
        qc[k][4] = s(3) * s(3) - s(2) * s(4);
    }

    let mut vmin = vrat[0];
    let mut vmax = vrat[0];
    for &v in vrat.iter().skip(1) {
        if v < vmin {
            vmin = v;
        }
        if v > vmax {
            vmax = v;
        }
    }

    let vrrtol = T::from(VRRTOL);
    let vrrt2 = T::from(VRRT2);
    let sqtol = T::from(SQTOL);

    let mut rr;
    let mut kind;

    if vmin < vrrtol * vrrtol {
        // Normal or nearly-normal matrix: the three quartics share a root and
        // the row ratios estimate it directly.
        if vmax > vrrt2 * vrrt2 {
            return Sldet::Inconclusive(-2);
        }
        rr = (rav[0] + rav[1] + rav[2]) / T::from(3.0);
        kind = 0;
    } else {
        // Eliminate the quartics pairwise down to a linear relation in r.
        let mut qco = qc;
        if qco[0][4].abs() < tiny * ssmax[0] {
            return Sldet::Inconclusive(-4);
        }
        let tem = qco[1][4] / qco[0][4];
        for deg in 0..4 {
            qco[1][deg] -= tem * qco[0][deg];
        }
        qco[1][4] = zero;
        let tem = qco[2][4] / qco[0][4];
        for deg in 0..4 {
            qco[2][deg] -= tem * qco[0][deg];
        }
        qco[2][4] = zero;

        if qco[1][3].abs() < tiny * ssmax[1] {
            return Sldet::Inconclusive(-4);
        }
        let tem = qco[2][3] / qco[1][3];
        for deg in 0..3 {
            qco[2][deg] -= tem * qco[1][deg];
        }

        if qco[2][1].abs() < tiny * ssmax[2] {
            return Sldet::Inconclusive(-4);
        }
        rr = -qco[2][0] / qco[2][1];

        if rr < tiny || rr > T::from(100.0) {
            return Sldet::Inconclusive(-5);
        }

        let eval = |c: &[T; 5], r: T| c[0] + r * (c[1] + r * r * (c[3] + r * c[4]));
        let mut qkr = [eval(&qc[0], rr), eval(&qc[1], rr), eval(&qc[2], rr)];

        let mut sqmax = zero;
        for k in 0..3 {
            let saqk = qkr[k].abs() / ssmax[k];
            if saqk > sqmax {
                sqmax = saqk;
            }
        }

        if sqmax < sqtol {
            kind = 1;
        } else {
            // Newton corrections on rr, keeping the candidate with the
            // smallest worst-case quartic residual.
            let mut converged = false;
            for _ in 0..3 {
                let mut rrc = [zero; 3];
                for k in 0..3 {
                    let qp = qc[k][1] + rr * rr * (T::from(3.0) * qc[k][3] + rr * T::from(4.0) * qc[k][4]);
                    let drr = if qp.abs() > tiny * ssmax[k] {
                        -qkr[k] / qp
                    } else {
                        zero
                    };
                    rrc[k] = rr + drr;
                }

                let mut qjk = [[zero; 3]; 3];
                let mut sqmx = [zero; 3];
                for k in 0..3 {
                    let mut sqmaxk = zero;
                    for j in 0..3 {
                        qjk[k][j] = eval(&qc[j], rrc[k]);
                        let saqj = qjk[k][j].abs() / ssmax[j];
                        if saqj > sqmaxk {
                            sqmaxk = saqj;
                        }
                    }
                    sqmx[k] = sqmaxk;
                }

                let mut kmin = 0;
                let mut sqmin = sqmx[0] + one;
                for k in 0..3 {
                    if sqmx[k] < sqmin {
                        kmin = k;
                        sqmin = sqmx[k];
                    }
                }
                rr = rrc[kmin];

                if sqmin < sqtol {
                    converged = true;
                    break;
                }
                qkr = qjk[kmin];
            }
            if !converged {
                return Sldet::Inconclusive(-6);
            }
            kind = 2;
        }
    }

    // Given rr, solve for sigsq[k] from the difference table of
    // rs_i = ssdat[i][k] * rr^i and verify rr against the data.
    let mut sigsq = [zero; 3];
    for k in 0..3 {
        let rsa = ssdat[0][k];
        let rsb = ssdat[1][k] * rr;
        let rsc = ssdat[2][k] * rr * rr;
        let rsd = ssdat[3][k] * rr * rr * rr;
        let rd1a = rsa - rsb;
        let rd1b = rsb - rsc;
        let rd1c = rsc - rsd;
        let rd2a = rd1a - rd1b;
        let rd2b = rd1b - rd1c;
        let rd3a = rd2a - rd2b;

        if rd1b.abs() < tiny * smax[k] {
            return Sldet::Inconclusive(-7);
        }
        let cest1 = -rd3a / rd1b;
        if cest1 < tiny || cest1 > T::from(4.0) {
            return Sldet::Inconclusive(-7);
        }
        let corr1 = (rd2b / cest1) / (rr * rr);
        sigsq[k] = ssdat[2][k] + corr1;
    }

    if sigsq[1] < tiny {
        return Sldet::Inconclusive(-8);
    }

    let qt = T::from(q as f64);
    let ratp = sigsq[2] / sigsq[1];
    let ratm = sigsq[0] / sigsq[1];
    let qfac1 = T::from(0.25) * (qt * qt - one);
    let qfac2 = T::from(2.0) / (qt - one);
    let bb = ratp * ratm - one - qfac1 * ratp;
    let tem = one - qfac2 * bb;
    if tem.abs() < tiny {
        return Sldet::Inconclusive(-8);
    }
    let rrb = one / tem;
    if (rrb - rr).abs() > T::from(RRTOL) {
        return Sldet::Inconclusive(-9);
    }

    let violation = rr > T::from(RRCUT);
    match (kind, violation) {
        (0, false) => Sldet::StableNormal,
        (1, false) => Sldet::StableQuartic,
        (2, false) => Sldet::StableNewton,
        (0, true) => Sldet::ViolationNormal,
        (1, true) => Sldet::ViolationQuartic,
        (2, true) => Sldet::ViolationNewton,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_and_store() {
        let mut ssdat = [[0.0f64; 3]; 5];
        for step in 1..=6 {
            let v = step as f64;
            shift_and_store(&mut ssdat, v, 2.0 * v, 3.0 * v);
        }
        // newest row holds the squares of the last triple
        assert_eq!(ssdat[0], [36.0, 144.0, 324.0]);
        // oldest surviving row is from step 2
        assert_eq!(ssdat[4], [4.0, 16.0, 36.0]);
    }

    #[test]
    fn test_wild_ratio_is_inconclusive() {
        let mut ssdat = [[1.0f64; 3]; 5];
        ssdat[3][1] = 1.0e-14;
        assert_eq!(dominant_root(&ssdat, 3), Sldet::Inconclusive(-1));
    }

    #[test]
    fn test_pure_geometric_data_is_degenerate() {
        // A single geometric mode has a vanishing second difference table:
        // the analysis must refuse to conclude rather than report a root.
        let r2 = 0.9f64;
        let mut ssdat = [[0.0f64; 3]; 5];
        for i in 0..5 {
            for k in 0..3 {
                ssdat[i][k] = (1.0 + 0.1 * k as f64) * r2.powi(i as i32);
            }
        }
        assert_eq!(dominant_root(&ssdat, 3), Sldet::Inconclusive(-7));
    }

    #[test]
    fn test_violation_flags() {
        assert!(Sldet::ViolationNormal.is_violation());
        assert!(Sldet::ViolationQuartic.is_violation());
        assert!(Sldet::ViolationNewton.is_violation());
        assert!(!Sldet::StableNormal.is_violation());
        assert!(!Sldet::Inconclusive(-3).is_violation());
    }
}
