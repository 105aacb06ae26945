use crate::scalar::Scalar;

use super::Method;

/// Maximum order of the Adams-Moulton family.
pub const ADAMS_Q_MAX: usize = 12;
/// Maximum order of the BDF family.
pub const BDF_Q_MAX: usize = 5;
/// One more than the largest representable order.
pub const L_MAX: usize = ADAMS_Q_MAX + 1;

/// Method coefficients at the current order and step history.
///
/// `l` holds the coefficients of the generating polynomial
/// `Lambda(x) = l_0 + l_1 x + ... + l_q x^q`; `tq` holds the test quantities
/// (1-based): `tq[1]` and `tq[3]` feed the order-decrease/increase step
/// ratios, `tq[2]` the local error test, `tq[4] = nlscoef * tq[2]` the
/// corrector convergence test, and `tq[5]` the stability-limit data.
#[derive(Clone, Debug)]
pub struct MethodCoeffs<T: Scalar> {
    pub l: [T; L_MAX],
    pub tq: [T; 6],
    /// `1 / l[1]`.
    pub rl1: T,
    /// `h / l[1]`.
    pub gamma: T,
    /// `gamma` at the last linear solver setup.
    pub gammap: T,
    /// `gamma / gammap` (1 before the first step).
    pub gamrat: T,
}

impl<T: Scalar> MethodCoeffs<T> {
    pub fn new() -> Self {
        Self {
            l: [T::zero(); L_MAX],
            tq: [T::zero(); 6],
            rl1: T::one(),
            gamma: T::zero(),
            gammap: T::zero(),
            gamrat: T::one(),
        }
    }

    /// Recompute `l`, `tq`, and the gamma quantities for the current order
    /// `q`, tentative step `h`, and step history `tau` (1-based: `tau[1]` is
    /// the most recent accepted step). The order-change quantities `tq[1]`
    /// and `tq[3]` are only needed when an order change is up for decision,
    /// i.e. `qwait == 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        method: Method,
        q: usize,
        qwait: usize,
        h: T,
        tau: &[T],
        nlscoef: T,
        nst: usize,
    ) {
        match method {
            Method::Adams => self.set_adams(q, qwait, h, tau, nlscoef),
            Method::Bdf => self.set_bdf(q, qwait, h, tau, nlscoef),
        }
        self.rl1 = T::one() / self.l[1];
        self.gamma = h * self.rl1;
        if nst == 0 {
            self.gammap = self.gamma;
        }
        self.gamrat = if nst > 0 {
            self.gamma / self.gammap
        } else {
            T::one()
        };
    }

    fn set_adams(&mut self, q: usize, qwait: usize, h: T, tau: &[T], nlscoef: T) {
        if q == 1 {
            self.l[0] = T::one();
            self.l[1] = T::one();
            self.tq[1] = T::one();
            self.tq[2] = T::from(2.0);
            self.tq[3] = T::from(12.0);
            self.tq[4] = nlscoef * self.tq[2];
            self.tq[5] = T::one();
            return;
        }

        // m holds the coefficients of prod_{i=1..j} (1 + x/xi_i)
        let mut m = [T::zero(); L_MAX];
        m[0] = T::one();
        let mut hsum = h;
        for j in 1..q {
            if j == q - 1 && qwait == 1 {
                let sum = alt_sum(q - 2, &m, 2);
                self.tq[1] = m[q - 2] / (T::from(q as f64) * sum);
            }
            let xi_inv = h / hsum;
            for i in (1..=j).rev() {
                m[i] += m[i - 1] * xi_inv;
            }
            hsum += tau[j];
        }

        let m0 = alt_sum(q - 1, &m, 1);
        let m1 = alt_sum(q - 1, &m, 2);
        let m0_inv = T::one() / m0;

        self.l[0] = T::one();
        for i in 1..=q {
            self.l[i] = m0_inv * m[i - 1] / T::from(i as f64);
        }
        let xi = hsum / h;
        let xi_inv = T::one() / xi;

        self.tq[2] = xi * m0 / m1;
        self.tq[5] = xi / self.l[q];

        if qwait == 1 {
            for i in (1..=q).rev() {
                m[i] += m[i - 1] * xi_inv;
            }
            let m2 = alt_sum(q, &m, 2);
            self.tq[3] = T::from((q + 1) as f64) * m0 / m2;
        }

        self.tq[4] = nlscoef * self.tq[2];
    }

    fn set_bdf(&mut self, q: usize, qwait: usize, h: T, tau: &[T], nlscoef: T) {
        self.l[0] = T::one();
        self.l[1] = T::one();
        for li in self.l.iter_mut().take(q + 1).skip(2) {
            *li = T::zero();
        }
        let mut xi_inv = T::one();
        let mut xistar_inv = T::one();
        let mut alpha0 = -T::one();
        let mut alpha0_hat = -T::one();
        let mut hsum = h;
        if q > 1 {
            for j in 2..q {
                hsum += tau[j - 1];
                xi_inv = h / hsum;
                alpha0 -= T::one() / T::from(j as f64);
                for i in (1..=j).rev() {
                    self.l[i] += self.l[i - 1] * xi_inv;
                }
            }
            // last history point enters through xi*_q instead of xi_q
            alpha0 -= T::one() / T::from(q as f64);
            xistar_inv = -self.l[1] - alpha0;
            hsum += tau[q - 1];
            xi_inv = h / hsum;
            alpha0_hat = -self.l[1] - xi_inv;
            for i in (1..=q).rev() {
                self.l[i] += self.l[i - 1] * xistar_inv;
            }
        }
        self.set_tq_bdf(q, qwait, h, tau, hsum, alpha0, alpha0_hat, xi_inv, xistar_inv, nlscoef);
    }

    #[allow(clippy::too_many_arguments)]
    fn set_tq_bdf(
        &mut self,
        q: usize,
        qwait: usize,
        h: T,
        tau: &[T],
        mut hsum: T,
        alpha0: T,
        alpha0_hat: T,
        mut xi_inv: T,
        xistar_inv: T,
        nlscoef: T,
    ) {
        let qt = T::from(q as f64);
        let a1 = T::one() - alpha0_hat + alpha0;
        let a2 = T::one() + qt * a1;
        self.tq[2] = (alpha0 * (a2 / a1)).abs();
        self.tq[5] = (a2 / (self.l[q] * xi_inv / xistar_inv)).abs();
        if qwait == 1 {
            let c = xistar_inv / self.l[q];
            let a3 = alpha0 + T::one() / qt;
            let a4 = alpha0_hat + xi_inv;
            let cprime = a3 / (T::one() - a4 + a3);
            self.tq[1] = (cprime / c).abs();
            hsum += tau[q];
            xi_inv = h / hsum;
            let a5 = alpha0 - T::one() / (qt + T::one());
            let a6 = alpha0_hat - xi_inv;
            let cprimeprime = a2 / (T::one() - a6 + a5);
            self.tq[3] = (cprimeprime * xi_inv * T::from((q + 2) as f64) * a5).abs();
        }
        self.tq[4] = nlscoef * self.tq[2];
    }
}

impl<T: Scalar> Default for MethodCoeffs<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Alternating sum `sum_{i=0..=iend} (-1)^i a[i] / (i + k)`: the integral
/// from -1 to 0 of `x^(k-1) M(x)` given the coefficients of `M`.
fn alt_sum<T: Scalar>(iend: usize, a: &[T], k: usize) -> T {
    let mut sum = T::zero();
    let mut sign = T::one();
    for i in 0..=iend {
        sum += sign * a[i] / T::from((i + k) as f64);
        sign = -sign;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode_solver::Method;

    fn constant_tau(h: f64) -> [f64; L_MAX + 1] {
        [h; L_MAX + 1]
    }

    #[test]
    fn test_order_one_values() {
        let h = 0.1;
        let tau = constant_tau(h);

        let mut c = MethodCoeffs::<f64>::new();
        c.set(Method::Adams, 1, 2, h, &tau, 0.1, 0);
        assert_eq!(c.l[0], 1.0);
        assert_eq!(c.l[1], 1.0);
        assert_eq!(c.tq[2], 2.0);
        assert_eq!(c.tq[3], 12.0);
        assert!((c.tq[4] - 0.2).abs() < 1e-15);
        assert_eq!(c.tq[5], 1.0);
        assert_eq!(c.rl1, 1.0);
        assert!((c.gamma - h).abs() < 1e-15);
        assert_eq!(c.gamrat, 1.0);

        // backward Euler: same generating polynomial at order 1
        let mut c = MethodCoeffs::<f64>::new();
        c.set(Method::Bdf, 1, 2, h, &tau, 0.1, 0);
        assert_eq!(c.l[0], 1.0);
        assert_eq!(c.l[1], 1.0);
        assert!((c.tq[2] - 2.0).abs() < 1e-15);
    }

    #[test]
    fn test_bdf2_constant_steps() {
        let h = 0.5;
        let tau = constant_tau(h);
        let mut c = MethodCoeffs::<f64>::new();
        c.set(Method::Bdf, 2, 2, h, &tau, 0.1, 5);
        // l(x) = (1 + x/2)(1 + x) generating coefficients for constant h
        assert!((c.l[0] - 1.0).abs() < 1e-15);
        assert!((c.l[1] - 1.5).abs() < 1e-15);
        assert!((c.l[2] - 0.5).abs() < 1e-15);
        assert!((c.rl1 - 2.0 / 3.0).abs() < 1e-15);
        assert!((c.gamma - h * 2.0 / 3.0).abs() < 1e-15);
        assert!((c.tq[2] - 4.5).abs() < 1e-12);
        assert!((c.tq[4] - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_adams2_constant_steps() {
        let h = 0.25;
        let tau = constant_tau(h);
        let mut c = MethodCoeffs::<f64>::new();
        c.set(Method::Adams, 2, 1, h, &tau, 0.1, 3);
        // trapezoidal corrector: gamma = h/2
        assert!((c.l[0] - 1.0).abs() < 1e-15);
        assert!((c.l[1] - 2.0).abs() < 1e-15);
        assert!((c.l[2] - 1.0).abs() < 1e-15);
        assert!((c.rl1 - 0.5).abs() < 1e-15);
        assert!((c.tq[2] - 6.0).abs() < 1e-12);
        assert!((c.tq[1] - 1.0).abs() < 1e-12);
        assert!((c.tq[5] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_gamrat_tracks_gamma_drift() {
        let h = 0.1;
        let tau = constant_tau(h);
        let mut c = MethodCoeffs::<f64>::new();
        c.set(Method::Bdf, 1, 2, h, &tau, 0.1, 0);
        let gammap = c.gammap;
        c.set(Method::Bdf, 1, 2, 2.0 * h, &tau, 0.1, 1);
        assert_eq!(c.gammap, gammap);
        assert!((c.gamrat - 2.0).abs() < 1e-14);
    }
}
