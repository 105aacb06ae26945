use num_traits::{One, Zero};
use crate::scalar::{scale, Scalar};
use crate::vector::{column_pair, Vector};

use super::coeffs::L_MAX;
use super::Method;

/// The Nordsieck history array.
///
/// After a successful step at order `q` taken with step `h`, column `j` of
/// `zn` encodes `h^j * y^(j)(t_n) / j!` for `j = 0..=q`. The extra column
/// `zn[qmax]` is a scratch slot with a named lifecycle: it is populated with
/// the last correction by `complete_step` when `qwait == 1` and `q < qmax`
/// (or by the order-selection logic when an increase is chosen), and consumed
/// by the BDF order-increase adjustment. It never aliases an active history
/// column.
///
/// `znq` mirrors `zn` for the quadrature variables (empty when quadratures
/// are off); `zns[i]` mirrors `zn` for the i-th sensitivity.
#[derive(Clone, Debug)]
pub struct Nordsieck<V: Vector> {
    pub zn: Vec<V>,
    pub znq: Vec<V>,
    pub zns: Vec<Vec<V>>,
}

impl<V: Vector> Nordsieck<V> {
    pub fn new(n: usize, qmax: usize) -> Self {
        Self {
            zn: (0..=qmax).map(|_| V::zeros(n)).collect(),
            znq: Vec::new(),
            zns: Vec::new(),
        }
    }

    pub fn enable_quad(&mut self, nq: usize) {
        let qmax = self.zn.len() - 1;
        self.znq = (0..=qmax).map(|_| V::zeros(nq)).collect();
    }

    pub fn enable_sens(&mut self, ns: usize) {
        let qmax = self.zn.len() - 1;
        let n = self.zn[0].len();
        self.zns = (0..ns)
            .map(|_| (0..=qmax).map(|_| V::zeros(n)).collect())
            .collect();
    }

    fn for_each_group(&mut self, mut f: impl FnMut(&mut [V])) {
        f(&mut self.zn);
        if !self.znq.is_empty() {
            f(&mut self.znq);
        }
        for cols in self.zns.iter_mut() {
            f(cols);
        }
    }

    /// Apply the Pascal-triangle update, advancing the array to the
    /// predicted values at `t_n + h`.
    pub fn predict(&mut self, q: usize) {
        self.for_each_group(|cols| {
            for k in 1..=q {
                for j in (k..=q).rev() {
                    let (dst, src) = column_pair(cols, j - 1, j);
                    dst.axpy(V::T::one(), src, V::T::one());
                }
            }
        });
    }

    /// Exactly invert [Nordsieck::predict].
    pub fn restore(&mut self, q: usize) {
        self.for_each_group(|cols| {
            for k in 1..=q {
                for j in (k..=q).rev() {
                    let (dst, src) = column_pair(cols, j - 1, j);
                    dst.axpy(-V::T::one(), src, V::T::one());
                }
            }
        });
    }

    /// Multiply column `j` by `eta^j` for `j = 1..=q`, adapting the array to
    /// a step size change `h -> h * eta`.
    pub fn rescale(&mut self, q: usize, eta: V::T) {
        self.for_each_group(|cols| {
            let mut factor = eta;
            for j in 1..=q {
                cols[j] *= scale(factor);
                factor *= eta;
            }
        });
    }

    /// Apply the step correction: column `j` gains `l[j] * delta` for
    /// `j = 0..=q`, for each variable group with its own correction.
    pub fn correct(
        &mut self,
        q: usize,
        l: &[V::T],
        acor: &V,
        acor_q: Option<&V>,
        acor_s: Option<&[V]>,
    ) {
        for j in 0..=q {
            self.zn[j].axpy(l[j], acor, V::T::one());
        }
        if let Some(aq) = acor_q {
            for j in 0..=q {
                self.znq[j].axpy(l[j], aq, V::T::one());
            }
        }
        if let Some(acs) = acor_s {
            for (cols, ac) in self.zns.iter_mut().zip(acs.iter()) {
                for j in 0..=q {
                    cols[j].axpy(l[j], ac, V::T::one());
                }
            }
        }
    }

    /// Adjust the history for an order change of `delta_q` (+1 or -1).
    ///
    /// A decrease at `q == 2` leaves the array untouched (the caller still
    /// lowers the order; no column combination is required).
    pub fn adjust_order(
        &mut self,
        method: Method,
        delta_q: i32,
        q: usize,
        qmax: usize,
        tau: &[V::T],
        hscale: V::T,
    ) {
        if q == 2 && delta_q != 1 {
            return;
        }
        match (method, delta_q) {
            (Method::Adams, 1) => self.for_each_group(|cols| cols[q + 1].fill(V::T::zero())),
            (Method::Adams, -1) => {
                let l = adams_decrease_coeffs::<V::T>(q, tau, hscale);
                self.subtract_column_multiples(q, &l);
            }
            (Method::Bdf, 1) => {
                let (l, a1) = bdf_increase_coeffs::<V::T>(q, tau, hscale);
                self.for_each_group(|cols| {
                    // the saved correction seeds the new column
                    if q + 1 == qmax {
                        cols[qmax] *= scale(a1);
                    } else {
                        let (dst, src) = column_pair(cols, q + 1, qmax);
                        dst.copy_from(src);
                        *dst *= scale(a1);
                    }
                    for j in 2..=q {
                        let (dst, src) = column_pair(cols, j, q + 1);
                        dst.axpy(l[j], src, V::T::one());
                    }
                });
            }
            (Method::Bdf, -1) => {
                let l = bdf_decrease_coeffs::<V::T>(q, tau, hscale);
                self.subtract_column_multiples(q, &l);
            }
            _ => unreachable!("order adjustment is only by +1 or -1"),
        }
    }

    /// `zn[j] -= l[j] * zn[q]` for `j = 2..q`, on every group.
    fn subtract_column_multiples(&mut self, q: usize, l: &[V::T; L_MAX]) {
        self.for_each_group(|cols| {
            for j in 2..q {
                let (dst, src) = column_pair(cols, j, q);
                dst.axpy(-l[j], src, V::T::one());
            }
        });
    }
}

/// Coefficients for the Adams order decrease: the adjustment polynomial is
/// `q * integral of u (u + xi_1) ... (u + xi_{q-2}) du`.
fn adams_decrease_coeffs<T: Scalar>(q: usize, tau: &[T], hscale: T) -> [T; L_MAX] {
    let mut l = [T::zero(); L_MAX];
    l[1] = T::one();
    let mut hsum = T::zero();
    for j in 1..=q - 2 {
        hsum += tau[j];
        let xi = hsum / hscale;
        for i in (1..=j + 1).rev() {
            l[i] = l[i] * xi + l[i - 1];
        }
    }
    for j in 1..=q - 2 {
        l[j + 1] = T::from(q as f64) * (l[j] / T::from((j + 1) as f64));
    }
    l
}

/// Coefficients for the BDF order increase: `x^2 (x + xi_1) ... (x + xi_j)`,
/// plus the multiplier `A1` applied to the saved correction column.
fn bdf_increase_coeffs<T: Scalar>(q: usize, tau: &[T], hscale: T) -> ([T; L_MAX], T) {
    let mut l = [T::zero(); L_MAX];
    l[2] = T::one();
    let mut alpha1 = T::one();
    let mut prod = T::one();
    let mut xiold = T::one();
    let mut alpha0 = -T::one();
    let mut hsum = hscale;
    if q > 1 {
        for j in 1..q {
            hsum += tau[j + 1];
            let xi = hsum / hscale;
            prod *= xi;
            alpha0 -= T::one() / T::from((j + 1) as f64);
            alpha1 += T::one() / xi;
            for i in (2..=j + 2).rev() {
                l[i] = l[i] * xiold + l[i - 1];
            }
            xiold = xi;
        }
    }
    let a1 = (-alpha0 - alpha1) / prod;
    (l, a1)
}

/// Coefficients for the BDF order decrease: `x^2 (x + xi_1) ... (x + xi_j)`.
fn bdf_decrease_coeffs<T: Scalar>(q: usize, tau: &[T], hscale: T) -> [T; L_MAX] {
    let mut l = [T::zero(); L_MAX];
    l[2] = T::one();
    let mut hsum = T::zero();
    for j in 1..=q - 2 {
        hsum += tau[j];
        let xi = hsum / hscale;
        for i in (2..=j + 2).rev() {
            l[i] = l[i] * xi + l[i - 1];
        }
    }
    l
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    type V = DVector<f64>;

    fn filled(n: usize, qmax: usize) -> Nordsieck<V> {
        let mut hist = Nordsieck::<V>::new(n, qmax);
        // powers of two keep every combination exact in floating point
        for (j, col) in hist.zn.iter_mut().enumerate() {
            col.fill(2.0f64.powi(j as i32) * 0.25);
        }
        hist
    }

    #[test]
    fn test_predict_restore_roundtrip_is_exact() {
        let q = 4;
        let mut hist = filled(3, 5);
        hist.enable_quad(2);
        hist.enable_sens(2);
        for (j, col) in hist.znq.iter_mut().enumerate() {
            col.fill(0.5 + j as f64);
        }
        for cols in hist.zns.iter_mut() {
            for (j, col) in cols.iter_mut().enumerate() {
                col.fill(1.0 + j as f64);
            }
        }
        let before = hist.clone();
        hist.predict(q);
        assert_ne!(hist.zn[0][0], before.zn[0][0]);
        hist.restore(q);
        for j in 0..=5 {
            assert_eq!(hist.zn[j], before.zn[j]);
            assert_eq!(hist.znq[j], before.znq[j]);
            assert_eq!(hist.zns[0][j], before.zns[0][j]);
            assert_eq!(hist.zns[1][j], before.zns[1][j]);
        }
    }

    #[test]
    fn test_predict_sums_columns() {
        // column 0 of the prediction is the Taylor sum of all columns
        let q = 2;
        let mut hist = Nordsieck::<V>::new(1, 3);
        hist.zn[0][0] = 1.0;
        hist.zn[1][0] = 2.0;
        hist.zn[2][0] = 4.0;
        hist.predict(q);
        assert_eq!(hist.zn[0][0], 7.0);
        assert_eq!(hist.zn[1][0], 10.0);
        assert_eq!(hist.zn[2][0], 4.0);
    }

    #[test]
    fn test_rescale_powers() {
        let q = 3;
        let mut hist = filled(2, 4);
        let orig: Vec<f64> = (0..=4).map(|j| hist.zn[j][0]).collect();
        hist.rescale(q, 0.5);
        for j in 0..=q {
            assert_eq!(hist.zn[j][0], orig[j] * 0.5f64.powi(j as i32));
        }
        assert_eq!(hist.zn[4][0], orig[4]);
    }

    #[test]
    fn test_adjust_order_noop_at_q2() {
        let tau = [0.1; L_MAX + 1];
        let mut hist = filled(2, 5);
        let before = hist.clone();
        hist.adjust_order(Method::Bdf, -1, 2, 5, &tau, 0.1);
        for j in 0..=5 {
            assert_eq!(hist.zn[j], before.zn[j]);
        }
    }

    #[test]
    fn test_adams_increase_zeroes_new_column() {
        let tau = [0.1; L_MAX + 1];
        let q = 3;
        let mut hist = filled(2, 5);
        hist.adjust_order(Method::Adams, 1, q, 5, &tau, 0.1);
        assert_eq!(hist.zn[q + 1], V::zeros(2));
    }

    #[test]
    fn test_correct_applies_l_multiples() {
        let q = 2;
        let mut hist = Nordsieck::<V>::new(1, 3);
        let l = [1.0, 1.5, 0.5, 0.0];
        let acor = V::from_vec(vec![2.0]);
        hist.correct(q, &l, &acor, None, None);
        assert_eq!(hist.zn[0][0], 2.0);
        assert_eq!(hist.zn[1][0], 3.0);
        assert_eq!(hist.zn[2][0], 1.0);
    }
}
