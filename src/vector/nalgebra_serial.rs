use std::ops::MulAssign;

use nalgebra::DVector;

use crate::scalar::{IndexType, Scalar, Scale};

use super::Vector;

impl<T: Scalar> MulAssign<Scale<T>> for DVector<T> {
    fn mul_assign(&mut self, rhs: Scale<T>) {
        *self *= rhs.value();
    }
}

impl<T: Scalar> Vector for DVector<T> {
    type T = T;

    fn len(&self) -> IndexType {
        self.nrows()
    }

    fn from_element(n: IndexType, value: T) -> Self {
        Self::from_element(n, value)
    }

    fn from_vec(vec: Vec<T>) -> Self {
        Self::from_vec(vec)
    }

    fn fill(&mut self, value: T) {
        self.fill(value);
    }

    fn copy_from(&mut self, other: &Self) {
        self.copy_from(other);
    }

    fn get_index(&self, index: IndexType) -> T {
        self[index]
    }

    fn set_index(&mut self, index: IndexType, value: T) {
        self[index] = value;
    }

    fn linear_sum(&mut self, a: T, x: &Self, b: T, y: &Self) {
        self.zip_zip_apply(x, y, |z, xi, yi| *z = a * xi + b * yi);
    }

    fn axpy(&mut self, alpha: T, x: &Self, beta: T) {
        self.axpy(alpha, x, beta);
    }

    fn add_scalar_mut(&mut self, c: T) {
        self.apply(|x| *x += c);
    }

    fn component_mul_assign(&mut self, other: &Self) {
        self.component_mul_assign(other);
    }

    fn component_div_assign(&mut self, other: &Self) {
        self.component_div_assign(other);
    }

    fn abs_to(&self, z: &mut Self) {
        z.zip_apply(self, |zi, xi| *zi = xi.abs());
    }

    fn try_recip_to(&self, z: &mut Self) -> bool {
        if self.iter().any(|&xi| xi <= T::zero()) {
            return false;
        }
        z.zip_apply(self, |zi, xi| *zi = T::one() / xi);
        true
    }

    fn min(&self) -> T {
        self.iter()
            .copied()
            .fold(T::INFINITY, |m, xi| if xi < m { xi } else { m })
    }

    fn max_norm(&self) -> T {
        self.iter()
            .copied()
            .fold(T::zero(), |m, xi| if xi.abs() > m { xi.abs() } else { m })
    }

    fn wrms_norm(&self, w: &Self) -> T {
        let mut acc = T::zero();
        assert_eq!(self.nrows(), w.nrows(), "vector lengths do not match");
        for i in 0..self.nrows() {
            let prod = self[i] * w[i];
            acc += prod * prod;
        }
        (acc / T::from(self.nrows() as f64)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::scale;

    #[test]
    fn test_scale_assign() {
        let mut v = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        v *= scale(2.0);
        Vector::assert_eq_st(&v, &DVector::from_vec(vec![2.0, -4.0, 6.0]), 1e-15);
    }

    #[test]
    fn test_norms() {
        let v = DVector::from_vec(vec![3.0, -4.0]);
        assert_eq!(Vector::max_norm(&v), 4.0);
        assert_eq!(Vector::min(&v), -4.0);
        let w = DVector::from_vec(vec![1.0, 1.0]);
        let nrm = Vector::wrms_norm(&v, &w);
        assert!((nrm - (12.5f64).sqrt()).abs() < 1e-14);
    }
}
