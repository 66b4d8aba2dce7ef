//! Closure table of the operator arithmetic.
//!
//! | A \ B           | Dense | Diagonal | UniformDiagonal | LowRank       |
//! |-----------------|-------|----------|-----------------|---------------|
//! | Dense           | Dense | Dense    | Dense           | Dense         |
//! | Diagonal        | Dense | Diagonal | Diagonal        | Dense         |
//! | UniformDiagonal | Dense | Diagonal | UniformDiagonal | Dense         |
//! | LowRank         | Dense | Dense    | Dense           | LowRank/Dense |
//!
//! Two low rank operators stay low rank while the combined factor has fewer
//! columns than rows. Scaling keeps the structure, adding a scalar is dense.
use crate::errors::Result;
use crate::spd::{Spd, SpdRepr};
use linfa::Float;
use ndarray::{concatenate, Array2, Axis};
use std::ops::{Add, Mul};

fn khatri_rao<F: Float>(a: &Array2<F>, b: &Array2<F>) -> Array2<F> {
    let (n, ka) = a.dim();
    let kb = b.ncols();
    let mut res = Array2::zeros((n, ka * kb));
    for i in 0..n {
        for p in 0..ka {
            for q in 0..kb {
                res[[i, p * kb + q]] = a[[i, p]] * b[[i, q]];
            }
        }
    }
    res
}

impl<F: Float> Spd<F> {
    /// Elementwise sum `A + B`
    pub fn add(&self, other: &Spd<F>) -> Result<Spd<F>> {
        self.check_dim(other.dim(), "add")?;
        let n = self.dim();
        let res = match (&self.repr, &other.repr) {
            (SpdRepr::Diagonal(a), SpdRepr::Diagonal(b)) => Spd::diagonal(a + b),
            (SpdRepr::Diagonal(a), SpdRepr::UniformDiagonal(c, _))
            | (SpdRepr::UniformDiagonal(c, _), SpdRepr::Diagonal(a)) => {
                Spd::diagonal(a.mapv(|v| v + *c))
            }
            (SpdRepr::UniformDiagonal(a, _), SpdRepr::UniformDiagonal(b, _)) => {
                Spd::uniform_diagonal(*a + *b, n)
            }
            (SpdRepr::LowRank(a), SpdRepr::LowRank(b)) if a.ncols() + b.ncols() < n => {
                Spd::low_rank(concatenate![Axis(1), a.view(), b.view()])
            }
            _ => Spd::dense(self.mat() + other.mat()),
        };
        Ok(res)
    }

    /// Elementwise (Hadamard) product `A ∘ B`
    pub fn mul(&self, other: &Spd<F>) -> Result<Spd<F>> {
        self.check_dim(other.dim(), "mul")?;
        let n = self.dim();
        let res = match (&self.repr, &other.repr) {
            (SpdRepr::Diagonal(a), SpdRepr::Diagonal(b)) => Spd::diagonal(a * b),
            (SpdRepr::Diagonal(a), SpdRepr::UniformDiagonal(c, _))
            | (SpdRepr::UniformDiagonal(c, _), SpdRepr::Diagonal(a)) => {
                Spd::diagonal(a.mapv(|v| v * *c))
            }
            (SpdRepr::UniformDiagonal(a, _), SpdRepr::UniformDiagonal(b, _)) => {
                Spd::uniform_diagonal(*a * *b, n)
            }
            (SpdRepr::LowRank(a), SpdRepr::LowRank(b)) if a.ncols() * b.ncols() < n => {
                Spd::low_rank(khatri_rao(a, b))
            }
            _ => Spd::dense(self.mat() * other.mat()),
        };
        Ok(res)
    }

    /// `c A`, structure preserving
    pub fn scale(&self, c: F) -> Spd<F> {
        match &self.repr {
            SpdRepr::Dense(m) => Spd::dense(m * c),
            SpdRepr::Diagonal(d) => Spd::diagonal(d * c),
            SpdRepr::UniformDiagonal(v, n) => Spd::uniform_diagonal(*v * c, *n),
            SpdRepr::LowRank(f) if c >= F::zero() => Spd::low_rank(f * c.sqrt()),
            SpdRepr::LowRank(f) => Spd::dense(f.dot(&f.t()) * c),
        }
    }

    /// `A + c` added to every entry, always dense
    pub fn add_scalar(&self, c: F) -> Spd<F> {
        Spd::dense(self.mat().mapv(|v| v + c))
    }

    /// `A + eps I`
    pub fn regularize(&self, eps: F) -> Spd<F> {
        let n = self.dim();
        match &self.repr {
            SpdRepr::Dense(m) => Spd::dense(m + &(Array2::eye(n) * eps)),
            SpdRepr::Diagonal(d) => Spd::diagonal(d.mapv(|v| v + eps)),
            SpdRepr::UniformDiagonal(v, _) => Spd::uniform_diagonal(*v + eps, n),
            SpdRepr::LowRank(f) => Spd::dense(f.dot(&f.t()) + Array2::eye(n) * eps),
        }
    }
}

impl<F: Float> Add<F> for &Spd<F> {
    type Output = Spd<F>;

    fn add(self, c: F) -> Spd<F> {
        self.add_scalar(c)
    }
}

impl<F: Float> Mul<F> for &Spd<F> {
    type Output = Spd<F>;

    fn mul(self, c: F) -> Spd<F> {
        self.scale(c)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Spd, Structure};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn fixtures() -> Vec<Spd<f64>> {
        vec![
            Spd::dense(array![
                [3., 1., 0.5, 0.],
                [1., 2., 0.3, 0.1],
                [0.5, 0.3, 4., 0.2],
                [0., 0.1, 0.2, 1.]
            ]),
            Spd::diagonal(array![1.5, 2., 0.5, 3.]),
            Spd::uniform_diagonal(2.5, 4),
            Spd::low_rank(array![[1.], [0.2], [-0.3], [0.7]]),
        ]
    }

    fn expected(a: Structure, b: Structure) -> Structure {
        use Structure::*;
        match (a, b) {
            (Diagonal, Diagonal) | (Diagonal, UniformDiagonal) | (UniformDiagonal, Diagonal) => {
                Diagonal
            }
            (UniformDiagonal, UniformDiagonal) => UniformDiagonal,
            (LowRank, LowRank) => LowRank,
            _ => Dense,
        }
    }

    #[test]
    fn test_closure_table() {
        for a in fixtures() {
            for b in fixtures() {
                let sum = a.add(&b).unwrap();
                assert_abs_diff_eq!(sum.mat(), a.mat() + b.mat(), epsilon = 1e-12);
                assert_eq!(sum.structure(), expected(a.structure(), b.structure()));

                let prod = a.mul(&b).unwrap();
                assert_abs_diff_eq!(prod.mat(), a.mat() * b.mat(), epsilon = 1e-12);
                assert_eq!(prod.structure(), expected(a.structure(), b.structure()));
            }
        }
    }

    #[test]
    fn test_scalar_arithmetic() {
        for a in fixtures() {
            let scaled = &a * 5.;
            assert_eq!(scaled.structure(), a.structure());
            assert_abs_diff_eq!(scaled.mat(), a.mat() * 5., epsilon = 1e-12);

            let shifted = &a + 5.;
            assert_eq!(shifted.structure(), Structure::Dense);
            assert_abs_diff_eq!(shifted.mat(), a.mat() + 5., epsilon = 1e-12);

            let reg = a.regularize(1e-3);
            assert_abs_diff_eq!(reg.mat(), a.mat() + Array2::<f64>::eye(4) * 1e-3, epsilon = 1e-12);
        }
        let low_rank = Spd::low_rank(array![[1.], [2.]]);
        assert_eq!(low_rank.scale(-1.).structure(), Structure::Dense);
        assert_abs_diff_eq!(
            low_rank.scale(-1.).mat(),
            array![[-1., -2.], [-2., -4.]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_low_rank_growth_densifies() {
        let a = Spd::low_rank(array![[1., 0.], [0., 1.], [1., 1.]]);
        let sum = a.add(&a).unwrap();
        assert_eq!(sum.structure(), Structure::Dense);
        assert_abs_diff_eq!(sum.mat(), a.mat() * 2., epsilon = 1e-12);
        let prod = a.mul(&a).unwrap();
        assert_eq!(prod.structure(), Structure::Dense);
        assert_abs_diff_eq!(prod.mat(), a.mat() * a.mat(), epsilon = 1e-12);
    }

    #[test]
    fn test_operands_are_untouched() {
        let a = Spd::diagonal(array![1., 2.]);
        let b = Spd::uniform_diagonal(3., 2);
        let _ = a.add(&b).unwrap();
        assert_abs_diff_eq!(a.diag(), array![1., 2.]);
        assert_abs_diff_eq!(b.diag(), array![3., 3.]);
        assert!(a.add(&Spd::eye(3)).is_err());
    }
}
