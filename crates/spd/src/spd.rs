use crate::errors::{Result, SpdError};
use linfa::Float;
use linfa_linalg::{cholesky::*, eigh::*, triangular::*};
use ndarray::{Array, Array1, Array2, ArrayBase, Axis, Data, Ix2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use std::cell::OnceCell;
use std::fmt;

/// Diagonal regularization added before a dense Cholesky factorization
pub const CHOLESKY_JITTER: f64 = 1e-12;

/// Square roots of eigenvalues, the negative ones coming from rounding set to zero
fn sqrt_eigenvalues<F: Float>(vals: &Array1<F>) -> Array1<F> {
    vals.mapv(|v| v.max(F::zero()).sqrt())
}

/// Structure tag of an [`Spd`] operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Structure {
    /// Full n x n matrix
    Dense,
    /// Vector of n diagonal entries
    Diagonal,
    /// Scalar times the n x n identity
    UniformDiagonal,
    /// `F Fᵗ` with a n x k factor `F`
    LowRank,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Structure::Dense => "Dense",
            Structure::Diagonal => "Diagonal",
            Structure::UniformDiagonal => "UniformDiagonal",
            Structure::LowRank => "LowRank",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug)]
pub(crate) enum SpdRepr<F: Float> {
    Dense(Array2<F>),
    Diagonal(Array1<F>),
    UniformDiagonal(F, usize),
    LowRank(Array2<F>),
}

/// A symmetric positive (semi-)definite operator of size n x n.
///
/// Operators are immutable values: arithmetic returns new operators.
/// The Cholesky factor is computed at most once per instance.
#[derive(Clone, Debug)]
pub struct Spd<F: Float> {
    pub(crate) repr: SpdRepr<F>,
    chol: OnceCell<Array2<F>>,
}

impl<F: Float> From<Array2<F>> for Spd<F> {
    fn from(mat: Array2<F>) -> Self {
        Spd::dense(mat)
    }
}

impl<F: Float> Spd<F> {
    pub(crate) fn from_repr(repr: SpdRepr<F>) -> Self {
        Spd {
            repr,
            chol: OnceCell::new(),
        }
    }

    /// Dense operator from a full symmetric matrix
    pub fn dense(mat: Array2<F>) -> Self {
        Self::from_repr(SpdRepr::Dense(mat))
    }

    /// Diagonal operator from its diagonal entries
    pub fn diagonal(diag: Array1<F>) -> Self {
        Self::from_repr(SpdRepr::Diagonal(diag))
    }

    /// `value * I` of size `n`
    pub fn uniform_diagonal(value: F, n: usize) -> Self {
        Self::from_repr(SpdRepr::UniformDiagonal(value, n))
    }

    /// `factor * factorᵗ` where `factor` has shape (n, k)
    pub fn low_rank(factor: Array2<F>) -> Self {
        Self::from_repr(SpdRepr::LowRank(factor))
    }

    /// Identity operator of size `n`
    pub fn eye(n: usize) -> Self {
        Self::uniform_diagonal(F::one(), n)
    }

    /// Null operator of size `n`
    pub fn zeros(n: usize) -> Self {
        Self::uniform_diagonal(F::zero(), n)
    }

    /// Structure of the operator
    pub fn structure(&self) -> Structure {
        match self.repr {
            SpdRepr::Dense(_) => Structure::Dense,
            SpdRepr::Diagonal(_) => Structure::Diagonal,
            SpdRepr::UniformDiagonal(..) => Structure::UniformDiagonal,
            SpdRepr::LowRank(_) => Structure::LowRank,
        }
    }

    /// Size n of the operator
    pub fn dim(&self) -> usize {
        match &self.repr {
            SpdRepr::Dense(m) => m.nrows(),
            SpdRepr::Diagonal(d) => d.len(),
            SpdRepr::UniformDiagonal(_, n) => *n,
            SpdRepr::LowRank(f) => f.nrows(),
        }
    }

    /// Shape (n, n)
    pub fn shape(&self) -> (usize, usize) {
        (self.dim(), self.dim())
    }

    /// Whether the operator cannot be inverted because of its structure
    pub fn is_singular(&self) -> bool {
        match &self.repr {
            SpdRepr::LowRank(f) => f.ncols() < f.nrows(),
            _ => false,
        }
    }

    /// Dense n x n matrix
    pub fn mat(&self) -> Array2<F> {
        match &self.repr {
            SpdRepr::Dense(m) => m.to_owned(),
            SpdRepr::Diagonal(d) => Array2::from_diag(d),
            SpdRepr::UniformDiagonal(c, n) => Array2::eye(*n) * *c,
            SpdRepr::LowRank(f) => f.dot(&f.t()),
        }
    }

    /// Diagonal entries, computed without materializing the matrix
    pub fn diag(&self) -> Array1<F> {
        match &self.repr {
            SpdRepr::Dense(m) => m.diag().to_owned(),
            SpdRepr::Diagonal(d) => d.to_owned(),
            SpdRepr::UniformDiagonal(c, n) => Array1::from_elem(*n, *c),
            SpdRepr::LowRank(f) => f.mapv(|v| v * v).sum_axis(Axis(1)),
        }
    }

    /// Trace of the operator
    pub fn trace(&self) -> F {
        match &self.repr {
            SpdRepr::UniformDiagonal(c, n) => *c * F::cast(*n),
            _ => self.diag().sum(),
        }
    }

    /// Same operator stored as a dense matrix
    pub fn densify(&self) -> Self {
        Spd::dense(self.mat())
    }

    fn singular(&self, op: &str) -> SpdError {
        SpdError::Singular(format!(
            "{op} of a {} operator of size {} and rank {} (densify and regularize first)",
            self.structure(),
            self.dim(),
            self.rank()
        ))
    }

    fn rank(&self) -> usize {
        match &self.repr {
            SpdRepr::LowRank(f) => f.ncols().min(f.nrows()),
            _ => self.dim(),
        }
    }

    pub(crate) fn check_dim(&self, n: usize, op: &str) -> Result<()> {
        if self.dim() != n {
            Err(SpdError::DimensionMismatch(format!(
                "{op}: operator of size {} against {n} rows",
                self.dim()
            )))
        } else {
            Ok(())
        }
    }

    /// Lower triangular `L` such that `L Lᵗ = A`.
    ///
    /// Diagonal structures take elementwise square roots, dense ones are
    /// factorized once with a small jitter then cached.
    pub fn cholesky(&self) -> Result<&Array2<F>> {
        if let Some(l) = self.chol.get() {
            return Ok(l);
        }
        let l = match &self.repr {
            SpdRepr::Diagonal(d) => Array2::from_diag(&d.mapv(|v| v.sqrt())),
            SpdRepr::UniformDiagonal(c, n) => Array2::eye(*n) * c.sqrt(),
            SpdRepr::LowRank(_) if self.is_singular() => return Err(self.singular("cholesky")),
            _ => {
                let n = self.dim();
                let jittered = self.mat() + Array2::<F>::eye(n) * F::cast(CHOLESKY_JITTER);
                jittered.cholesky()?
            }
        };
        Ok(self.chol.get_or_init(|| l))
    }

    /// Any `R` with `R Rᵗ = A`, the low rank factor itself when available
    pub fn factor(&self) -> Result<Array2<F>> {
        match &self.repr {
            SpdRepr::LowRank(f) => Ok(f.to_owned()),
            _ => Ok(self.cholesky()?.to_owned()),
        }
    }

    /// Symmetric square root `R` such that `R R = A`
    pub fn root(&self) -> Result<Array2<F>> {
        match &self.repr {
            SpdRepr::Diagonal(d) => Ok(Array2::from_diag(&d.mapv(|v| v.max(F::zero()).sqrt()))),
            SpdRepr::UniformDiagonal(c, n) => Ok(Array2::eye(*n) * c.max(F::zero()).sqrt()),
            _ => {
                let (vals, vecs) = self.mat().eigh_into()?;
                let sq = sqrt_eigenvalues(&vals);
                Ok((&vecs * &sq).dot(&vecs.t()))
            }
        }
    }

    /// `L B` where `L` is the Cholesky factor
    pub fn cholesky_mul(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_dim(b.nrows(), "cholesky_mul")?;
        match &self.repr {
            SpdRepr::Diagonal(d) => Ok(b * &d.mapv(|v| v.sqrt()).insert_axis(Axis(1))),
            SpdRepr::UniformDiagonal(c, _) => Ok(b.mapv(|v| v * c.sqrt())),
            _ => Ok(self.cholesky()?.dot(b)),
        }
    }

    /// `L⁻¹ B` where `L` is the Cholesky factor
    pub fn cholesky_solve(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_dim(b.nrows(), "cholesky_solve")?;
        match &self.repr {
            SpdRepr::Diagonal(d) => Ok(b / &d.mapv(|v| v.sqrt()).insert_axis(Axis(1))),
            SpdRepr::UniformDiagonal(c, _) => Ok(b.mapv(|v| v / c.sqrt())),
            _ => Ok(self.cholesky()?.solve_triangular(b, UPLO::Lower)?),
        }
    }

    /// `tr(B⁻¹ A)` where `A` is `self`, the trace term of the Gaussian KL divergence
    pub fn ratio(&self, other: &Spd<F>) -> Result<F> {
        self.check_dim(other.dim(), "ratio")?;
        match (&self.repr, &other.repr) {
            (SpdRepr::Diagonal(a), SpdRepr::Diagonal(b)) => Ok((a / b).sum()),
            (SpdRepr::UniformDiagonal(a, n), SpdRepr::UniformDiagonal(b, _)) => {
                Ok(*a / *b * F::cast(*n))
            }
            (_, SpdRepr::Diagonal(b)) => Ok((self.diag() / b).sum()),
            (_, SpdRepr::UniformDiagonal(b, _)) => Ok(self.trace() / *b),
            _ => {
                if other.is_singular() {
                    return Err(other.singular("ratio"));
                }
                let x = other.cholesky_solve(&self.factor()?)?;
                Ok(x.mapv(|v| v * v).sum())
            }
        }
    }

    /// Squared Mahalanobis distance `Σ_j aⱼᵗ A⁻¹ aⱼ` summed over the columns of `a`
    pub fn mah_dist2(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<F> {
        let x = self.solve_checked(a, "mah_dist2")?;
        Ok(x.mapv(|v| v * v).sum())
    }

    /// Squared Mahalanobis distance between the columns of `a` and `b`
    pub fn mah_dist2_between(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<F> {
        if a.shape() != b.shape() {
            return Err(SpdError::DimensionMismatch(format!(
                "mah_dist2: {:?} against {:?}",
                a.shape(),
                b.shape()
            )));
        }
        self.mah_dist2(&(a.to_owned() - b))
    }

    /// `aᵗ A⁻¹ a`
    pub fn quadratic_form(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let x = self.solve_checked(a, "quadratic_form")?;
        Ok(x.t().dot(&x))
    }

    /// `aᵗ A⁻¹ b`
    pub fn quadratic_form_between(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        let xa = self.solve_checked(a, "quadratic_form")?;
        let xb = self.solve_checked(b, "quadratic_form")?;
        Ok(xa.t().dot(&xb))
    }

    /// Diagonal of `aᵗ A⁻¹ a` without forming the full product
    pub fn quadratic_form_diag(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array1<F>> {
        let x = self.solve_checked(a, "quadratic_form_diag")?;
        Ok(x.mapv(|v| v * v).sum_axis(Axis(0)))
    }

    /// Diagonal of `aᵗ A⁻¹ b` without forming the full product
    pub fn quadratic_form_diag_between(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array1<F>> {
        if a.shape() != b.shape() {
            return Err(SpdError::DimensionMismatch(format!(
                "quadratic_form_diag: {:?} against {:?}",
                a.shape(),
                b.shape()
            )));
        }
        let xa = self.solve_checked(a, "quadratic_form_diag")?;
        let xb = self.solve_checked(b, "quadratic_form_diag")?;
        Ok((xa * xb).sum_axis(Axis(0)))
    }

    /// `A⁻¹ B`
    pub fn inv_prod(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_dim(b.nrows(), "inv_prod")?;
        match &self.repr {
            SpdRepr::Diagonal(d) => Ok(b / &d.to_owned().insert_axis(Axis(1))),
            SpdRepr::UniformDiagonal(c, _) => Ok(b.mapv(|v| v / *c)),
            _ => {
                if self.is_singular() {
                    return Err(self.singular("inv_prod"));
                }
                let l = self.cholesky()?;
                let y = l.solve_triangular(b, UPLO::Lower)?;
                Ok(l.t().solve_triangular(&y, UPLO::Upper)?)
            }
        }
    }

    /// Log-determinant
    pub fn logdet(&self) -> Result<F> {
        match &self.repr {
            SpdRepr::Diagonal(d) => Ok(d.mapv(|v| v.ln()).sum()),
            SpdRepr::UniformDiagonal(c, n) => Ok(c.ln() * F::cast(*n)),
            _ => {
                if self.is_singular() {
                    return Err(self.singular("logdet"));
                }
                let l = self.cholesky()?;
                Ok(F::cast(2.) * l.diag().mapv(|v| v.ln()).sum())
            }
        }
    }

    /// Draws `num` samples from N(0, A), one per column
    pub fn sample<R: Rng>(&self, num: usize, rng: &mut R) -> Result<Array2<F>> {
        let n = self.dim();
        let z = |rows: usize, rng: &mut R| {
            Array::random_using((rows, num), StandardNormal, rng).mapv(|v: f64| F::cast(v))
        };
        match &self.repr {
            SpdRepr::Diagonal(d) => {
                Ok(z(n, rng) * &d.mapv(|v| v.max(F::zero()).sqrt()).insert_axis(Axis(1)))
            }
            SpdRepr::UniformDiagonal(c, _) => Ok(z(n, rng) * c.max(F::zero()).sqrt()),
            SpdRepr::LowRank(f) => Ok(f.dot(&z(f.ncols(), rng))),
            SpdRepr::Dense(m) => {
                // Eigen factor rather than Cholesky: posterior covariances are
                // often numerically rank deficient.
                let (vals, vecs) = m.to_owned().eigh_into()?;
                let sq = sqrt_eigenvalues(&vals);
                Ok((&vecs * &sq).dot(&z(n, rng)))
            }
        }
    }

    fn solve_checked(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>, op: &str) -> Result<Array2<F>> {
        if self.is_singular() {
            return Err(self.singular(op));
        }
        self.cholesky_solve(a)
    }
}
