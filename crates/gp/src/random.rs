//! Finite dimensional Gaussian distributions.
//!
//! A [`Normal`] holds its mean and covariance either as values or as
//! construction rules which are run on first access and memoized on the
//! instance. Whether the mean is known to be zero is tracked separately from
//! its materialized value so that sampling can skip the addition.
use crate::errors::{GpError, Result};
use gpgraph_spd::Spd;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
use ndarray_rand::rand::Rng;
use std::cell::OnceCell;
use std::f64::consts::PI;
use std::fmt;

type Rule<T> = Box<dyn Fn() -> Result<T>>;

/// Half width of the 95% central interval in standard deviations
pub const MARGINAL_QUANTILE: f64 = 1.96;

/// A Gaussian distribution over a finite dimensional vector
pub struct Normal {
    mean: OnceCell<Array1<f64>>,
    var: OnceCell<Spd<f64>>,
    mean_rule: Option<Rule<Array1<f64>>>,
    var_rule: Option<Rule<Spd<f64>>>,
    mean_is_zero: bool,
    exact: bool,
}

impl fmt::Debug for Normal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Normal")
            .field("mean", &self.mean.get())
            .field("var", &self.var.get().map(|v| v.structure()))
            .field("mean_is_zero", &self.mean_is_zero)
            .field("exact", &self.exact)
            .finish()
    }
}

fn column(v: &Array1<f64>) -> Array2<f64> {
    v.to_owned().insert_axis(Axis(1))
}

impl Normal {
    /// Normal with given mean and covariance
    pub fn new(mean: Array1<f64>, var: Spd<f64>) -> Result<Normal> {
        if mean.len() != var.dim() {
            return Err(GpError::InvalidValueError(format!(
                "mean of length {} does not match covariance of dimension {}",
                mean.len(),
                var.dim()
            )));
        }
        Ok(Normal {
            mean: OnceCell::from(mean),
            var: OnceCell::from(var),
            mean_rule: None,
            var_rule: None,
            mean_is_zero: false,
            exact: true,
        })
    }

    /// Zero mean Normal with given covariance
    pub fn centered(var: Spd<f64>) -> Normal {
        Normal {
            mean: OnceCell::new(),
            var: OnceCell::from(var),
            mean_rule: None,
            var_rule: None,
            mean_is_zero: true,
            exact: true,
        }
    }

    /// Normal whose mean and covariance are built on first access
    pub fn lazy(
        mean: impl Fn() -> Result<Array1<f64>> + 'static,
        var: impl Fn() -> Result<Spd<f64>> + 'static,
    ) -> Normal {
        Normal {
            mean: OnceCell::new(),
            var: OnceCell::new(),
            mean_rule: Some(Box::new(mean)),
            var_rule: Some(Box::new(var)),
            mean_is_zero: false,
            exact: true,
        }
    }

    /// Zero mean Normal whose covariance is built on first access
    pub fn lazy_centered(var: impl Fn() -> Result<Spd<f64>> + 'static) -> Normal {
        Normal {
            mean: OnceCell::new(),
            var: OnceCell::new(),
            mean_rule: None,
            var_rule: Some(Box::new(var)),
            mean_is_zero: true,
            exact: true,
        }
    }

    pub(crate) fn flagged(mut self, exact: bool) -> Normal {
        self.exact = exact;
        self
    }

    /// Whether the distribution is exactly Gaussian rather than a moment
    /// matched approximation
    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Whether the mean is known to be zero
    pub fn mean_is_zero(&self) -> bool {
        self.mean_is_zero
    }

    /// Covariance, built on first access
    pub fn var(&self) -> Result<&Spd<f64>> {
        if let Some(v) = self.var.get() {
            return Ok(v);
        }
        let rule = self
            .var_rule
            .as_ref()
            .ok_or_else(|| GpError::InvalidValueError("Normal without covariance".into()))?;
        let v = rule()?;
        Ok(self.var.get_or_init(|| v))
    }

    /// Mean, built on first access
    pub fn mean(&self) -> Result<&Array1<f64>> {
        if let Some(m) = self.mean.get() {
            return Ok(m);
        }
        let m = match &self.mean_rule {
            Some(rule) => rule()?,
            None => Array1::zeros(self.dim()?),
        };
        Ok(self.mean.get_or_init(|| m))
    }

    /// Resolves mean and covariance, checking their dimensions agree
    pub fn resolve(&self) -> Result<(&Array1<f64>, &Spd<f64>)> {
        let var = self.var()?;
        let mean = self.mean()?;
        if mean.len() != var.dim() {
            return Err(GpError::InvalidValueError(format!(
                "mean of length {} does not match covariance of dimension {}",
                mean.len(),
                var.dim()
            )));
        }
        Ok((mean, var))
    }

    /// Dimension of the distribution
    pub fn dim(&self) -> Result<usize> {
        Ok(self.var()?.dim())
    }

    fn check_dim(&self, other: &Normal, op: &str) -> Result<()> {
        let (n, m) = (self.dim()?, other.dim()?);
        if n != m {
            return Err(GpError::InvalidValueError(format!(
                "{op}: distributions of dimension {n} and {m}"
            )));
        }
        Ok(())
    }

    /// Log density of each column of `x`
    pub fn logpdf(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Array1<f64>> {
        let (mean, var) = self.resolve()?;
        if x.nrows() != var.dim() {
            return Err(GpError::InvalidValueError(format!(
                "logpdf: values of dimension {} for a distribution of dimension {}",
                x.nrows(),
                var.dim()
            )));
        }
        let n = var.dim() as f64;
        let r = x.to_owned() - &mean.view().insert_axis(Axis(1));
        let logdet = var.logdet()?;
        let mah = var.quadratic_form_diag(&r)?;
        Ok(mah.mapv(|d| -0.5 * (n * (2. * PI).ln() + logdet + d)))
    }

    /// Log density of a single value
    pub fn logpdf_scalar(&self, y: &Array1<f64>) -> Result<f64> {
        Ok(self.logpdf(&column(y))?[0])
    }

    /// Differential entropy
    pub fn entropy(&self) -> Result<f64> {
        let var = self.var()?;
        let n = var.dim() as f64;
        Ok(0.5 * n * (1. + (2. * PI).ln()) + 0.5 * var.logdet()?)
    }

    /// KL divergence `KL(self || other)`
    pub fn kl(&self, other: &Normal) -> Result<f64> {
        self.check_dim(other, "kl")?;
        let (m1, s1) = self.resolve()?;
        let (m2, s2) = other.resolve()?;
        let diff = column(&(m2 - m1));
        Ok(0.5
            * (s1.ratio(s2)? + s2.mah_dist2(&diff)? - s1.dim() as f64 + s2.logdet()?
                - s1.logdet()?))
    }

    /// 2-Wasserstein distance
    pub fn w2(&self, other: &Normal) -> Result<f64> {
        self.check_dim(other, "w2")?;
        let (m1, s1) = self.resolve()?;
        let (m2, s2) = other.resolve()?;
        let r1 = s1.root()?;
        let inner = Spd::dense(r1.dot(&s2.mat()).dot(&r1));
        let cross = inner.root()?.diag().sum();
        let d2 = (m1 - m2).mapv(|v| v * v).sum() + s1.trace() + s2.trace() - 2. * cross;
        // round off can push the squared distance slightly below zero
        Ok(d2.max(0.).sqrt())
    }

    /// `num` samples as columns, with optional independent noise of
    /// variance `noise` added to the covariance before sampling
    pub fn sample<R: Rng>(&self, num: usize, noise: Option<f64>, rng: &mut R) -> Result<Array2<f64>> {
        let var = self.var()?;
        let samples = match noise {
            Some(v) => var
                .add(&Spd::uniform_diagonal(v, var.dim()))?
                .sample(num, rng)?,
            None => var.sample(num, rng)?,
        };
        if self.mean_is_zero {
            Ok(samples)
        } else {
            Ok(samples + &self.mean()?.view().insert_axis(Axis(1)))
        }
    }

    /// Mean with lower and upper bounds of the marginal 95% central intervals
    pub fn marginals(&self) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>)> {
        let (mean, var) = self.resolve()?;
        let err = var.diag().mapv(|v| MARGINAL_QUANTILE * v.max(0.).sqrt());
        Ok((mean.clone(), mean - &err, mean + &err))
    }

    /// Second moment `E[x xᵗ]`
    pub fn m2(&self) -> Result<Spd<f64>> {
        let (mean, var) = self.resolve()?;
        let m = column(mean);
        Ok(Spd::dense(var.mat() + m.dot(&m.t())))
    }

    /// Sum with an independent Normal
    pub fn add(&self, other: &Normal) -> Result<Normal> {
        self.check_dim(other, "add")?;
        let (m1, s1) = self.resolve()?;
        let (m2, s2) = other.resolve()?;
        Ok(Normal::new(m1 + m2, s1.add(s2)?)?.flagged(self.exact && other.exact))
    }

    /// `x + c`
    pub fn add_scalar(&self, c: f64) -> Result<Normal> {
        let (mean, var) = self.resolve()?;
        Ok(Normal::new(mean + c, var.clone())?.flagged(self.exact))
    }

    /// `c x`
    pub fn scale(&self, c: f64) -> Result<Normal> {
        let (mean, var) = self.resolve()?;
        Ok(Normal::new(mean * c, var.scale(c * c))?.flagged(self.exact))
    }

    /// `A x`
    pub fn lmatmul(&self, a: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Normal> {
        let (mean, var) = self.resolve()?;
        if a.ncols() != var.dim() {
            return Err(GpError::InvalidValueError(format!(
                "lmatmul: matrix with {} columns for a distribution of dimension {}",
                a.ncols(),
                var.dim()
            )));
        }
        let cov = a.dot(&var.mat()).dot(&a.t());
        Ok(Normal::new(a.dot(mean), Spd::dense(cov))?.flagged(self.exact))
    }

    /// `Aᵗ x`
    pub fn rmatmul(&self, a: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Normal> {
        self.lmatmul(&a.t())
    }
}
