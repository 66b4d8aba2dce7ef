//! Kernel algebra.
//!
//! A [`Kernel`] is a cheap handle (stable id plus shared model) on an
//! immutable expression tree of [`CovarianceModel`]s. Combinators build new
//! nodes lazily; nothing is evaluated until a kernel is called on inputs, and
//! every call goes through a [`Cache`] keyed by the handle id.
use crate::cache::{Cache, Key, Resolve};
use crate::covariance_models::{OneKernel, ZeroKernel};
use crate::errors::{GpError, Result};
use crate::input::{InputMap, Transform};
use crate::mean_models::Mean;
use crate::utils::next_id;
use gpgraph_spd::Spd;
use ndarray::{array, concatenate, Array1, Array2, Axis};
use std::any::Any;
use std::f64::consts::PI;
use std::fmt;
use std::ops::{Add, Mul};
use std::rc::Rc;

/// A covariance function of two sets of inputs given as rows
pub trait CovarianceModel: fmt::Debug {
    /// Covariance matrix of shape (nrows(x), nrows(y))
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>>;

    /// Covariances between rows of x and y taken pairwise
    fn compute_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        Ok(self.compute(x, y, cache)?.diag().to_owned())
    }

    /// Structured covariance of x with itself
    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        Ok(Spd::dense(self.compute(x, x, cache)?))
    }

    /// Whether the covariance only depends on differences of inputs
    fn stationary(&self) -> bool {
        false
    }

    /// Variance, NaN when not defined
    fn var(&self) -> f64 {
        f64::NAN
    }

    /// Length scale, NaN when not defined
    fn length_scale(&self) -> f64 {
        f64::NAN
    }

    /// Period, infinite when not periodic
    fn period(&self) -> f64 {
        f64::INFINITY
    }

    /// Whether `k(x, y) = k(y, x)ᵗ`
    fn symmetric(&self) -> bool {
        true
    }

    /// Whether the kernel is identically zero
    fn is_zero(&self) -> bool {
        false
    }

    /// Whether the kernel is identically one
    fn is_one(&self) -> bool {
        false
    }

    /// Whether the node is a sum, for parenthesization
    fn is_sum(&self) -> bool {
        false
    }

    /// Whether [`CovarianceModel::derivative`] is known in closed form
    fn has_derivative(&self) -> bool {
        false
    }

    /// Covariance between the partial derivatives of the first argument
    /// along `left` and of the second one along `right`, `None` leaving a
    /// side untouched. At least one side is set.
    fn derivative(
        &self,
        _x: &Array2<f64>,
        _y: &Array2<f64>,
        _left: Option<usize>,
        _right: Option<usize>,
        _cache: &Cache,
    ) -> Result<Array2<f64>> {
        Err(GpError::InvalidValueError(format!(
            "no closed form derivative for {}",
            self.display(&|v| v)
        )))
    }

    /// Pairwise version of [`CovarianceModel::derivative`]
    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        Ok(self.derivative(x, y, left, right, cache)?.diag().to_owned())
    }

    /// Human readable expression, scalars being formatted with `f`
    fn display(&self, f: &dyn Fn(f64) -> f64) -> String;

    /// Dynamic typing of the node
    fn as_any(&self) -> &dyn Any;
}

pub(crate) fn check_elwise(x: &Array2<f64>, y: &Array2<f64>) -> Result<()> {
    if x.dim() != y.dim() {
        return Err(GpError::InvalidValueError(format!(
            "elementwise evaluation needs inputs of the same shape, got {:?} and {:?}",
            x.dim(),
            y.dim()
        )));
    }
    Ok(())
}

fn check_partial(x: &Array2<f64>, dim: Option<usize>) -> Result<()> {
    match dim {
        Some(d) if d >= x.ncols() => Err(GpError::InvalidValueError(format!(
            "cannot differentiate along dimension {d} of inputs of dimension {}",
            x.ncols()
        ))),
        _ => Ok(()),
    }
}

/// Ways to spread a derivative over the two factors of a product
fn product_sides(dim: Option<usize>) -> Vec<(Option<usize>, Option<usize>)> {
    match dim {
        None => vec![(None, None)],
        Some(d) => vec![(Some(d), None), (None, Some(d))],
    }
}

/// Handle on a kernel expression
#[derive(Clone)]
pub struct Kernel {
    id: usize,
    model: Rc<dyn CovarianceModel>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Kernel#{}({})", self.id, self)
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.model.display(&|v| v))
    }
}

impl From<f64> for Kernel {
    fn from(c: f64) -> Kernel {
        Kernel::one().scale(c)
    }
}

impl Kernel {
    /// Handle on a new kernel node
    pub fn new(model: impl CovarianceModel + 'static) -> Kernel {
        Kernel {
            id: next_id(),
            model: Rc::new(model),
        }
    }

    /// The zero kernel
    pub fn zero() -> Kernel {
        Kernel::new(ZeroKernel)
    }

    /// The constant one kernel
    pub fn one() -> Kernel {
        Kernel::new(OneKernel)
    }

    /// Stable handle id
    pub fn id(&self) -> usize {
        self.id
    }

    fn downcast<T: 'static>(&self) -> Option<&T> {
        self.model.as_any().downcast_ref::<T>()
    }

    /// Cached covariance matrix between x and y
    pub fn call(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        cache.call(
            Key::owner("kernel", self.id),
            vec![x.resolve(), y.resolve()],
            self.model.symmetric(),
            || self.model.compute(x, y, cache),
        )
    }

    /// Cached pairwise covariances between rows of x and y
    pub fn elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        cache.call(
            Key::owner("elwise", self.id),
            vec![x.resolve(), y.resolve()],
            self.model.symmetric(),
            || self.model.compute_elwise(x, y, cache),
        )
    }

    /// Cached structured covariance of x with itself
    pub fn structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        cache.call(
            Key::owner("structured", self.id),
            vec![x.resolve()],
            false,
            || self.model.compute_structured(x, cache),
        )
    }

    /// Covariance matrix computed with a fresh cache
    pub fn matrix(&self, x: &Array2<f64>, y: &Array2<f64>) -> Result<Array2<f64>> {
        self.call(x, y, &Cache::new())
    }

    /// Whether the kernel only depends on differences of inputs
    pub fn stationary(&self) -> bool {
        self.model.stationary()
    }

    /// Variance of the kernel
    pub fn var(&self) -> f64 {
        self.model.var()
    }

    /// Length scale of the kernel
    pub fn length_scale(&self) -> f64 {
        self.model.length_scale()
    }

    /// Period of the kernel, infinite when not periodic
    pub fn period(&self) -> f64 {
        self.model.period()
    }

    /// Whether `k(x, y) = k(y, x)ᵗ`
    pub fn symmetric(&self) -> bool {
        self.model.symmetric()
    }

    /// Whether the kernel is identically zero
    pub fn is_zero(&self) -> bool {
        self.model.is_zero()
    }

    pub(crate) fn has_derivative(&self) -> bool {
        self.model.has_derivative()
    }

    /// Closed form partial derivatives, the kernel itself when both sides are `None`
    pub(crate) fn partial(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array2<f64>> {
        if left.is_none() && right.is_none() {
            return self.call(x, y, cache);
        }
        check_partial(x, left)?;
        check_partial(y, right)?;
        self.model.derivative(x, y, left, right, cache)
    }

    pub(crate) fn partial_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        if left.is_none() && right.is_none() {
            return self.elwise(x, y, cache);
        }
        check_elwise(x, y)?;
        check_partial(x, left)?;
        check_partial(y, right)?;
        self.model.derivative_elwise(x, y, left, right, cache)
    }

    /// Expression with scalars formatted by `f`
    pub fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        self.model.display(f)
    }

    /// `self + other`
    pub fn add(&self, other: &Kernel) -> Kernel {
        if self.is_zero() {
            return other.clone();
        }
        if other.is_zero() {
            return self.clone();
        }
        let (ca, a) = self.unscaled();
        let (cb, b) = other.unscaled();
        if Rc::ptr_eq(&a.model, &b.model) {
            return a.scale(ca + cb);
        }
        Kernel::new(Sum {
            a: self.clone(),
            b: other.clone(),
        })
    }

    /// Elementwise product `self * other`
    pub fn mul(&self, other: &Kernel) -> Kernel {
        if self.is_zero() || other.model.is_one() {
            return self.clone();
        }
        if other.is_zero() || self.model.is_one() {
            return other.clone();
        }
        Kernel::new(Product {
            a: self.clone(),
            b: other.clone(),
        })
    }

    fn unscaled(&self) -> (f64, Kernel) {
        match self.downcast::<Scaled>() {
            Some(s) => (s.c, s.k.clone()),
            None => (1., self.clone()),
        }
    }

    /// `c * self`
    pub fn scale(&self, c: f64) -> Kernel {
        if self.is_zero() || c == 0. {
            return Kernel::zero();
        }
        if c == 1. {
            return self.clone();
        }
        let (c0, k) = self.unscaled();
        let c = c * c0;
        if c == 1. {
            return k;
        }
        Kernel::new(Scaled { c, k })
    }

    /// `k(x / s, y / s)`
    pub fn stretch(&self, s: f64) -> Kernel {
        self.stretch_dims(array![s])
    }

    /// `k(x / s, y / s)` with one factor per dimension
    pub fn stretch_dims(&self, s: Array1<f64>) -> Kernel {
        let map = InputMap::Stretch(s);
        self.transform_sides(map.clone(), map)
    }

    /// `k(x - s, y - s)`
    pub fn shift(&self, s: f64) -> Kernel {
        let map = InputMap::Shift(array![s]);
        self.transform_sides(map.clone(), map)
    }

    /// Kernel restricted to the input dimensions `dims`
    pub fn select(&self, dims: Vec<usize>) -> Kernel {
        let map = InputMap::Select(dims);
        self.transform_sides(map.clone(), map)
    }

    /// `k(f(x), f(y))`
    pub fn transform(&self, f: Transform) -> Kernel {
        let map = InputMap::Function(f);
        self.transform_sides(map.clone(), map)
    }

    /// `k(left(x), right(y))`
    pub fn transform_sides(&self, left: InputMap, right: InputMap) -> Kernel {
        if self.is_zero() || (left.is_identity() && right.is_identity()) {
            return self.clone();
        }
        if let Some(inner) = self.downcast::<Transformed>() {
            // inner(l(left(x)), r(right(y))) collapses when one map per side is the identity
            if left.is_identity() && inner.right.is_identity() {
                return inner.k.transform_sides(inner.left.clone(), right);
            }
            if inner.left.is_identity() && right.is_identity() {
                return inner.k.transform_sides(left, inner.right.clone());
            }
        }
        Kernel::new(Transformed {
            left,
            right,
            k: self.clone(),
        })
    }

    /// Periodic version of a kernel with period `period`
    pub fn periodic(&self, period: f64) -> Kernel {
        if self.is_zero() {
            return self.clone();
        }
        Kernel::new(Periodic {
            period,
            k: self.clone(),
        })
    }

    /// Derivative with respect to dimension `dim` of both arguments
    pub fn diff(&self, dim: usize, step: f64) -> Kernel {
        self.diff_sides(Some(dim), Some(dim), step)
    }

    /// Derivative with respect to the first argument along `left` and the
    /// second one along `right`, by central differences of step `step`
    pub fn diff_sides(&self, left: Option<usize>, right: Option<usize>, step: f64) -> Kernel {
        if self.is_zero() || (left.is_none() && right.is_none()) {
            return self.clone();
        }
        if let Some(inner) = self.downcast::<Derivative>() {
            if inner.step == step {
                match (left, right, inner.left, inner.right) {
                    (l, None, None, r) | (None, r, l, None) => {
                        return inner.k.diff_sides(l, r, step);
                    }
                    _ => (),
                }
            }
        }
        Kernel::new(Derivative {
            left,
            right,
            step,
            k: self.clone(),
        })
    }

    /// `k(y, x)ᵗ`
    pub fn reverse(&self) -> Kernel {
        if self.symmetric() {
            return self.clone();
        }
        if let Some(inner) = self.downcast::<Reversed>() {
            return inner.k.clone();
        }
        Kernel::new(Reversed { k: self.clone() })
    }

    /// `f(x) k(x, y) g(y)`
    pub fn weight(&self, left: Option<Mean>, right: Option<Mean>) -> Kernel {
        if self.is_zero() || (left.is_none() && right.is_none()) {
            return self.clone();
        }
        if let Some(inner) = self.downcast::<Weighted>() {
            match (&left, &right, &inner.left, &inner.right) {
                (l, None, None, r) | (None, r, l, None) => {
                    return inner.k.weight(l.clone(), r.clone());
                }
                _ => (),
            }
        }
        Kernel::new(Weighted {
            left,
            right,
            k: self.clone(),
        })
    }
}

macro_rules! impl_kernel_ops {
    ($trait:ident, $method:ident, $scalar:expr) => {
        impl $trait<&Kernel> for &Kernel {
            type Output = Kernel;
            fn $method(self, rhs: &Kernel) -> Kernel {
                Kernel::$method(self, rhs)
            }
        }

        impl $trait<Kernel> for Kernel {
            type Output = Kernel;
            fn $method(self, rhs: Kernel) -> Kernel {
                Kernel::$method(&self, &rhs)
            }
        }

        impl $trait<f64> for &Kernel {
            type Output = Kernel;
            fn $method(self, rhs: f64) -> Kernel {
                $scalar(self, rhs)
            }
        }

        impl $trait<f64> for Kernel {
            type Output = Kernel;
            fn $method(self, rhs: f64) -> Kernel {
                $scalar(&self, rhs)
            }
        }

        impl $trait<Kernel> for f64 {
            type Output = Kernel;
            fn $method(self, rhs: Kernel) -> Kernel {
                $scalar(&rhs, self)
            }
        }

        impl $trait<&Kernel> for f64 {
            type Output = Kernel;
            fn $method(self, rhs: &Kernel) -> Kernel {
                $scalar(rhs, self)
            }
        }
    };
}

impl_kernel_ops!(Add, add, |k: &Kernel, c: f64| k.add(&Kernel::from(c)));
impl_kernel_ops!(Mul, mul, |k: &Kernel, c: f64| k.scale(c));

fn wrap(k: &Kernel, f: &dyn Fn(f64) -> f64) -> String {
    if k.model.is_sum() {
        format!("({})", k.display(f))
    } else {
        k.display(f)
    }
}

#[derive(Debug)]
struct Sum {
    a: Kernel,
    b: Kernel,
}

impl CovarianceModel for Sum {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        Ok(self.a.call(x, y, cache)? + self.b.call(x, y, cache)?)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        Ok(self.a.elwise(x, y, cache)? + self.b.elwise(x, y, cache)?)
    }

    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        Ok(self.a.structured(x, cache)?.add(&self.b.structured(x, cache)?)?)
    }

    fn stationary(&self) -> bool {
        self.a.stationary() && self.b.stationary()
    }

    fn var(&self) -> f64 {
        self.a.var() + self.b.var()
    }

    fn length_scale(&self) -> f64 {
        let (va, vb) = (self.a.var(), self.b.var());
        match (va == 0., vb == 0.) {
            (true, true) => self.a.length_scale().min(self.b.length_scale()),
            (true, false) => self.b.length_scale(),
            (false, true) => self.a.length_scale(),
            _ => (va * self.a.length_scale() + vb * self.b.length_scale()) / (va + vb),
        }
    }

    fn period(&self) -> f64 {
        if self.a.period() == self.b.period() {
            self.a.period()
        } else {
            f64::INFINITY
        }
    }

    fn symmetric(&self) -> bool {
        self.a.symmetric() && self.b.symmetric()
    }

    fn is_sum(&self) -> bool {
        true
    }

    fn has_derivative(&self) -> bool {
        self.a.has_derivative() && self.b.has_derivative()
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array2<f64>> {
        Ok(self.a.partial(x, y, left, right, cache)? + self.b.partial(x, y, left, right, cache)?)
    }

    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        Ok(self.a.partial_elwise(x, y, left, right, cache)?
            + self.b.partial_elwise(x, y, left, right, cache)?)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} + {}", self.a.display(f), self.b.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Product {
    a: Kernel,
    b: Kernel,
}

impl CovarianceModel for Product {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        Ok(self.a.call(x, y, cache)? * self.b.call(x, y, cache)?)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        Ok(self.a.elwise(x, y, cache)? * self.b.elwise(x, y, cache)?)
    }

    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        Ok(self.a.structured(x, cache)?.mul(&self.b.structured(x, cache)?)?)
    }

    fn stationary(&self) -> bool {
        self.a.stationary() && self.b.stationary()
    }

    fn var(&self) -> f64 {
        self.a.var() * self.b.var()
    }

    fn length_scale(&self) -> f64 {
        self.a.length_scale().min(self.b.length_scale())
    }

    fn period(&self) -> f64 {
        if self.a.period() == self.b.period() {
            self.a.period()
        } else {
            f64::INFINITY
        }
    }

    fn symmetric(&self) -> bool {
        self.a.symmetric() && self.b.symmetric()
    }

    fn has_derivative(&self) -> bool {
        self.a.has_derivative() && self.b.has_derivative()
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array2<f64>> {
        let mut res = Array2::zeros((x.nrows(), y.nrows()));
        for (la, lb) in product_sides(left) {
            for (ra, rb) in product_sides(right) {
                res = res
                    + self.a.partial(x, y, la, ra, cache)? * self.b.partial(x, y, lb, rb, cache)?;
            }
        }
        Ok(res)
    }

    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        let mut res = Array1::zeros(x.nrows());
        for (la, lb) in product_sides(left) {
            for (ra, rb) in product_sides(right) {
                res = res
                    + self.a.partial_elwise(x, y, la, ra, cache)?
                        * self.b.partial_elwise(x, y, lb, rb, cache)?;
            }
        }
        Ok(res)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} * {}", wrap(&self.a, f), wrap(&self.b, f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Scaled {
    c: f64,
    k: Kernel,
}

impl CovarianceModel for Scaled {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        Ok(self.k.call(x, y, cache)? * self.c)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        Ok(self.k.elwise(x, y, cache)? * self.c)
    }

    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        Ok(self.k.structured(x, cache)?.scale(self.c))
    }

    fn stationary(&self) -> bool {
        self.k.stationary()
    }

    fn var(&self) -> f64 {
        self.c * self.k.var()
    }

    fn length_scale(&self) -> f64 {
        self.k.length_scale()
    }

    fn period(&self) -> f64 {
        self.k.period()
    }

    fn symmetric(&self) -> bool {
        self.k.symmetric()
    }

    fn has_derivative(&self) -> bool {
        self.k.has_derivative()
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array2<f64>> {
        Ok(self.k.partial(x, y, left, right, cache)? * self.c)
    }

    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        Ok(self.k.partial_elwise(x, y, left, right, cache)? * self.c)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} * {}", f(self.c), wrap(&self.k, f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Transformed {
    left: InputMap,
    right: InputMap,
    k: Kernel,
}

impl Transformed {
    fn same_sides(&self) -> bool {
        self.left.same_as(&self.right)
    }

    /// Inner dimensions and chain rule factor of a derivative through both maps
    fn chain(
        &self,
        left: Option<usize>,
        right: Option<usize>,
    ) -> Option<(Option<usize>, Option<usize>, f64)> {
        let side = |map: &InputMap, dim: Option<usize>| match dim {
            None => Some((None, 1.)),
            Some(d) => map.chain(d),
        };
        let (l, fl) = side(&self.left, left)?;
        let (r, fr) = side(&self.right, right)?;
        Some((l, r, fl * fr))
    }
}

impl CovarianceModel for Transformed {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        self.k
            .call(&self.left.apply(x)?, &self.right.apply(y)?, cache)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        self.k
            .elwise(&self.left.apply(x)?, &self.right.apply(y)?, cache)
    }

    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        if self.same_sides() {
            self.k.structured(&self.left.apply(x)?, cache)
        } else {
            Ok(Spd::dense(self.compute(x, x, cache)?))
        }
    }

    fn stationary(&self) -> bool {
        self.same_sides() && self.left.preserves_stationarity() && self.k.stationary()
    }

    fn var(&self) -> f64 {
        self.k.var()
    }

    fn length_scale(&self) -> f64 {
        match self.left.uniform_stretch() {
            Some(s) if self.same_sides() => s * self.k.length_scale(),
            _ => self.k.length_scale(),
        }
    }

    fn period(&self) -> f64 {
        match self.left.uniform_stretch() {
            Some(s) if self.same_sides() => s * self.k.period(),
            _ => self.k.period(),
        }
    }

    fn symmetric(&self) -> bool {
        self.same_sides() && self.k.symmetric()
    }

    fn has_derivative(&self) -> bool {
        self.left.is_affine() && self.right.is_affine() && self.k.has_derivative()
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array2<f64>> {
        match self.chain(left, right) {
            // derivative along a dropped dimension
            Some((_, _, c)) if c == 0. => Ok(Array2::zeros((x.nrows(), y.nrows()))),
            Some((l, r, c)) => Ok(self
                .k
                .partial(&self.left.apply(x)?, &self.right.apply(y)?, l, r, cache)?
                * c),
            None => Err(GpError::InvalidValueError(format!(
                "no closed form derivative through {} and {}",
                self.left, self.right
            ))),
        }
    }

    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        match self.chain(left, right) {
            Some((_, _, c)) if c == 0. => Ok(Array1::zeros(x.nrows())),
            Some((l, r, c)) => Ok(self
                .k
                .partial_elwise(&self.left.apply(x)?, &self.right.apply(y)?, l, r, cache)?
                * c),
            None => Err(GpError::InvalidValueError(format!(
                "no closed form derivative through {} and {}",
                self.left, self.right
            ))),
        }
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        if self.same_sides() {
            format!("{} {}", wrap(&self.k, f), self.left)
        } else {
            format!("{} ({}, {})", wrap(&self.k, f), self.left, self.right)
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Periodic {
    period: f64,
    k: Kernel,
}

impl Periodic {
    fn features(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let scale = 2. * PI / self.period;
        let sin = x.mapv(|v| (v * scale).sin());
        let cos = x.mapv(|v| (v * scale).cos());
        concatenate(Axis(1), &[sin.view(), cos.view()])
            .map_err(|e| GpError::InvalidValueError(e.to_string()))
    }
}

impl CovarianceModel for Periodic {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        self.k.call(&self.features(x)?, &self.features(y)?, cache)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        self.k.elwise(&self.features(x)?, &self.features(y)?, cache)
    }

    fn compute_structured(&self, x: &Array2<f64>, cache: &Cache) -> Result<Spd<f64>> {
        self.k.structured(&self.features(x)?, cache)
    }

    fn stationary(&self) -> bool {
        self.k.stationary()
    }

    fn var(&self) -> f64 {
        self.k.var()
    }

    fn length_scale(&self) -> f64 {
        self.k.length_scale()
    }

    fn period(&self) -> f64 {
        self.period
    }

    fn symmetric(&self) -> bool {
        self.k.symmetric()
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} per {}", wrap(&self.k, f), self.period)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Derivative {
    left: Option<usize>,
    right: Option<usize>,
    step: f64,
    k: Kernel,
}

fn shifted(x: &Array2<f64>, dim: usize, h: f64) -> Result<Array2<f64>> {
    if dim >= x.ncols() {
        return Err(GpError::InvalidValueError(format!(
            "cannot differentiate along dimension {dim} of inputs of dimension {}",
            x.ncols()
        )));
    }
    let mut res = x.to_owned();
    res.column_mut(dim).mapv_inplace(|v| v + h);
    Ok(res)
}

/// Inputs moved by +h and -h along `dim`, or untouched
fn stencil(x: &Array2<f64>, dim: Option<usize>, h: f64) -> Result<Vec<(f64, Array2<f64>)>> {
    match dim {
        None => Ok(vec![(1., x.to_owned())]),
        Some(d) => Ok(vec![
            (1. / (2. * h), shifted(x, d, h)?),
            (-1. / (2. * h), shifted(x, d, -h)?),
        ]),
    }
}

impl Derivative {
    fn combine<T>(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        eval: impl Fn(&Array2<f64>, &Array2<f64>) -> Result<T>,
    ) -> Result<T>
    where
        T: std::ops::Mul<f64, Output = T> + std::ops::Add<T, Output = T>,
    {
        let mut acc: Option<T> = None;
        for (wx, xs) in stencil(x, self.left, self.step)? {
            for (wy, ys) in stencil(y, self.right, self.step)? {
                let term = eval(&xs, &ys)? * (wx * wy);
                acc = Some(match acc {
                    None => term,
                    Some(a) => a + term,
                });
            }
        }
        acc.ok_or_else(|| GpError::InvalidValueError("empty difference stencil".into()))
    }
}

impl CovarianceModel for Derivative {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        if self.k.has_derivative() {
            return self.k.partial(x, y, self.left, self.right, cache);
        }
        self.combine(x, y, |xs, ys| self.k.call(xs, ys, cache))
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        if self.k.has_derivative() {
            return self.k.partial_elwise(x, y, self.left, self.right, cache);
        }
        self.combine(x, y, |xs, ys| self.k.elwise(xs, ys, cache))
    }

    fn stationary(&self) -> bool {
        self.k.stationary()
    }

    fn length_scale(&self) -> f64 {
        self.k.length_scale()
    }

    fn symmetric(&self) -> bool {
        self.left == self.right && self.k.symmetric()
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        match (self.left, self.right) {
            (Some(l), Some(r)) if l == r => format!("d({l}) {}", wrap(&self.k, f)),
            (l, r) => {
                let side = |d: Option<usize>| d.map_or("_".to_string(), |d| d.to_string());
                format!("d({}, {}) {}", side(l), side(r), wrap(&self.k, f))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Reversed {
    k: Kernel,
}

impl CovarianceModel for Reversed {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        Ok(self.k.call(y, x, cache)?.reversed_axes())
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        self.k.elwise(y, x, cache)
    }

    fn stationary(&self) -> bool {
        self.k.stationary()
    }

    fn var(&self) -> f64 {
        self.k.var()
    }

    fn length_scale(&self) -> f64 {
        self.k.length_scale()
    }

    fn period(&self) -> f64 {
        self.k.period()
    }

    fn symmetric(&self) -> bool {
        self.k.symmetric()
    }

    fn has_derivative(&self) -> bool {
        self.k.has_derivative()
    }

    fn derivative(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array2<f64>> {
        Ok(self.k.partial(y, x, right, left, cache)?.reversed_axes())
    }

    fn derivative_elwise(
        &self,
        x: &Array2<f64>,
        y: &Array2<f64>,
        left: Option<usize>,
        right: Option<usize>,
        cache: &Cache,
    ) -> Result<Array1<f64>> {
        self.k.partial_elwise(y, x, right, left, cache)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("Reversed({})", self.k.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Weighted {
    left: Option<Mean>,
    right: Option<Mean>,
    k: Kernel,
}

impl CovarianceModel for Weighted {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        let mut res = self.k.call(x, y, cache)?;
        if let Some(f) = &self.left {
            res = res * &f.call(x, cache)?.insert_axis(Axis(1));
        }
        if let Some(g) = &self.right {
            res = res * &g.call(y, cache)?.insert_axis(Axis(0));
        }
        Ok(res)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        let mut res = self.k.elwise(x, y, cache)?;
        if let Some(f) = &self.left {
            res = res * f.call(x, cache)?;
        }
        if let Some(g) = &self.right {
            res = res * g.call(y, cache)?;
        }
        Ok(res)
    }

    fn symmetric(&self) -> bool {
        let same = match (&self.left, &self.right) {
            (None, None) => true,
            (Some(f), Some(g)) => f.id() == g.id(),
            _ => false,
        };
        same && self.k.symmetric()
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        let mut res = wrap(&self.k, f);
        if let Some(m) = &self.left {
            res = format!("{} * {res}", m.display(f));
        }
        if let Some(m) = &self.right {
            res = format!("{res} * {}", m.display(f));
        }
        res
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use crate::mean_models::Mean;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    fn inputs() -> (Array2<f64>, Array2<f64>) {
        (
            Array::linspace(0., 2., 5).insert_axis(Axis(1)),
            Array::linspace(-1., 1., 3).insert_axis(Axis(1)),
        )
    }

    fn eq() -> Kernel {
        Kernel::new(SquaredExponential)
    }

    #[test]
    fn test_sum_product_scale() {
        let (x, y) = inputs();
        let k1 = eq();
        let k2 = Kernel::new(Matern32);
        let k = (&k1 + &k2) * 2.;
        assert_abs_diff_eq!(
            k.matrix(&x, &y).unwrap(),
            (k1.matrix(&x, &y).unwrap() + k2.matrix(&x, &y).unwrap()) * 2.,
            epsilon = 1e-12
        );
        let p = &k1 * &k2;
        assert_abs_diff_eq!(
            p.matrix(&x, &y).unwrap(),
            k1.matrix(&x, &y).unwrap() * k2.matrix(&x, &y).unwrap(),
            epsilon = 1e-12
        );
        assert_eq!(format!("{k}"), "2 * (EQ() + Matern32())");
        assert_eq!(format!("{p}"), "EQ() * Matern32()");
    }

    #[test]
    fn test_simplifications() {
        let k = eq();
        assert_eq!(format!("{}", &k + &Kernel::zero()), "EQ()");
        assert!((&k * &Kernel::zero()).is_zero());
        assert_eq!(format!("{}", &k * &Kernel::one()), "EQ()");
        assert_eq!(format!("{}", (&k * 2.) * 3.), "6 * EQ()");
        assert_eq!(format!("{}", &k + &k), "2 * EQ()");
        assert_eq!(format!("{}", &(&k * 2.) + &(&k * 3.)), "5 * EQ()");
        assert!(Kernel::from(0.).is_zero());
        assert_eq!(format!("{}", Kernel::from(3.)), "3 * 1");
        assert_eq!(format!("{}", 5. + &k), "EQ() + 5 * 1");
        assert_eq!(k.scale(2.).display(&|v| v * v), "4 * EQ()");
    }

    #[test]
    fn test_input_transforms() {
        let (x, y) = inputs();
        let k = eq();
        assert_abs_diff_eq!(
            k.stretch(2.).matrix(&x, &y).unwrap(),
            k.matrix(&(&x / 2.), &(&y / 2.)).unwrap(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            k.shift(1.).matrix(&x, &y).unwrap(),
            k.matrix(&x, &y).unwrap(),
            epsilon = 1e-12
        );
        let lin = Kernel::new(Linear);
        assert_abs_diff_eq!(
            lin.shift(1.).matrix(&x, &y).unwrap(),
            lin.matrix(&(&x - 1.), &(&y - 1.)).unwrap(),
            epsilon = 1e-12
        );
        let x2 = array![[0., 1.], [2., 3.]];
        assert_abs_diff_eq!(
            k.select(vec![1]).matrix(&x2, &x2).unwrap(),
            k.matrix(&array![[1.], [3.]], &array![[1.], [3.]]).unwrap(),
            epsilon = 1e-12
        );
        let sq = Transform::new("square", |x| x.mapv(|v| v * v));
        assert_abs_diff_eq!(
            k.transform(sq).matrix(&x, &y).unwrap(),
            k.matrix(&x.mapv(|v| v * v), &y.mapv(|v| v * v)).unwrap(),
            epsilon = 1e-12
        );
        assert_eq!(format!("{}", k.stretch(2.)), "EQ() > 2");
        assert_eq!(format!("{}", k.periodic(1.)), "EQ() per 1");
    }

    #[test]
    fn test_asymmetric_sides_merge() {
        let (x, y) = inputs();
        let k = eq();
        let s = InputMap::Stretch(array![2.]);
        let left = k.transform_sides(s.clone(), InputMap::Identity);
        assert!(!left.symmetric());
        let both = left.transform_sides(InputMap::Identity, s.clone());
        assert!(both.symmetric());
        assert_abs_diff_eq!(
            both.matrix(&x, &y).unwrap(),
            k.stretch(2.).matrix(&x, &y).unwrap(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            left.reverse().matrix(&y, &x).unwrap(),
            left.matrix(&x, &y).unwrap().t().to_owned(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_properties() {
        let k1 = eq();
        let k2 = eq().stretch(2.) * 4.;
        let k = &k1 + &k2;
        assert!(k.stationary());
        assert_abs_diff_eq!(k.var(), 5.);
        assert_abs_diff_eq!(k.length_scale(), 9. / 5.);
        assert_eq!(k.period(), f64::INFINITY);
        assert_eq!(k1.periodic(10.).period(), 10.);
        assert_eq!(k1.periodic(1.).stretch(2.).period(), 2.);
        assert_eq!((&k1 * &k2).var(), 4.);
        assert_eq!((&k1 * &k2).length_scale(), 1.);
        let lin = Kernel::new(Linear);
        assert!(!lin.stationary());
        assert!(!(&lin + &k1).stationary());
        assert!(!k1.transform(Transform::new("f", |x| x.to_owned())).stationary());
    }

    #[test]
    fn test_derivative() {
        let (x, y) = inputs();
        let k = eq();
        let step = 1e-4;
        let r = x.clone() - &y.t();
        let kxy = k.matrix(&x, &y).unwrap();
        // d/dx exp(-r²/2) = -r exp(-r²/2)
        assert_abs_diff_eq!(
            k.diff_sides(Some(0), None, step).matrix(&x, &y).unwrap(),
            -&r * &kxy,
            epsilon = 1e-7
        );
        assert_abs_diff_eq!(
            k.diff_sides(None, Some(0), step).matrix(&x, &y).unwrap(),
            &r * &kxy,
            epsilon = 1e-7
        );
        let dd = k.diff_sides(Some(0), None, step).diff_sides(None, Some(0), step);
        assert!(dd.symmetric());
        assert_abs_diff_eq!(
            dd.matrix(&x, &y).unwrap(),
            (1. - &r * &r) * &kxy,
            epsilon = 1e-6
        );
        assert_eq!(format!("{}", k.diff(0, step)), "d(0) EQ()");
        assert!(k.diff(1, step).matrix(&x, &y).is_err());
    }

    #[test]
    fn test_derivative_fallback() {
        let (x, y) = inputs();
        let k = eq();
        let opaque = k.transform(Transform::new("id", |x| x.to_owned()));
        assert!(k.has_derivative());
        assert!(!opaque.has_derivative());
        let step = 1e-3;
        // central differences through the opaque transform match the closed form
        for (l, r) in [(Some(0), None), (None, Some(0)), (Some(0), Some(0))] {
            assert_abs_diff_eq!(
                opaque.diff_sides(l, r, step).matrix(&x, &y).unwrap(),
                k.diff_sides(l, r, step).matrix(&x, &y).unwrap(),
                epsilon = 1e-5
            );
        }
        // chain rule through an affine map
        let stretched = k.stretch(2.).shift(1.);
        assert!(stretched.has_derivative());
        let mut dx = x.clone();
        dx.mapv_inplace(|v| (v - 1.) / 2.);
        let mut dy = y.clone();
        dy.mapv_inplace(|v| (v - 1.) / 2.);
        assert_abs_diff_eq!(
            stretched.diff_sides(Some(0), Some(0), step).matrix(&x, &y).unwrap(),
            k.diff_sides(Some(0), Some(0), step).matrix(&dx, &dy).unwrap() / 4.,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_weighted() {
        let (x, y) = inputs();
        let k = eq();
        let f = Mean::function("f", |x: &Array2<f64>| x.column(0).mapv(|v| v + 1.));
        let w = k.weight(Some(f.clone()), Some(f.clone()));
        let fx = x.column(0).mapv(|v| v + 1.);
        let fy = y.column(0).mapv(|v| v + 1.);
        let expected = k.matrix(&x, &y).unwrap()
            * &fx.insert_axis(Axis(1))
            * &fy.insert_axis(Axis(0));
        assert_abs_diff_eq!(w.matrix(&x, &y).unwrap(), expected, epsilon = 1e-12);
        assert!(w.symmetric());
        assert!(!k.weight(Some(f), None).symmetric());
    }

    #[test]
    fn test_elwise_and_structured() {
        let (x, _) = inputs();
        let y = x.mapv(|v| v * 0.5);
        let cache = Cache::new();
        let ks = vec![
            eq() + Kernel::new(Matern52) * 2.,
            eq().stretch(3.) * Kernel::new(Linear),
            eq().periodic(0.7),
            eq().diff(0, 1e-4),
            eq().transform_sides(InputMap::Shift(array![1.]), InputMap::Identity),
        ];
        for k in ks {
            assert_abs_diff_eq!(
                k.elwise(&x, &y, &cache).unwrap(),
                k.call(&x, &y, &cache).unwrap().diag().to_owned(),
                epsilon = 1e-10
            );
            assert_abs_diff_eq!(
                k.structured(&x, &cache).unwrap().mat(),
                k.call(&x, &x, &cache).unwrap(),
                epsilon = 1e-10
            );
        }
        let noise = Kernel::new(Delta) * 0.1;
        assert_eq!(
            noise.structured(&x, &cache).unwrap().structure(),
            gpgraph_spd::Structure::UniformDiagonal
        );
    }

    #[test]
    fn test_kernel_calls_are_cached() {
        let (x, y) = inputs();
        let cache = Cache::new();
        let k = eq().stretch(2.) + Kernel::new(Matern32);
        let a = k.call(&x, &y, &cache).unwrap();
        let computed = cache.computations();
        let b = k.call(&y, &x, &cache).unwrap();
        assert_eq!(cache.computations(), computed);
        assert_abs_diff_eq!(a, b.t().to_owned());
    }
}
