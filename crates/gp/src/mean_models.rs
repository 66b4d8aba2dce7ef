//! A module for mean functions of the processes.
//!
//! Like kernels, means are handles on immutable expression trees built from
//! the following leaves:
//! * zero,
//! * one,
//! * user function,
//!
//! combined by sums, products, scaling, input maps and derivatives.

use crate::cache::{Cache, Key, Resolve};
use crate::errors::{GpError, Result};
use crate::input::{InputMap, Transform};
use crate::utils::next_id;
use ndarray::{array, Array1, Array2};
use std::any::Any;
use std::fmt;
use std::ops::{Add, Mul};
use std::rc::Rc;

/// A mean function of inputs given as rows
pub trait MeanModel: fmt::Debug {
    /// Mean vector of length nrows(x)
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>>;

    /// Whether the mean is identically zero
    fn is_zero(&self) -> bool {
        false
    }

    /// Whether the mean is identically one
    fn is_one(&self) -> bool {
        false
    }

    /// Whether the node is a sum, for parenthesization
    fn is_sum(&self) -> bool {
        false
    }

    /// Human readable expression, scalars being formatted with `f`
    fn display(&self, f: &dyn Fn(f64) -> f64) -> String;

    /// Dynamic typing of the node
    fn as_any(&self) -> &dyn Any;
}

/// Handle on a mean expression
#[derive(Clone)]
pub struct Mean {
    id: usize,
    model: Rc<dyn MeanModel>,
}

impl fmt::Debug for Mean {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Mean#{}({})", self.id, self)
    }
}

impl fmt::Display for Mean {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.model.display(&|v| v))
    }
}

impl From<f64> for Mean {
    fn from(c: f64) -> Mean {
        Mean::one().scale(c)
    }
}

impl Mean {
    /// Handle on a new mean node
    pub fn new(model: impl MeanModel + 'static) -> Mean {
        Mean {
            id: next_id(),
            model: Rc::new(model),
        }
    }

    /// The zero mean
    pub fn zero() -> Mean {
        Mean::new(ZeroMean)
    }

    /// The constant one mean
    pub fn one() -> Mean {
        Mean::new(OneMean)
    }

    /// A user function of the inputs displayed as `name`
    pub fn function(name: &str, f: impl Fn(&Array2<f64>) -> Array1<f64> + 'static) -> Mean {
        Mean::new(FunctionMean {
            name: name.to_string(),
            f: Rc::new(f),
        })
    }

    /// Stable handle id
    pub fn id(&self) -> usize {
        self.id
    }

    fn downcast<T: 'static>(&self) -> Option<&T> {
        self.model.as_any().downcast_ref::<T>()
    }

    /// Cached mean vector at x
    pub fn call(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        cache.call(Key::owner("mean", self.id), vec![x.resolve()], false, || {
            let m = self.model.compute(x, cache)?;
            if m.len() != x.nrows() {
                return Err(GpError::InvalidValueError(format!(
                    "mean {self} gives {} values for {} inputs",
                    m.len(),
                    x.nrows()
                )));
            }
            Ok(m)
        })
    }

    /// Mean vector computed with a fresh cache
    pub fn vector(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.call(x, &Cache::new())
    }

    /// Whether the mean is identically zero
    pub fn is_zero(&self) -> bool {
        self.model.is_zero()
    }

    /// Expression with scalars formatted by `f`
    pub fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        self.model.display(f)
    }

    /// `self + other`
    pub fn add(&self, other: &Mean) -> Mean {
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
        Mean::new(SumMean {
            a: self.clone(),
            b: other.clone(),
        })
    }

    /// Elementwise product `self * other`
    pub fn mul(&self, other: &Mean) -> Mean {
        if self.is_zero() || other.model.is_one() {
            return self.clone();
        }
        if other.is_zero() || self.model.is_one() {
            return other.clone();
        }
        let (ca, a) = self.unscaled();
        let (cb, b) = other.unscaled();
        if ca != 1. || cb != 1. {
            return a.mul(&b).scale(ca * cb);
        }
        Mean::new(ProductMean {
            a: self.clone(),
            b: other.clone(),
        })
    }

    fn unscaled(&self) -> (f64, Mean) {
        match self.downcast::<ScaledMean>() {
            Some(s) => (s.c, s.m.clone()),
            None => (1., self.clone()),
        }
    }

    /// `c * self`
    pub fn scale(&self, c: f64) -> Mean {
        if self.is_zero() || c == 0. {
            return Mean::zero();
        }
        let (c0, m) = self.unscaled();
        let c = c * c0;
        if c == 1. {
            return m;
        }
        Mean::new(ScaledMean { c, m })
    }

    /// `m(x / s)`
    pub fn stretch(&self, s: f64) -> Mean {
        self.transform_map(InputMap::Stretch(array![s]))
    }

    /// `m(x - s)`
    pub fn shift(&self, s: f64) -> Mean {
        self.transform_map(InputMap::Shift(array![s]))
    }

    /// Mean restricted to the input dimensions `dims`
    pub fn select(&self, dims: Vec<usize>) -> Mean {
        self.transform_map(InputMap::Select(dims))
    }

    /// `m(f(x))`
    pub fn transform(&self, f: Transform) -> Mean {
        self.transform_map(InputMap::Function(f))
    }

    /// `m(map(x))`
    pub fn transform_map(&self, map: InputMap) -> Mean {
        if self.is_zero() || self.model.is_one() || map.is_identity() {
            return self.clone();
        }
        Mean::new(TransformedMean {
            map,
            m: self.clone(),
        })
    }

    /// Derivative along dimension `dim` by central differences of step `step`
    pub fn diff(&self, dim: usize, step: f64) -> Mean {
        if self.is_zero() || self.model.is_one() {
            return Mean::zero();
        }
        Mean::new(DerivativeMean {
            dim,
            step,
            m: self.clone(),
        })
    }
}

macro_rules! impl_mean_ops {
    ($trait:ident, $method:ident, $scalar:expr) => {
        impl $trait<&Mean> for &Mean {
            type Output = Mean;
            fn $method(self, rhs: &Mean) -> Mean {
                Mean::$method(self, rhs)
            }
        }

        impl $trait<f64> for &Mean {
            type Output = Mean;
            fn $method(self, rhs: f64) -> Mean {
                $scalar(self, rhs)
            }
        }

        impl $trait<&Mean> for f64 {
            type Output = Mean;
            fn $method(self, rhs: &Mean) -> Mean {
                $scalar(rhs, self)
            }
        }
    };
}

impl_mean_ops!(Add, add, |m: &Mean, c: f64| m.add(&Mean::from(c)));
impl_mean_ops!(Mul, mul, |m: &Mean, c: f64| m.scale(c));

fn wrap(m: &Mean, f: &dyn Fn(f64) -> f64) -> String {
    if m.model.is_sum() {
        format!("({})", m.display(f))
    } else {
        m.display(f)
    }
}

/// Constant zero mean
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroMean;

impl MeanModel for ZeroMean {
    fn compute(&self, x: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        Ok(Array1::zeros(x.nrows()))
    }

    fn is_zero(&self) -> bool {
        true
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        "0".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Constant one mean
#[derive(Clone, Copy, Debug, Default)]
pub struct OneMean;

impl MeanModel for OneMean {
    fn compute(&self, x: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        Ok(Array1::ones(x.nrows()))
    }

    fn is_one(&self) -> bool {
        true
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        "1".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A user function as mean
#[derive(Clone)]
pub struct FunctionMean {
    name: String,
    f: Rc<dyn Fn(&Array2<f64>) -> Array1<f64>>,
}

impl fmt::Debug for FunctionMean {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FunctionMean({})", self.name)
    }
}

impl MeanModel for FunctionMean {
    fn compute(&self, x: &Array2<f64>, _cache: &Cache) -> Result<Array1<f64>> {
        Ok((self.f)(x))
    }

    fn display(&self, _f: &dyn Fn(f64) -> f64) -> String {
        self.name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SumMean {
    a: Mean,
    b: Mean,
}

impl MeanModel for SumMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        Ok(self.a.call(x, cache)? + self.b.call(x, cache)?)
    }

    fn is_sum(&self) -> bool {
        true
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} + {}", self.a.display(f), self.b.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct ProductMean {
    a: Mean,
    b: Mean,
}

impl MeanModel for ProductMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        Ok(self.a.call(x, cache)? * self.b.call(x, cache)?)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} * {}", wrap(&self.a, f), wrap(&self.b, f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct ScaledMean {
    c: f64,
    m: Mean,
}

impl MeanModel for ScaledMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        Ok(self.m.call(x, cache)? * self.c)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} * {}", f(self.c), wrap(&self.m, f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct TransformedMean {
    map: InputMap,
    m: Mean,
}

impl MeanModel for TransformedMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        self.m.call(&self.map.apply(x)?, cache)
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("{} {}", wrap(&self.m, f), self.map)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct DerivativeMean {
    dim: usize,
    step: f64,
    m: Mean,
}

impl MeanModel for DerivativeMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        if self.dim >= x.ncols() {
            return Err(GpError::InvalidValueError(format!(
                "cannot differentiate along dimension {} of inputs of dimension {}",
                self.dim,
                x.ncols()
            )));
        }
        let mut up = x.to_owned();
        up.column_mut(self.dim).mapv_inplace(|v| v + self.step);
        let mut down = x.to_owned();
        down.column_mut(self.dim).mapv_inplace(|v| v - self.step);
        Ok((self.m.call(&up, cache)? - self.m.call(&down, cache)?) / (2. * self.step))
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("d({}) {}", self.dim, wrap(&self.m, f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
