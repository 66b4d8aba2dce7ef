//! Input maps applied by transformed kernels and means, and process bindings.
use crate::errors::{GpError, Result};
use crate::graph::GaussianProcess;
use crate::utils::next_id;
use ndarray::{Array1, Array2, Axis};
use std::fmt;
use std::rc::Rc;

/// A user input transform `(n, d) -> (n, d')`
#[derive(Clone)]
pub struct Transform {
    id: usize,
    name: String,
    f: Rc<dyn Fn(&Array2<f64>) -> Array2<f64>>,
}

impl Transform {
    /// Wrap a transform under a display name
    pub fn new(name: &str, f: impl Fn(&Array2<f64>) -> Array2<f64> + 'static) -> Transform {
        Transform {
            id: next_id(),
            name: name.to_string(),
            f: Rc::new(f),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Transform({})", self.name)
    }
}

/// Map applied to inputs before they reach a kernel or a mean
#[derive(Clone, Debug)]
pub enum InputMap {
    /// `x`
    Identity,
    /// `x - s`, `s` being a scalar or one value per dimension
    Shift(Array1<f64>),
    /// `x / s`, `s` being a scalar or one value per dimension
    Stretch(Array1<f64>),
    /// Subset of the input columns
    Select(Vec<usize>),
    /// Arbitrary user transform
    Function(Transform),
}

fn check_broadcast(s: &Array1<f64>, x: &Array2<f64>, what: &str) -> Result<()> {
    if s.len() != 1 && s.len() != x.ncols() {
        return Err(GpError::InvalidValueError(format!(
            "{what} of length {} cannot apply to inputs of dimension {}",
            s.len(),
            x.ncols()
        )));
    }
    Ok(())
}

pub(crate) fn fmt_values(s: &Array1<f64>) -> String {
    if s.len() == 1 {
        format!("{}", s[0])
    } else {
        format!("{s}")
    }
}

impl InputMap {
    /// Apply the map to inputs given as rows
    pub fn apply(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        match self {
            InputMap::Identity => Ok(x.to_owned()),
            InputMap::Shift(s) => {
                check_broadcast(s, x, "shift")?;
                Ok(x - s)
            }
            InputMap::Stretch(s) => {
                check_broadcast(s, x, "stretch")?;
                Ok(x / s)
            }
            InputMap::Select(dims) => {
                if let Some(d) = dims.iter().find(|&&d| d >= x.ncols()) {
                    return Err(GpError::InvalidValueError(format!(
                        "cannot select dimension {d} of inputs of dimension {}",
                        x.ncols()
                    )));
                }
                Ok(x.select(Axis(1), dims))
            }
            InputMap::Function(t) => Ok((t.f)(x)),
        }
    }

    /// Whether the map leaves inputs unchanged
    pub fn is_identity(&self) -> bool {
        matches!(self, InputMap::Identity)
    }

    /// Whether both maps transform inputs identically
    pub fn same_as(&self, other: &InputMap) -> bool {
        match (self, other) {
            (InputMap::Identity, InputMap::Identity) => true,
            (InputMap::Shift(a), InputMap::Shift(b)) => a == b,
            (InputMap::Stretch(a), InputMap::Stretch(b)) => a == b,
            (InputMap::Select(a), InputMap::Select(b)) => a == b,
            (InputMap::Function(a), InputMap::Function(b)) => a.id == b.id,
            _ => false,
        }
    }

    /// Uniform stretch factor, if any
    pub(crate) fn uniform_stretch(&self) -> Option<f64> {
        match self {
            InputMap::Stretch(s) if s.len() == 1 => Some(s[0]),
            _ => None,
        }
    }

    pub(crate) fn preserves_stationarity(&self) -> bool {
        self.is_affine()
    }

    /// Whether the map is a known affine map of the columns
    pub(crate) fn is_affine(&self) -> bool {
        !matches!(self, InputMap::Function(_))
    }

    /// Mapped dimension and factor of `d(map x)/dx_dim`, `None` when the
    /// derivative has no single column form. A dropped dimension gives a zero factor.
    pub(crate) fn chain(&self, dim: usize) -> Option<(Option<usize>, f64)> {
        match self {
            InputMap::Identity | InputMap::Shift(_) => Some((Some(dim), 1.)),
            InputMap::Stretch(s) => {
                let s = if s.len() == 1 { s[0] } else { *s.get(dim)? };
                Some((Some(dim), 1. / s))
            }
            InputMap::Select(dims) => {
                let mut hits = dims.iter().enumerate().filter(|(_, &d)| d == dim);
                match (hits.next(), hits.next()) {
                    (None, _) => Some((None, 0.)),
                    (Some((j, _)), None) => Some((Some(j), 1.)),
                    _ => None,
                }
            }
            InputMap::Function(_) => None,
        }
    }
}

impl fmt::Display for InputMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InputMap::Identity => write!(f, "id"),
            InputMap::Shift(s) => write!(f, "shift {}", fmt_values(s)),
            InputMap::Stretch(s) => write!(f, "> {}", fmt_values(s)),
            InputMap::Select(dims) => write!(f, ": {dims:?}"),
            InputMap::Function(t) => write!(f, "transform {}", t.name),
        }
    }
}

/// A process bound to finite inputs, the unit of evaluation and observation
#[derive(Clone, Debug)]
pub struct At {
    pub(crate) process: GaussianProcess,
    pub(crate) x: Array2<f64>,
}

impl At {
    /// Bind `process` to the inputs `x` given as rows
    pub fn new(process: &GaussianProcess, x: &Array2<f64>) -> At {
        At {
            process: process.clone(),
            x: x.to_owned(),
        }
    }

    /// The bound process
    pub fn process(&self) -> &GaussianProcess {
        &self.process
    }

    /// The bound inputs
    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }
}
