//! Memoization of kernel and mean evaluations.
//!
//! A [`Cache`] guarantees that a given evaluation (owner handle plus resolved
//! arguments) is computed at most once during its lifetime. Symmetric kernel
//! evaluations requested with swapped arguments are served by transposing the
//! stored result. Caches never share entries: a fresh cache forces a full
//! recomputation.
use crate::errors::{GpError, Result};
use gpgraph_spd::Spd;
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, Data, Dimension};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Instant;

/// Structural key of a cached call argument
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// Stable handle of a kernel, mean or process
    Id(usize),
    /// Integer value, also used for integral floats
    Int(i64),
    /// String value
    Str(String),
    /// Boolean value
    Bool(bool),
    /// Bit pattern of a non integral float
    Float(u64),
    /// Shape and bit patterns of an array
    Array(Vec<usize>, Vec<u64>),
    /// Componentwise key of a sequence
    Tuple(Vec<Key>),
}

impl Key {
    pub(crate) fn owner(kind: &str, id: usize) -> Key {
        Key::Tuple(vec![Key::Str(kind.to_string()), Key::Id(id)])
    }
}

/// Conversion of a call argument to its cache [`Key`]
pub trait Resolve {
    /// Deterministic, order sensitive key of the value
    fn resolve(&self) -> Key;
}

impl Resolve for Key {
    fn resolve(&self) -> Key {
        self.clone()
    }
}

impl Resolve for i64 {
    fn resolve(&self) -> Key {
        Key::Int(*self)
    }
}

impl Resolve for usize {
    fn resolve(&self) -> Key {
        Key::Int(*self as i64)
    }
}

impl Resolve for bool {
    fn resolve(&self) -> Key {
        Key::Bool(*self)
    }
}

impl Resolve for f64 {
    fn resolve(&self) -> Key {
        if self.fract() == 0. && self.abs() < 9.0e15 {
            Key::Int(*self as i64)
        } else {
            Key::Float(self.to_bits())
        }
    }
}

impl Resolve for str {
    fn resolve(&self) -> Key {
        Key::Str(self.to_string())
    }
}

impl Resolve for String {
    fn resolve(&self) -> Key {
        Key::Str(self.clone())
    }
}

impl<S: Data<Elem = f64>, D: Dimension> Resolve for ArrayBase<S, D> {
    fn resolve(&self) -> Key {
        Key::Array(
            self.shape().to_vec(),
            self.iter().map(|v| v.to_bits()).collect(),
        )
    }
}

impl<T: Resolve> Resolve for [T] {
    fn resolve(&self) -> Key {
        Key::Tuple(self.iter().map(|v| v.resolve()).collect())
    }
}

impl<T: Resolve> Resolve for Vec<T> {
    fn resolve(&self) -> Key {
        self.as_slice().resolve()
    }
}

impl<A: Resolve, B: Resolve> Resolve for (A, B) {
    fn resolve(&self) -> Key {
        Key::Tuple(vec![self.0.resolve(), self.1.resolve()])
    }
}

impl<T: Resolve + ?Sized> Resolve for &T {
    fn resolve(&self) -> Key {
        (**self).resolve()
    }
}

/// A cached result
#[derive(Clone, Debug)]
pub enum Cached {
    /// Kernel matrix
    Matrix(Array2<f64>),
    /// Structured covariance
    Operator(Spd<f64>),
    /// Mean or elementwise kernel values
    Vector(Array1<f64>),
    /// Scalar result
    Scalar(f64),
}

impl Cached {
    fn transposed(self) -> Cached {
        match self {
            Cached::Matrix(m) => Cached::Matrix(m.reversed_axes()),
            other => other,
        }
    }
}

/// Values which can be stored in a [`Cache`]
pub trait CacheValue: Clone + Sized {
    /// Wrap into a cache entry
    fn into_cached(self) -> Cached;
    /// Unwrap a cache entry of the matching kind
    fn from_cached(cached: Cached) -> Option<Self>;
}

macro_rules! declare_cache_value {
    ($ty:ty, $variant:ident) => {
        impl CacheValue for $ty {
            fn into_cached(self) -> Cached {
                Cached::$variant(self)
            }

            fn from_cached(cached: Cached) -> Option<Self> {
                match cached {
                    Cached::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

declare_cache_value!(Array2<f64>, Matrix);
declare_cache_value!(Spd<f64>, Operator);
declare_cache_value!(Array1<f64>, Vector);
declare_cache_value!(f64, Scalar);

/// Per evaluation memoization table
#[derive(Debug)]
pub struct Cache {
    entries: RefCell<HashMap<Key, Cached>>,
    depth: Cell<usize>,
    computations: Cell<usize>,
    start: Instant,
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new()
    }
}

impl Cache {
    /// An empty cache
    pub fn new() -> Cache {
        Cache {
            entries: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
            computations: Cell::new(0),
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the cache creation
    pub fn dur(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1e3
    }

    /// Current nesting of cached calls
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Number of underlying computations performed on cache misses
    pub fn computations(&self) -> usize {
        self.computations.get()
    }

    fn lookup<T: CacheValue>(&self, key: &Key, transpose: bool) -> Result<Option<T>> {
        let hit = self.entries.borrow().get(key).cloned();
        match hit {
            None => Ok(None),
            Some(cached) => {
                let cached = if transpose { cached.transposed() } else { cached };
                T::from_cached(cached)
                    .map(Some)
                    .ok_or_else(|| GpError::InvalidValueError("cache entry of another kind".into()))
            }
        }
    }

    /// Cached call of `f` owned by `owner` with resolved `args`.
    ///
    /// When `symmetric` and two arguments are given, an entry stored for the
    /// swapped arguments is returned transposed.
    pub fn call<T: CacheValue>(
        &self,
        owner: Key,
        args: Vec<Key>,
        symmetric: bool,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let depth = self.depth.get();
        let mut parts = vec![owner.clone()];
        parts.extend(args.iter().cloned());
        let key = Key::Tuple(parts);
        if let Some(hit) = self.lookup(&key, false)? {
            debug!("{:>10.3} ms {:depth$}hit {:?}", self.dur(), "", owner);
            return Ok(hit);
        }
        if symmetric && args.len() == 2 && args[0] != args[1] {
            let reversed = Key::Tuple(vec![owner.clone(), args[1].clone(), args[0].clone()]);
            if let Some(hit) = self.lookup(&reversed, true)? {
                debug!("{:>10.3} ms {:depth$}reversed hit {:?}", self.dur(), "", owner);
                return Ok(hit);
            }
        }
        debug!("{:>10.3} ms {:depth$}miss {:?}", self.dur(), "", owner);
        self.depth.set(depth + 1);
        self.computations.set(self.computations.get() + 1);
        let res = f();
        self.depth.set(depth);
        let res = res?;
        self.entries
            .borrow_mut()
            .insert(key, res.clone().into_cached());
        Ok(res)
    }

    /// Cached backend computation `name` keyed by positional and keyword arguments,
    /// keyword arguments being sorted by name.
    pub fn memo<T: CacheValue>(
        &self,
        name: &str,
        args: Vec<Key>,
        kwargs: Vec<(&str, Key)>,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let mut kwargs = kwargs;
        kwargs.sort_by(|a, b| a.0.cmp(b.0));
        let kwargs = Key::Tuple(
            kwargs
                .into_iter()
                .map(|(k, v)| Key::Tuple(vec![k.resolve(), v]))
                .collect(),
        );
        self.call(
            Key::Tuple(vec![Key::Str("memo".into()), Key::Str(name.into())]),
            vec![Key::Tuple(args), kwargs],
            false,
            f,
        )
    }
}
