//! Registry of jointly distributed processes.
//!
//! A [`Graph`] records how every registered process derives from the others.
//! The kernel between two processes and the mean of a process are assembled on
//! first request by expanding the most recently derived side, then memoized in
//! the graph tables. Conditioning never touches these tables: it registers
//! posterior mirrors of the prior processes in a posterior graph, one per
//! observation bundle, whose kernels and means are delegated to the
//! observations.
use crate::cache::Cache;
use crate::errors::{GpError, Result};
use crate::input::{At, InputMap, Transform};
use crate::kernel::Kernel;
use crate::mean_models::Mean;
use crate::observations::{Obs, Observations, SparseObs};
use crate::parameters::{GraphParams, GraphValidParams};
use crate::random::Normal;
use crate::utils::{next_id, stack, stack1};
use gpgraph_spd::Spd;
use log::{debug, warn};
use ndarray::{s, array, Array1, Array2, Axis};
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Add, BitOr, Div, Mul, Neg, Sub};
use std::rc::{Rc, Weak};

/// How a process was obtained from the others of its graph
#[derive(Clone, Debug)]
enum Derivation {
    /// Own kernel and mean, independent of every other process
    Independent,
    /// `a + b`
    Sum(usize, usize),
    /// `a + m` for a deterministic mean
    AddMean(usize, Mean),
    /// `c a`
    Scale(usize, f64),
    /// `f a` for a deterministic function
    MulFunction(usize, Mean),
    /// `a(map(x))`
    Transform(usize, InputMap),
    /// derivative of `a` along a dimension
    Derivative(usize, usize),
    /// `a | obs` where `a` lives in the prior graph
    Posterior(usize),
}

impl Derivation {
    fn is_leaf(&self) -> bool {
        matches!(self, Derivation::Independent | Derivation::Posterior(_))
    }

    fn parents(&self) -> Vec<usize> {
        match self {
            Derivation::Independent | Derivation::Posterior(_) => vec![],
            Derivation::Sum(a, b) => vec![*a, *b],
            Derivation::AddMean(a, _)
            | Derivation::Scale(a, _)
            | Derivation::MulFunction(a, _)
            | Derivation::Transform(a, _)
            | Derivation::Derivative(a, _) => vec![*a],
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Left,
    Right,
}

struct PosteriorLink {
    prior: Graph,
    obs: Rc<dyn Observations>,
}

struct GraphState {
    id: usize,
    params: GraphValidParams,
    rng: Xoshiro256Plus,
    derivations: HashMap<usize, Derivation>,
    approximate: HashSet<usize>,
    kernels: HashMap<(usize, usize), Kernel>,
    means: HashMap<usize, Mean>,
    names: HashMap<usize, String>,
    by_name: HashMap<String, usize>,
    /// posterior graphs by observation id
    posteriors: HashMap<usize, Weak<RefCell<GraphState>>>,
    /// posterior mirrors by prior process id
    mirrors: HashMap<usize, usize>,
    prior: Option<PosteriorLink>,
}

impl GraphState {
    fn derivation(&self, id: usize) -> Result<Derivation> {
        self.derivations.get(&id).cloned().ok_or_else(|| {
            GpError::InvalidValueError(format!("process {id} is not registered in graph {}", self.id))
        })
    }
}

/// Shared handle on a registry of jointly distributed processes
#[derive(Clone)]
pub struct Graph(Rc<RefCell<GraphState>>);

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Graph#{}", self.id())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Graph) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Graph {
    /// Graph with default parameters
    pub fn new() -> Graph {
        Graph::with_params(GraphValidParams::default())
    }

    /// Parameters builder, to be checked and given to [`Graph::with_params`]
    pub fn params() -> GraphParams {
        GraphParams::new()
    }

    /// Graph with checked parameters
    pub fn with_params(params: GraphValidParams) -> Graph {
        let rng = match params.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        Graph(Rc::new(RefCell::new(GraphState {
            id: next_id(),
            params,
            rng,
            derivations: HashMap::new(),
            approximate: HashSet::new(),
            kernels: HashMap::new(),
            means: HashMap::new(),
            names: HashMap::new(),
            by_name: HashMap::new(),
            posteriors: HashMap::new(),
            mirrors: HashMap::new(),
            prior: None,
        })))
    }

    /// Stable handle id
    pub fn id(&self) -> usize {
        self.0.borrow().id
    }

    /// Parameters of the graph
    pub fn valid_params(&self) -> GraphValidParams {
        self.0.borrow().params.clone()
    }

    fn handle(&self, id: usize) -> GaussianProcess {
        GaussianProcess {
            graph: self.clone(),
            id,
        }
    }

    fn register(&self, derivation: Derivation, approximate: bool) -> GaussianProcess {
        let id = next_id();
        let mut state = self.0.borrow_mut();
        let approximate = approximate
            || derivation
                .parents()
                .iter()
                .any(|p| state.approximate.contains(p));
        if approximate {
            state.approximate.insert(id);
        }
        state.derivations.insert(id, derivation);
        drop(state);
        self.handle(id)
    }

    /// Registers an independent process with given kernel and mean
    pub fn gp(&self, kernel: Kernel, mean: Mean) -> GaussianProcess {
        let p = self.register(Derivation::Independent, false);
        let mut state = self.0.borrow_mut();
        state.kernels.insert((p.id, p.id), kernel);
        state.means.insert(p.id, mean);
        drop(state);
        debug!("graph {} registers {}", self.id(), p.id);
        p
    }

    /// Registers an independent process under a name unique in the graph
    pub fn gp_named(&self, kernel: Kernel, mean: Mean, name: &str) -> Result<GaussianProcess> {
        let holder = self.0.borrow().by_name.get(name).copied();
        if let Some(holder) = holder {
            return Err(GpError::DuplicateName(format!(
                "name `{name}` is already held by process {holder}"
            )));
        }
        let p = self.gp(kernel, mean);
        self.set_name(p.id, name)?;
        Ok(p)
    }

    fn check_member(&self, p: &GaussianProcess) -> Result<()> {
        if p.graph != *self {
            return Err(GpError::CrossGraph(format!(
                "process {} belongs to graph {}, not to graph {}",
                p.id,
                p.graph.id(),
                self.id()
            )));
        }
        Ok(())
    }

    /// `p + q`
    pub fn sum(&self, p: &GaussianProcess, q: &GaussianProcess) -> Result<GaussianProcess> {
        self.check_member(p)?;
        self.check_member(q)?;
        Ok(self.register(Derivation::Sum(p.id, q.id), false))
    }

    /// Product of a process with a scalar or a deterministic function
    pub fn mul(&self, p: &GaussianProcess, other: impl Into<Operand>) -> Result<GaussianProcess> {
        self.check_member(p)?;
        match other.into() {
            Operand::Scalar(c) => Ok(self.register(Derivation::Scale(p.id, c), false)),
            Operand::Function(f) => Ok(self.register(Derivation::MulFunction(p.id, f), false)),
            Operand::Process(q) => {
                self.check_member(&q)?;
                Err(GpError::TypeCompatibility(
                    "the product of two processes is not Gaussian, use `mul_approx`".into(),
                ))
            }
            Operand::Normal(_) => Err(GpError::TypeCompatibility(
                "cannot multiply a process by a Normal".into(),
            )),
        }
    }

    /// Linearised product `p m_q + q m_p - m_p m_q` of two processes, which
    /// matches the first two moments of the product of independent processes.
    /// The result and everything derived from it are flagged approximate.
    pub fn mul_approx(&self, p: &GaussianProcess, q: &GaussianProcess) -> Result<GaussianProcess> {
        self.check_member(p)?;
        self.check_member(q)?;
        let mp = self.mean_of(p.id)?;
        let mq = self.mean_of(q.id)?;
        let a = self.register(Derivation::MulFunction(p.id, mq.clone()), false);
        let b = self.register(Derivation::MulFunction(q.id, mp.clone()), false);
        let ab = self.register(Derivation::Sum(a.id, b.id), false);
        let offset = mp.mul(&mq).scale(-1.);
        Ok(self.register(Derivation::AddMean(ab.id, offset), true))
    }

    fn transformed(&self, p: &GaussianProcess, map: InputMap) -> GaussianProcess {
        self.register(Derivation::Transform(p.id, map), false)
    }

    /// Process named `name`, if any
    pub fn get(&self, name: &str) -> Option<GaussianProcess> {
        let id = self.0.borrow().by_name.get(name).copied();
        id.map(|id| self.handle(id))
    }

    fn set_name(&self, id: usize, name: &str) -> Result<()> {
        let mut state = self.0.borrow_mut();
        match state.by_name.get(name) {
            Some(&holder) if holder == id => return Ok(()),
            Some(&holder) => {
                return Err(GpError::DuplicateName(format!(
                    "name `{name}` is already held by process {holder}"
                )))
            }
            None => (),
        }
        if let Some(old) = state.names.remove(&id) {
            state.by_name.remove(&old);
        }
        state.names.insert(id, name.to_string());
        state.by_name.insert(name.to_string(), id);
        Ok(())
    }

    fn name_of(&self, id: usize) -> Option<String> {
        self.0.borrow().names.get(&id).cloned()
    }

    fn is_approximate(&self, id: usize) -> bool {
        self.0.borrow().approximate.contains(&id)
    }

    /// Kernel between two processes of the graph
    pub fn kernel(&self, p: &GaussianProcess, q: &GaussianProcess) -> Result<Kernel> {
        self.check_member(p)?;
        self.check_member(q)?;
        self.kernel_between(p.id, q.id)
    }

    /// Mean of a process of the graph
    pub fn mean(&self, p: &GaussianProcess) -> Result<Mean> {
        self.check_member(p)?;
        self.mean_of(p.id)
    }

    pub(crate) fn kernel_between(&self, i: usize, j: usize) -> Result<Kernel> {
        {
            let state = self.0.borrow();
            if let Some(k) = state.kernels.get(&(i, j)) {
                return Ok(k.clone());
            }
        }
        let reversed = self.0.borrow().kernels.get(&(j, i)).cloned();
        let k = match reversed {
            Some(k) => k.reverse(),
            None => self.expand_kernel(i, j)?,
        };
        Ok(self
            .0
            .borrow_mut()
            .kernels
            .entry((i, j))
            .or_insert(k)
            .clone())
    }

    fn expand_kernel(&self, i: usize, j: usize) -> Result<Kernel> {
        let (di, dj) = {
            let state = self.0.borrow();
            (state.derivation(i)?, state.derivation(j)?)
        };
        match (di.is_leaf(), dj.is_leaf()) {
            (false, false) if i >= j => self.expand_side(&di, j, Side::Left),
            (false, false) | (true, false) => self.expand_side(&dj, i, Side::Right),
            (false, true) => self.expand_side(&di, j, Side::Left),
            (true, true) => match (di, dj) {
                (Derivation::Posterior(a), Derivation::Posterior(b)) => {
                    let link = self.link()?;
                    link.obs
                        .posterior_kernel(&link.prior.handle(a), &link.prior.handle(b))
                }
                _ => Ok(Kernel::zero()),
            },
        }
    }

    fn expand_side(&self, d: &Derivation, other: usize, side: Side) -> Result<Kernel> {
        let child = |a: usize| match side {
            Side::Left => self.kernel_between(a, other),
            Side::Right => self.kernel_between(other, a),
        };
        let step = self.0.borrow().params.diff_step();
        let left = side == Side::Left;
        Ok(match d {
            Derivation::Sum(a, b) => Kernel::add(&child(*a)?, &child(*b)?),
            Derivation::AddMean(a, _) => child(*a)?,
            Derivation::Scale(a, c) => child(*a)?.scale(*c),
            Derivation::MulFunction(a, f) if left => child(*a)?.weight(Some(f.clone()), None),
            Derivation::MulFunction(a, f) => child(*a)?.weight(None, Some(f.clone())),
            Derivation::Transform(a, map) if left => {
                child(*a)?.transform_sides(map.clone(), InputMap::Identity)
            }
            Derivation::Transform(a, map) => {
                child(*a)?.transform_sides(InputMap::Identity, map.clone())
            }
            Derivation::Derivative(a, dim) if left => child(*a)?.diff_sides(Some(*dim), None, step),
            Derivation::Derivative(a, dim) => child(*a)?.diff_sides(None, Some(*dim), step),
            Derivation::Independent | Derivation::Posterior(_) => {
                return Err(GpError::InvalidValueError(
                    "leaf processes have no derivation to expand".into(),
                ))
            }
        })
    }

    pub(crate) fn mean_of(&self, i: usize) -> Result<Mean> {
        if let Some(m) = self.0.borrow().means.get(&i) {
            return Ok(m.clone());
        }
        let d = self.0.borrow().derivation(i)?;
        let step = self.0.borrow().params.diff_step();
        let m = match d {
            Derivation::Sum(a, b) => self.mean_of(a)?.add(&self.mean_of(b)?),
            Derivation::AddMean(a, m) => self.mean_of(a)?.add(&m),
            Derivation::Scale(a, c) => self.mean_of(a)?.scale(c),
            Derivation::MulFunction(a, f) => self.mean_of(a)?.mul(&f),
            Derivation::Transform(a, map) => self.mean_of(a)?.transform_map(map),
            Derivation::Derivative(a, dim) => self.mean_of(a)?.diff(dim, step),
            Derivation::Posterior(a) => {
                let link = self.link()?;
                link.obs.posterior_mean(&link.prior.handle(a))?
            }
            Derivation::Independent => {
                return Err(GpError::InvalidValueError(format!(
                    "independent process {i} has no mean"
                )))
            }
        };
        Ok(self
            .0
            .borrow_mut()
            .means
            .entry(i)
            .or_insert(m)
            .clone())
    }

    fn link(&self) -> Result<PosteriorLink> {
        let state = self.0.borrow();
        let link = state
            .prior
            .as_ref()
            .ok_or_else(|| GpError::InvalidValueError("graph is not a posterior graph".into()))?;
        Ok(PosteriorLink {
            prior: link.prior.clone(),
            obs: link.obs.clone(),
        })
    }

    /// Posterior graph of the observations, shared by every process
    /// conditioned on the same bundle
    fn posterior_graph(&self, obs: Rc<dyn Observations>) -> Result<Graph> {
        if *obs.graph() != *self {
            return Err(GpError::CrossGraph(format!(
                "observations of graph {} cannot condition graph {}",
                obs.graph().id(),
                self.id()
            )));
        }
        let existing = self
            .0
            .borrow()
            .posteriors
            .get(&obs.id())
            .and_then(|w| w.upgrade());
        if let Some(state) = existing {
            return Ok(Graph(state));
        }
        let posterior = Graph::with_params(self.valid_params());
        posterior.0.borrow_mut().prior = Some(PosteriorLink {
            prior: self.clone(),
            obs: obs.clone(),
        });
        let mut state = self.0.borrow_mut();
        state.posteriors.retain(|_, w| w.strong_count() > 0);
        state.posteriors.insert(obs.id(), Rc::downgrade(&posterior.0));
        drop(state);
        debug!("graph {} conditioned into graph {}", self.id(), posterior.id());
        Ok(posterior)
    }

    fn mirror(&self, p: &GaussianProcess) -> GaussianProcess {
        let existing = self.0.borrow().mirrors.get(&p.id).copied();
        if let Some(id) = existing {
            return self.handle(id);
        }
        let approximate = p.graph.is_approximate(p.id);
        let q = self.register(Derivation::Posterior(p.id), approximate);
        self.0.borrow_mut().mirrors.insert(p.id, q.id);
        q
    }

    /// Conditions jointly several processes of the graph, the posteriors
    /// living in the same posterior graph
    pub fn condition(
        &self,
        processes: &[&GaussianProcess],
        obs: &dyn Observations,
    ) -> Result<Vec<GaussianProcess>> {
        for p in processes {
            self.check_member(p)?;
        }
        let posterior = self.posterior_graph(obs.shared())?;
        Ok(processes.iter().map(|p| posterior.mirror(p)).collect())
    }

    fn check_blocks(&self, ats: &[At]) -> Result<()> {
        if ats.is_empty() {
            return Err(GpError::InvalidValueError("no process evaluation given".into()));
        }
        for at in ats {
            self.check_member(&at.process)?;
        }
        Ok(())
    }

    /// Mean of the concatenated evaluations
    pub(crate) fn joint_mean(&self, ats: &[At], cache: &Cache) -> Result<Array1<f64>> {
        self.check_blocks(ats)?;
        let blocks = ats
            .iter()
            .map(|at| self.mean_of(at.process.id)?.call(&at.x, cache))
            .collect::<Result<Vec<_>>>()?;
        stack1(&blocks)
    }

    /// Covariance of the concatenated evaluations, structured for a single block
    pub(crate) fn joint_var(&self, ats: &[At], cache: &Cache) -> Result<Spd<f64>> {
        self.check_blocks(ats)?;
        if let [at] = ats {
            let k = self.kernel_between(at.process.id, at.process.id)?;
            return k.structured(&at.x, cache);
        }
        let mut rows = Vec::with_capacity(ats.len());
        for a in ats {
            let row = ats
                .iter()
                .map(|b| self.kernel_between(a.process.id, b.process.id)?.call(&a.x, &b.x, cache))
                .collect::<Result<Vec<_>>>()?;
            rows.push(stack(Axis(1), &row)?);
        }
        Ok(Spd::dense(stack(Axis(0), &rows)?))
    }

    /// Joint distribution of several process evaluations
    pub fn joint(&self, ats: &[At]) -> Result<Normal> {
        let cache = Cache::new();
        let exact = ats.iter().all(|at| !self.is_approximate(at.process.id));
        let mean = self.joint_mean(ats, &cache)?;
        let var = self.joint_var(ats, &cache)?;
        Ok(Normal::new(mean, var)?.flagged(exact))
    }

    /// `num` joint samples of several process evaluations, one column per
    /// sample and one block per evaluation
    pub fn sample(&self, ats: &[At], num: usize) -> Result<Vec<Array2<f64>>> {
        let normal = self.joint(ats)?;
        let samples = {
            let mut state = self.0.borrow_mut();
            normal.sample(num, None, &mut state.rng)?
        };
        let mut start = 0;
        Ok(ats
            .iter()
            .map(|at| {
                let n = at.x.nrows();
                let block = samples.slice(s![start..start + n, ..]).to_owned();
                start += n;
                block
            })
            .collect())
    }
}

/// Right operand of process sums and products
pub enum Operand {
    /// Constant
    Scalar(f64),
    /// Deterministic function of the inputs
    Function(Mean),
    /// Process of a graph
    Process(GaussianProcess),
    /// Finite dimensional distribution, which does not combine with processes
    Normal(Normal),
}

impl From<f64> for Operand {
    fn from(c: f64) -> Operand {
        Operand::Scalar(c)
    }
}

impl From<Mean> for Operand {
    fn from(m: Mean) -> Operand {
        Operand::Function(m)
    }
}

impl From<GaussianProcess> for Operand {
    fn from(p: GaussianProcess) -> Operand {
        Operand::Process(p)
    }
}

impl From<&GaussianProcess> for Operand {
    fn from(p: &GaussianProcess) -> Operand {
        Operand::Process(p.clone())
    }
}

impl From<Normal> for Operand {
    fn from(d: Normal) -> Operand {
        Operand::Normal(d)
    }
}

/// Handle on a process registered in a [`Graph`]
#[derive(Clone)]
pub struct GaussianProcess {
    graph: Graph,
    id: usize,
}

impl fmt::Debug for GaussianProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GaussianProcess#{} of {:?}", self.id, self.graph)
    }
}

impl fmt::Display for GaussianProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = self.display(&|v| v).map_err(|_| fmt::Error)?;
        write!(f, "{s}")
    }
}

impl GaussianProcess {
    /// Stable handle id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Graph holding the process
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Kernel of the process
    pub fn kernel(&self) -> Result<Kernel> {
        self.graph.kernel_between(self.id, self.id)
    }

    /// Mean of the process
    pub fn mean(&self) -> Result<Mean> {
        self.graph.mean_of(self.id)
    }

    /// Whether the process derives from a linearised product
    pub fn is_approximate(&self) -> bool {
        self.graph.is_approximate(self.id)
    }

    /// `self + other`
    pub fn add(&self, other: impl Into<Operand>) -> Result<GaussianProcess> {
        match other.into() {
            Operand::Scalar(c) => Ok(self.add_mean(Mean::from(c))),
            Operand::Function(m) => Ok(self.add_mean(m)),
            Operand::Process(q) => self.graph.sum(self, &q),
            Operand::Normal(_) => Err(GpError::TypeCompatibility(
                "cannot add a Normal to a process".into(),
            )),
        }
    }

    fn add_mean(&self, m: Mean) -> GaussianProcess {
        self.graph.register(Derivation::AddMean(self.id, m), false)
    }

    /// `self - other`
    pub fn sub(&self, other: impl Into<Operand>) -> Result<GaussianProcess> {
        match other.into() {
            Operand::Scalar(c) => Ok(self.add_mean(Mean::from(-c))),
            Operand::Function(m) => Ok(self.add_mean(m.scale(-1.))),
            Operand::Process(q) => {
                self.graph.check_member(&q)?;
                self.graph.sum(self, &q.neg())
            }
            Operand::Normal(_) => Err(GpError::TypeCompatibility(
                "cannot subtract a Normal from a process".into(),
            )),
        }
    }

    /// `self * other` for a scalar or a deterministic function
    pub fn mul(&self, other: impl Into<Operand>) -> Result<GaussianProcess> {
        self.graph.mul(self, other)
    }

    /// See [`Graph::mul_approx`]
    pub fn mul_approx(&self, other: &GaussianProcess) -> Result<GaussianProcess> {
        self.graph.mul_approx(self, other)
    }

    /// `c self`
    pub fn scale(&self, c: f64) -> GaussianProcess {
        self.graph.register(Derivation::Scale(self.id, c), false)
    }

    /// `-self`
    pub fn neg(&self) -> GaussianProcess {
        self.scale(-1.)
    }

    /// `self / c`
    pub fn div(&self, c: f64) -> GaussianProcess {
        self.scale(1. / c)
    }

    /// `f(x - s)`
    pub fn shift(&self, s: f64) -> GaussianProcess {
        self.graph.transformed(self, InputMap::Shift(array![s]))
    }

    /// `f(x / s)`
    pub fn stretch(&self, s: f64) -> GaussianProcess {
        self.graph.transformed(self, InputMap::Stretch(array![s]))
    }

    /// `f(x / s)` with one factor per input dimension
    pub fn stretch_dims(&self, s: Array1<f64>) -> GaussianProcess {
        self.graph.transformed(self, InputMap::Stretch(s))
    }

    /// Process restricted to the input dimensions `dims`
    pub fn select(&self, dims: Vec<usize>) -> GaussianProcess {
        self.graph.transformed(self, InputMap::Select(dims))
    }

    /// `f(t(x))`
    pub fn transform(&self, t: Transform) -> GaussianProcess {
        self.graph.transformed(self, InputMap::Function(t))
    }

    /// Derivative along the input dimension `dim`, in closed form when the
    /// kernel has one and by central differences of the graph `diff_step` otherwise
    pub fn diff(&self, dim: usize) -> GaussianProcess {
        self.graph.register(Derivation::Derivative(self.id, dim), false)
    }

    /// Derivative of a process of one dimensional inputs, built from shifted
    /// copies `(f(x + eps) - f(x - eps)) / 2 eps`
    pub fn diff_approx(&self, eps: f64) -> Result<GaussianProcess> {
        let up = self.shift(-eps);
        let down = self.shift(eps);
        Ok(self.graph.sum(&up, &down.neg())?.div(2. * eps))
    }

    /// Binds the process to inputs given as rows
    pub fn at(&self, x: &Array2<f64>) -> At {
        At::new(self, x)
    }

    /// Finite dimensional distribution at inputs given as rows, built lazily
    pub fn eval(&self, x: &Array2<f64>) -> Result<Normal> {
        let kernel = self.kernel()?;
        let mean = self.mean()?;
        let exact = !self.is_approximate();
        if !exact {
            warn!(
                "process {} derives from a linearised product, its distribution is approximate",
                self.id
            );
        }
        let cache = Rc::new(Cache::new());
        let x = Rc::new(x.to_owned());
        let (vc, vx) = (cache.clone(), x.clone());
        let var = move || kernel.structured(&vx, &vc);
        let normal = if mean.is_zero() {
            Normal::lazy_centered(var)
        } else {
            Normal::lazy(move || mean.call(&x, &cache), var)
        };
        Ok(normal.flagged(exact))
    }

    /// Posterior process given observations
    pub fn condition(&self, obs: &dyn Observations) -> Result<GaussianProcess> {
        let mut posterior = self.graph.condition(&[self], obs)?;
        posterior
            .pop()
            .ok_or_else(|| GpError::InvalidValueError("no posterior process".into()))
    }

    /// Gives a unique name to the process, releasing its previous one
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.graph.set_name(self.id, name)
    }

    /// Name of the process, if any
    pub fn name(&self) -> Option<String> {
        self.graph.name_of(self.id)
    }

    /// `GP(kernel, mean)` with scalars formatted by `f`
    pub fn display(&self, f: &dyn Fn(f64) -> f64) -> Result<String> {
        Ok(format!(
            "GP({}, {})",
            self.kernel()?.display(f),
            self.mean()?.display(f)
        ))
    }

    /// Whether the kernel only depends on differences of inputs
    pub fn stationary(&self) -> Result<bool> {
        Ok(self.kernel()?.stationary())
    }

    /// Variance of the kernel
    pub fn var(&self) -> Result<f64> {
        Ok(self.kernel()?.var())
    }

    /// Length scale of the kernel
    pub fn length_scale(&self) -> Result<f64> {
        Ok(self.kernel()?.length_scale())
    }

    /// Period of the kernel
    pub fn period(&self) -> Result<f64> {
        Ok(self.kernel()?.period())
    }
}

impl Add<&GaussianProcess> for &GaussianProcess {
    type Output = Result<GaussianProcess>;
    fn add(self, rhs: &GaussianProcess) -> Result<GaussianProcess> {
        GaussianProcess::add(self, rhs)
    }
}

impl Sub<&GaussianProcess> for &GaussianProcess {
    type Output = Result<GaussianProcess>;
    fn sub(self, rhs: &GaussianProcess) -> Result<GaussianProcess> {
        GaussianProcess::sub(self, rhs)
    }
}

impl Add<f64> for &GaussianProcess {
    type Output = GaussianProcess;
    fn add(self, rhs: f64) -> GaussianProcess {
        self.add_mean(Mean::from(rhs))
    }
}

impl Add<&GaussianProcess> for f64 {
    type Output = GaussianProcess;
    fn add(self, rhs: &GaussianProcess) -> GaussianProcess {
        rhs + self
    }
}

impl Sub<f64> for &GaussianProcess {
    type Output = GaussianProcess;
    fn sub(self, rhs: f64) -> GaussianProcess {
        self + (-rhs)
    }
}

impl Sub<&GaussianProcess> for f64 {
    type Output = GaussianProcess;
    fn sub(self, rhs: &GaussianProcess) -> GaussianProcess {
        &rhs.neg() + self
    }
}

impl Mul<f64> for &GaussianProcess {
    type Output = GaussianProcess;
    fn mul(self, rhs: f64) -> GaussianProcess {
        self.scale(rhs)
    }
}

impl Mul<&GaussianProcess> for f64 {
    type Output = GaussianProcess;
    fn mul(self, rhs: &GaussianProcess) -> GaussianProcess {
        rhs.scale(self)
    }
}

impl Div<f64> for &GaussianProcess {
    type Output = GaussianProcess;
    fn div(self, rhs: f64) -> GaussianProcess {
        GaussianProcess::div(self, rhs)
    }
}

impl Neg for &GaussianProcess {
    type Output = GaussianProcess;
    fn neg(self) -> GaussianProcess {
        GaussianProcess::neg(self)
    }
}

impl BitOr<&Obs> for &GaussianProcess {
    type Output = Result<GaussianProcess>;
    fn bitor(self, rhs: &Obs) -> Result<GaussianProcess> {
        self.condition(rhs)
    }
}

impl BitOr<&SparseObs> for &GaussianProcess {
    type Output = Result<GaussianProcess>;
    fn bitor(self, rhs: &SparseObs) -> Result<GaussianProcess> {
        self.condition(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use approx::assert_abs_diff_eq;
    use linfa::ParamGuard;
    use ndarray::Array;

    fn eq() -> Kernel {
        Kernel::new(SquaredExponential)
    }

    fn inputs() -> Array2<f64> {
        Array::linspace(0., 3., 7).insert_axis(Axis(1))
    }

    fn seeded() -> Graph {
        Graph::with_params(Graph::params().seed(Some(42)).check().unwrap())
    }

    #[test]
    fn test_display() {
        let g = Graph::new();
        let p = g.gp(eq(), Mean::zero());
        assert_eq!(format!("{p}"), "GP(EQ(), 0)");
        let q = g.gp(eq(), Mean::one());
        assert_eq!(format!("{}", &q * 4.), "GP(16 * EQ(), 4 * 1)");
        assert_eq!(format!("{}", q.shift(1.)), "GP(EQ() shift 1, 1)");
        assert_eq!(format!("{}", q.stretch(2.)), "GP(EQ() > 2, 1)");
        assert_eq!(
            (&q * 2.).display(&|v| v.round()).unwrap(),
            "GP(4 * EQ(), 2 * 1)"
        );
        let s = (&p + &q).unwrap();
        assert_eq!(format!("{s}"), "GP(EQ() + EQ(), 1)");
    }

    #[test]
    fn test_properties() {
        let g = Graph::new();
        let p = g.gp(eq().stretch(2.) * 3., Mean::zero());
        assert!(p.stationary().unwrap());
        assert_abs_diff_eq!(p.var().unwrap(), 3.);
        assert_abs_diff_eq!(p.length_scale().unwrap(), 2.);
        assert_eq!(p.period().unwrap(), f64::INFINITY);
        let q = p.stretch(2.);
        assert_abs_diff_eq!(q.length_scale().unwrap(), 4.);
        let lin = g.gp(Kernel::new(Linear), Mean::zero());
        assert!(!lin.stationary().unwrap());
    }

    #[test]
    fn test_cross_covariances_propagate() {
        let g = Graph::new();
        let x = inputs();
        let p1 = g.gp(eq(), Mean::zero());
        let p2 = g.gp(Kernel::new(Matern52), Mean::zero());
        let s = (&p1 + &p2).unwrap();
        let k1 = p1.kernel().unwrap().matrix(&x, &x).unwrap();
        assert_abs_diff_eq!(
            g.kernel(&s, &p1).unwrap().matrix(&x, &x).unwrap(),
            k1,
            epsilon = 1e-12
        );
        assert!(g.kernel(&p1, &p2).unwrap().is_zero());
        let shifted = p1.shift(1.);
        let cross = g.kernel(&shifted, &p1).unwrap();
        assert_abs_diff_eq!(
            cross.matrix(&x, &x).unwrap(),
            p1.kernel().unwrap().matrix(&(&x - 1.), &x).unwrap(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            g.kernel(&p1, &shifted).unwrap().matrix(&x, &x).unwrap(),
            cross.matrix(&x, &x).unwrap().t().to_owned(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_additive_conditioning() {
        let g = seeded();
        let x = inputs();
        let m2 = Mean::function("sin", |x: &Array2<f64>| x.column(0).mapv(f64::sin));
        let p1 = g.gp(eq(), Mean::zero());
        let p2 = g.gp(eq().stretch(2.), m2.clone());
        let s = (&p1 + &p2).unwrap();
        let y1 = g.sample(&[p1.at(&x)], 1).unwrap().remove(0).column(0).to_owned();
        let obs = Obs::new(vec![(p1.at(&x), y1.clone())]).unwrap();
        let post = (&s | &obs).unwrap();
        let mean = post.eval(&x).unwrap().mean().unwrap().to_owned();
        assert_abs_diff_eq!(mean, &y1 + &m2.vector(&x).unwrap(), epsilon = 1e-6);
    }

    #[test]
    fn test_self_sum_scaling() {
        let g = seeded();
        let x = inputs();
        let p = g.gp(eq(), Mean::zero());
        let mut s = p.clone();
        for _ in 0..4 {
            s = (&s + &p).unwrap();
        }
        assert_eq!(format!("{}", s.kernel().unwrap()), "25 * EQ()");
        let prior = s.eval(&x).unwrap();
        let base = p.eval(&x).unwrap();
        assert_abs_diff_eq!(
            prior.var().unwrap().mat(),
            base.var().unwrap().mat() * 25.,
            epsilon = 1e-10
        );
        let y = g.sample(&[p.at(&x)], 1).unwrap().remove(0).column(0).to_owned();
        let post = s.condition(&Obs::new(vec![(p.at(&x), y.clone())]).unwrap()).unwrap();
        let d = post.eval(&x).unwrap();
        assert_abs_diff_eq!(d.mean().unwrap(), &(&y * 5.), epsilon = 1e-6);
    }

    #[test]
    fn test_reflection() {
        let g = seeded();
        let x = inputs();
        let p = g.gp(eq(), Mean::zero());
        let p2 = 5. - &p;
        let y = g.sample(&[p.at(&x)], 1).unwrap().remove(0).column(0).to_owned();
        let obs = Obs::new(vec![(p.at(&x), y.clone())]).unwrap();
        let post = p2.condition(&obs).unwrap();
        let d = post.eval(&x).unwrap();
        assert_abs_diff_eq!(d.mean().unwrap(), &(5. - &y), epsilon = 1e-6);
        let var = d.var().unwrap().mat();
        assert_abs_diff_eq!(var, Array2::zeros((7, 7)), epsilon = 1e-6);
    }

    #[test]
    fn test_naming() {
        let g = Graph::new();
        let p = g.gp(eq(), Mean::zero());
        let q = g.gp(eq(), Mean::zero());
        p.set_name("a").unwrap();
        assert_eq!(p.name().unwrap(), "a");
        assert_eq!(g.get("a").unwrap().id(), p.id());
        assert!(matches!(q.set_name("a"), Err(GpError::DuplicateName(_))));
        p.set_name("a").unwrap();
        p.set_name("b").unwrap();
        assert!(g.get("a").is_none());
        q.set_name("a").unwrap();
        assert_eq!(g.get("a").unwrap().id(), q.id());
        assert_eq!(g.get("b").unwrap().id(), p.id());
        assert_eq!(q.name().unwrap(), "a");
    }

    #[test]
    fn test_incompatible_operands() {
        let g1 = Graph::new();
        let g2 = Graph::new();
        let p = g1.gp(eq(), Mean::zero());
        let q = g2.gp(eq(), Mean::zero());
        assert!(matches!(&p + &q, Err(GpError::CrossGraph(_))));
        assert!(matches!(p.mul(&q), Err(GpError::CrossGraph(_))));
        let r = g1.gp(eq(), Mean::zero());
        assert!(matches!(p.mul(&r), Err(GpError::TypeCompatibility(_))));
        let d = Normal::centered(Spd::eye(2));
        match p.add(d) {
            Err(GpError::TypeCompatibility(msg)) => assert!(msg.contains("Normal")),
            other => panic!("unexpected {other:?}"),
        }
        let obs = Obs::new(vec![(q.at(&inputs()), Array1::zeros(7))]).unwrap();
        assert!(matches!(&p | &obs, Err(GpError::CrossGraph(_))));
    }

    #[test]
    fn test_multiple_and_sequential_conditioning() {
        let g = seeded();
        let x1 = array![[0.], [1.]];
        let x2 = array![[2.], [3.]];
        let p1 = g.gp(eq(), Mean::zero());
        let p2 = g.gp(eq(), Mean::zero());
        let s = (&p1 + &p2).unwrap();
        let (y1, y2) = (array![1., -1.], array![0.5, 2.]);

        let joint = Obs::new(vec![(p1.at(&x1), y1.clone()), (s.at(&x2), y2.clone())]).unwrap();
        let post = g.condition(&[&p1, &s], &joint).unwrap();
        assert_eq!(post[0].graph(), post[1].graph());
        let (d1, d2) = (post[0].eval(&x1).unwrap(), post[1].eval(&x2).unwrap());
        assert_abs_diff_eq!(d1.mean().unwrap(), &y1, epsilon = 1e-6);
        assert_abs_diff_eq!(d2.mean().unwrap(), &y2, epsilon = 1e-6);

        // one observation bundle at a time
        let first = Obs::new(vec![(p1.at(&x1), y1.clone())]).unwrap();
        let post1 = g.condition(&[&p1, &s], &first).unwrap();
        let second = Obs::new(vec![(post1[1].at(&x2), y2.clone())]).unwrap();
        let p1_2 = post1[0].condition(&second).unwrap();
        let s_2 = post1[1].condition(&second).unwrap();
        let x = array![[0.5], [1.5], [2.5]];
        let (sequential, joint) = (p1_2.eval(&x).unwrap(), post[0].eval(&x).unwrap());
        assert_abs_diff_eq!(sequential.mean().unwrap(), joint.mean().unwrap(), epsilon = 1e-6);
        assert_abs_diff_eq!(
            s_2.eval(&x).unwrap().var().unwrap().mat(),
            post[1].eval(&x).unwrap().var().unwrap().mat(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_posterior_graph_is_shared() {
        let g = Graph::new();
        let x = inputs();
        let p = g.gp(eq(), Mean::zero());
        let q = (&p * 2.).shift(0.5);
        let obs = Obs::new(vec![(p.at(&x), x.column(0).to_owned())]).unwrap();
        let pp = (&p | &obs).unwrap();
        let qp = (&q | &obs).unwrap();
        assert_eq!(pp.graph(), qp.graph());
        assert_eq!((&p | &obs).unwrap().id(), pp.id());
        assert!((&pp + &qp).is_ok());
    }

    #[test]
    fn test_derivative() {
        let g = Graph::new();
        let p = g.gp(Kernel::new(Linear), Mean::zero());
        let obs = Obs::new(vec![(p.at(&array![[1.]]), array![2.])]).unwrap();
        let dp = (&p.diff(0) | &obs).unwrap();
        let x = array![[-1.], [0.5], [3.]];
        let d = dp.eval(&x).unwrap();
        assert_abs_diff_eq!(d.mean().unwrap(), &array![2., 2., 2.], epsilon = 1e-6);
        assert_abs_diff_eq!(d.var().unwrap().mat(), Array2::zeros((3, 3)), epsilon = 1e-6);

        let q = g.gp(eq(), Mean::zero());
        let x = inputs();
        let exact = q.diff(0).kernel().unwrap().matrix(&x, &x).unwrap();
        let approx = q.diff_approx(1e-4).unwrap().kernel().unwrap().matrix(&x, &x).unwrap();
        assert_abs_diff_eq!(exact, approx, epsilon = 1e-6);
    }

    #[test]
    fn test_derivative_observations() {
        let g = Graph::new();
        let p = g.gp(eq(), Mean::zero());
        let dp = p.diff(0);
        let x = Array::linspace(0., 1., 6).insert_axis(Axis(1));
        let slope = x.column(0).mapv(|v| 2. * v);

        // the derivative of a line
        let obs = Obs::new(vec![(p.at(&x), slope.clone())]).unwrap();
        let d = (&dp | &obs).unwrap().eval(&x).unwrap();
        assert_abs_diff_eq!(d.mean().unwrap(), &Array1::from_elem(6, 2.), epsilon = 1e-2);

        // a parabola recovered from its derivative and its value at zero
        let obs = Obs::new(vec![
            (p.at(&array![[0.]]), array![0.]),
            (dp.at(&x), slope.clone()),
        ])
        .unwrap();
        let d = (&p | &obs).unwrap().eval(&x).unwrap();
        assert_abs_diff_eq!(d.mean().unwrap(), &x.column(0).mapv(|v| v * v), epsilon = 1e-3);
        assert!(d.var().unwrap().diag().iter().all(|&v| v > -1e-8));
    }

    #[test]
    fn test_transformed_conditioning() {
        let g = seeded();
        let p = g.gp(eq(), Mean::zero());
        let x = Array::linspace(0., 10., 5).insert_axis(Axis(1));
        // observes p2 at x then recovers the values from p at to_p, and back
        let recovers = |p2: &GaussianProcess,
                        to_p: &Array2<f64>,
                        x: &Array2<f64>,
                        to_p2: &Array2<f64>| {
            let y = g.sample(&[p2.at(x)], 1).unwrap().remove(0).column(0).to_owned();
            let d = (&p | &Obs::new(vec![(p2.at(x), y.clone())]).unwrap())
                .unwrap()
                .eval(to_p)
                .unwrap();
            assert_abs_diff_eq!(d.mean().unwrap(), &y, epsilon = 1e-6);
            assert_abs_diff_eq!(
                d.var().unwrap().mat(),
                Array2::<f64>::zeros((5, 5)),
                epsilon = 1e-6
            );
            let y = g.sample(&[p.at(to_p)], 1).unwrap().remove(0).column(0).to_owned();
            let d = (p2 | &Obs::new(vec![(p.at(to_p), y.clone())]).unwrap())
                .unwrap()
                .eval(to_p2)
                .unwrap();
            assert_abs_diff_eq!(d.mean().unwrap(), &y, epsilon = 1e-6);
        };
        // p2(x) = p(x - 5)
        recovers(&p.shift(5.), &(&x - 5.), &x, &x);
        // p2(x) = p(x / 5)
        recovers(&p.stretch(5.), &(&x / 5.), &x, &x);
        let div = Transform::new("div5", |x: &Array2<f64>| x / 5.);
        recovers(&p.transform(div), &(&x / 5.), &x, &x);
        let x2 = Array2::from_shape_fn((5, 2), |(i, j)| {
            if j == 0 {
                x[[i, 0]]
            } else {
                (i as f64).cos()
            }
        });
        recovers(&p.select(vec![0]), &x, &x2, &x2);
    }

    #[test]
    fn test_conditioning_order_does_not_matter() {
        let g = seeded();
        let p1 = g.gp(eq(), Mean::zero());
        let p2 = g.gp(Kernel::new(AbsoluteExponential).stretch(2.) * 2., Mean::zero());
        let p3 = g.gp(
            Kernel::new(RationalQuadratic::new(0.1).unwrap()).stretch(0.5) * 0.5,
            Mean::zero(),
        );
        let p = (&(&p1 + &p2).unwrap() + &p3).unwrap();
        let xs = [
            Array::linspace(0., 2., 3).insert_axis(Axis(1)),
            Array::linspace(3., 5., 3).insert_axis(Axis(1)),
            Array::linspace(6., 8., 3).insert_axis(Axis(1)),
        ];
        let ats = xs.iter().map(|x| p.at(x)).collect::<Vec<_>>();
        let ys = g
            .sample(&ats, 1)
            .unwrap()
            .into_iter()
            .map(|y| y.column(0).to_owned())
            .collect::<Vec<_>>();

        let mut sequential = p.clone();
        for (x, y) in xs.iter().zip(ys.iter()) {
            let obs = Obs::new(vec![(sequential.at(x), y.clone())]).unwrap();
            sequential = (&sequential | &obs).unwrap();
        }
        let pairs = xs
            .iter()
            .zip(ys.iter())
            .map(|(x, y)| (p.at(x), y.clone()))
            .collect::<Vec<_>>();
        let forward = (&p | &Obs::new(pairs.clone()).unwrap()).unwrap();
        let backward = (&p | &Obs::new(pairs.into_iter().rev().collect()).unwrap()).unwrap();

        let x = Array::linspace(-1., 9., 11).insert_axis(Axis(1));
        let reference = forward.eval(&x).unwrap();
        for other in [&sequential, &backward] {
            let d = other.eval(&x).unwrap();
            assert_abs_diff_eq!(d.mean().unwrap(), reference.mean().unwrap(), epsilon = 1e-6);
            assert_abs_diff_eq!(
                d.var().unwrap().mat(),
                reference.var().unwrap().mat(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_bayesian_linear_regression() {
        let g = seeded();
        let slope = g.gp(Kernel::one(), Mean::zero());
        let intercept = g.gp(Kernel::one(), Mean::zero());
        let identity = Mean::function("x", |x: &Array2<f64>| x.column(0).to_owned());
        let f = (&slope.mul(identity).unwrap() + &intercept).unwrap();
        let noise = g.gp(Kernel::new(Delta) * 1e-4, Mean::zero());
        let y = (&f + &noise).unwrap();

        let x = Array::linspace(0., 10., 100).insert_axis(Axis(1));
        let zero = array![[0.]];
        let samples = g
            .sample(&[y.at(&x), slope.at(&zero), intercept.at(&zero)], 1)
            .unwrap();
        let obs = Obs::new(vec![(y.at(&x), samples[0].column(0).to_owned())]).unwrap();
        let post = g.condition(&[&slope, &intercept], &obs).unwrap();
        for (p, truth) in post.iter().zip(samples[1..].iter()) {
            let d = p.eval(&zero).unwrap();
            assert_abs_diff_eq!(d.mean().unwrap()[0], truth[[0, 0]], epsilon = 5e-2);
        }
    }

    #[test]
    fn test_released_posterior_graphs_are_forgotten() {
        let g = Graph::new();
        let p = g.gp(eq(), Mean::zero());
        let x = inputs();
        let kept_obs = Obs::new(vec![(p.at(&x), Array1::zeros(7))]).unwrap();
        let kept = (&p | &kept_obs).unwrap();
        for i in 0..3 {
            let obs = Obs::new(vec![(p.at(&x), Array1::from_elem(7, i as f64))]).unwrap();
            let _post = (&p | &obs).unwrap();
        }
        let obs = Obs::new(vec![(p.at(&x), Array1::ones(7))]).unwrap();
        let _post = (&p | &obs).unwrap();
        assert_eq!(g.0.borrow().posteriors.len(), 2);
        assert_eq!((&p | &kept_obs).unwrap().graph(), kept.graph());
    }

    #[test]
    fn test_gp_named() {
        let g = Graph::new();
        let f = g.gp_named(eq(), Mean::zero(), "f").unwrap();
        assert_eq!(f.name().unwrap(), "f");
        assert_eq!(g.get("f").unwrap().id(), f.id());
        assert!(matches!(
            g.gp_named(eq(), Mean::one(), "f"),
            Err(GpError::DuplicateName(_))
        ));
        assert_eq!(g.get("f").unwrap().id(), f.id());
    }

    #[test]
    fn test_joint_sample() {
        let g = seeded();
        let x = inputs();
        let p = g.gp(eq(), Mean::function("x", |x: &Array2<f64>| x.column(0).to_owned()));
        let q = (&p * 2.).shift(-0.5);
        let samples = g.sample(&[p.at(&x), q.at(&(&x - 0.5))], 3).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].dim(), (7, 3));
        // q(x - 0.5) = 2 p(x) for every draw
        assert_abs_diff_eq!(samples[1], &samples[0] * 2., epsilon = 1e-4);
    }

    #[test]
    fn test_approximate_product() {
        let g = Graph::new();
        let x = inputs();
        let p = g.gp(eq(), Mean::one());
        let q = g.gp(eq().stretch(2.), Mean::from(2.));
        let r = p.mul_approx(&q).unwrap();
        assert!(r.is_approximate());
        assert!((&r + 1.).is_approximate());
        let d = r.eval(&x).unwrap();
        assert!(!d.is_exact());
        assert_abs_diff_eq!(d.mean().unwrap(), &Array1::from_elem(7, 2.), epsilon = 1e-12);
        assert_abs_diff_eq!(
            d.var().unwrap().diag(),
            Array1::from_elem(7, 5.),
            epsilon = 1e-12
        );
        assert!(p.eval(&x).unwrap().is_exact());
    }
}
