//! Observations conditioning the processes of a graph.
//!
//! [`Obs`] performs exact Gaussian conditioning on noiseless evaluations of
//! one or several processes. [`SparseObs`] performs the variational
//! conditioning of Titsias on evaluations corrupted by independent noise,
//! through a set of inducing evaluations, and exposes the evidence lower
//! bound of the observations.
//!
//! Both are cheap handles: the factorizations are computed once, on first
//! use, and shared by every posterior process.
use crate::cache::Cache;
use crate::errors::{GpError, Result};
use crate::graph::{GaussianProcess, Graph};
use crate::input::At;
use crate::kernel::{check_elwise, CovarianceModel, Kernel};
use crate::mean_models::{Mean, MeanModel};
use crate::utils::{next_id, stack, stack1};
use gpgraph_spd::{Spd, Structure};
use log::debug;
use ndarray::{Array1, Array2, Axis};
use std::any::Any;
use std::cell::OnceCell;
use std::f64::consts::PI;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// Observations which can condition the processes of their graph
pub trait Observations {
    /// Stable handle id
    fn id(&self) -> usize;

    /// Graph of the observed processes
    fn graph(&self) -> &Graph;

    /// Posterior kernel between two processes of the observed graph
    fn posterior_kernel(&self, a: &GaussianProcess, b: &GaussianProcess) -> Result<Kernel>;

    /// Posterior mean of a process of the observed graph
    fn posterior_mean(&self, a: &GaussianProcess) -> Result<Mean>;

    /// Shared handle on the observations
    fn shared(&self) -> Rc<dyn Observations>;
}

/// Inputs of an observation: a process binding, or raw inputs of a
/// reference process
#[derive(Clone, Debug)]
pub enum ObsInput {
    /// Inputs bound to a process
    At(At),
    /// Inputs of the reference process
    Raw(Array2<f64>),
}

impl From<At> for ObsInput {
    fn from(at: At) -> ObsInput {
        ObsInput::At(at)
    }
}

impl From<Array2<f64>> for ObsInput {
    fn from(x: Array2<f64>) -> ObsInput {
        ObsInput::Raw(x)
    }
}

/// Checks observed pairs and returns their common graph
fn check_pairs(
    pairs: Vec<(ObsInput, Array1<f64>)>,
    reference: Option<&GaussianProcess>,
) -> Result<(Graph, Vec<At>, Array1<f64>)> {
    if pairs.is_empty() {
        return Err(GpError::MalformedObservation("no observation given".into()));
    }
    let mut ats = Vec::with_capacity(pairs.len());
    let mut ys = Vec::with_capacity(pairs.len());
    for (input, y) in pairs {
        let at = match (input, reference) {
            (ObsInput::At(at), _) => at,
            (ObsInput::Raw(x), Some(p)) => p.at(&x),
            (ObsInput::Raw(_), None) => {
                return Err(GpError::MalformedObservation(
                    "raw inputs need a reference process".into(),
                ))
            }
        };
        if at.x.nrows() != y.len() {
            return Err(GpError::MalformedObservation(format!(
                "{} inputs observed with {} values",
                at.x.nrows(),
                y.len()
            )));
        }
        ats.push(at);
        ys.push(y);
    }
    let graph = ats[0].process().graph().clone();
    if let Some(at) = ats.iter().find(|at| *at.process().graph() != graph) {
        return Err(GpError::CrossGraph(format!(
            "observed processes of graphs {} and {}",
            graph.id(),
            at.process().graph().id()
        )));
    }
    Ok((graph, ats, stack1(&ys)?))
}

struct ObsInner {
    id: usize,
    graph: Graph,
    ats: Vec<At>,
    y: Array1<f64>,
    nugget: f64,
    cache: Cache,
    k_x: OnceCell<Spd<f64>>,
    alpha: OnceCell<Array1<f64>>,
}

/// Exact observations of one or several processes at finite inputs
#[derive(Clone)]
pub struct Obs(Rc<ObsInner>);

impl fmt::Debug for Obs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Obs#{} of {} values", self.0.id, self.0.y.len())
    }
}

impl Obs {
    /// Observations of process evaluations
    pub fn new(pairs: Vec<(At, Array1<f64>)>) -> Result<Obs> {
        Obs::from_inputs(
            pairs.into_iter().map(|(at, y)| (ObsInput::At(at), y)).collect(),
            None,
        )
    }

    /// Observations of `reference` at raw inputs `x`
    pub fn with_ref(reference: &GaussianProcess, x: &Array2<f64>, y: Array1<f64>) -> Result<Obs> {
        Obs::from_inputs(vec![(ObsInput::Raw(x.to_owned()), y)], Some(reference))
    }

    /// Observations where raw inputs refer to `reference`
    pub fn from_inputs(
        pairs: Vec<(ObsInput, Array1<f64>)>,
        reference: Option<&GaussianProcess>,
    ) -> Result<Obs> {
        let (graph, ats, y) = check_pairs(pairs, reference)?;
        let nugget = graph.valid_params().nugget();
        Ok(Obs(Rc::new(ObsInner {
            id: next_id(),
            graph,
            ats,
            y,
            nugget,
            cache: Cache::new(),
            k_x: OnceCell::new(),
            alpha: OnceCell::new(),
        })))
    }

    /// Observed values, concatenated
    pub fn y(&self) -> &Array1<f64> {
        &self.0.y
    }

    /// Observed process evaluations
    pub fn ats(&self) -> &[At] {
        &self.0.ats
    }

    /// Regularized joint covariance of the observed evaluations
    pub fn k_x(&self) -> Result<&Spd<f64>> {
        if let Some(k) = self.0.k_x.get() {
            return Ok(k);
        }
        let start = Instant::now();
        let k = self
            .0
            .graph
            .joint_var(&self.0.ats, &self.0.cache)?
            .regularize(self.0.nugget);
        // factorize once for every posterior evaluation
        k.cholesky()?;
        debug!(
            "obs {} factorized {} x {} {} covariance in {:?}",
            self.0.id,
            k.dim(),
            k.dim(),
            k.structure(),
            start.elapsed()
        );
        Ok(self.0.k_x.get_or_init(|| k))
    }

    /// `K_x⁻¹ (y - m_x)`
    fn alpha(&self) -> Result<&Array1<f64>> {
        if let Some(a) = self.0.alpha.get() {
            return Ok(a);
        }
        let residual = &self.0.y - &self.0.graph.joint_mean(&self.0.ats, &self.0.cache)?;
        let alpha = self
            .k_x()?
            .inv_prod(&residual.insert_axis(Axis(1)))?
            .column(0)
            .to_owned();
        Ok(self.0.alpha.get_or_init(|| alpha))
    }

    /// Covariances between the observed evaluations and `x` through the
    /// given kernels, one per observed block
    fn cross(&self, kernels: &[Kernel], x: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        let blocks = kernels
            .iter()
            .zip(self.0.ats.iter())
            .map(|(k, at)| k.call(&at.x, x, cache))
            .collect::<Result<Vec<_>>>()?;
        stack(Axis(0), &blocks)
    }

    fn kernels_to(&self, p: &GaussianProcess) -> Result<Vec<Kernel>> {
        self.0
            .ats
            .iter()
            .map(|at| self.0.graph.kernel(at.process(), p))
            .collect()
    }
}

impl Observations for Obs {
    fn id(&self) -> usize {
        self.0.id
    }

    fn graph(&self) -> &Graph {
        &self.0.graph
    }

    fn posterior_kernel(&self, a: &GaussianProcess, b: &GaussianProcess) -> Result<Kernel> {
        Ok(Kernel::new(PosteriorKernel {
            k_ab: self.0.graph.kernel(a, b)?,
            k_xa: self.kernels_to(a)?,
            k_xb: self.kernels_to(b)?,
            symmetric: a.id() == b.id(),
            obs: self.clone(),
        }))
    }

    fn posterior_mean(&self, a: &GaussianProcess) -> Result<Mean> {
        Ok(Mean::new(PosteriorMean {
            m_a: self.0.graph.mean(a)?,
            k_xa: self.kernels_to(a)?,
            obs: self.clone(),
        }))
    }

    fn shared(&self) -> Rc<dyn Observations> {
        Rc::new(self.clone())
    }
}

/// `k_ab(x, y) - k_aX(x) K⁻¹ k_Xb(y)`
#[derive(Debug)]
struct PosteriorKernel {
    k_ab: Kernel,
    k_xa: Vec<Kernel>,
    k_xb: Vec<Kernel>,
    symmetric: bool,
    obs: Obs,
}

impl CovarianceModel for PosteriorKernel {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        let a = self.obs.cross(&self.k_xa, x, cache)?;
        let b = self.obs.cross(&self.k_xb, y, cache)?;
        let reduction = self.obs.k_x()?.quadratic_form_between(&a, &b)?;
        Ok(self.k_ab.call(x, y, cache)? - reduction)
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        let a = self.obs.cross(&self.k_xa, x, cache)?;
        let b = self.obs.cross(&self.k_xb, y, cache)?;
        let reduction = self.obs.k_x()?.quadratic_form_diag_between(&a, &b)?;
        Ok(self.k_ab.elwise(x, y, cache)? - reduction)
    }

    fn symmetric(&self) -> bool {
        self.symmetric
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("Posterior({})", self.k_ab.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `m_a(x) + k_aX(x) K⁻¹ (y - m_X)`
#[derive(Debug)]
struct PosteriorMean {
    m_a: Mean,
    k_xa: Vec<Kernel>,
    obs: Obs,
}

impl MeanModel for PosteriorMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        let a = self.obs.cross(&self.k_xa, x, cache)?;
        Ok(self.m_a.call(x, cache)? + a.t().dot(self.obs.alpha()?))
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("Posterior({})", self.m_a.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factorizations shared by the sparse posterior kernels and means
struct SparseState {
    /// `K_zz` plus nugget, factorized
    k_z: Spd<f64>,
    /// `I + V Σ⁻¹ Vᵗ`, factorized
    b: Spd<f64>,
    /// `L_z⁻¹ K_zx`
    v: Array2<f64>,
    /// `L_B⁻¹ V Σ⁻¹ r`
    c: Array1<f64>,
    /// `Σ⁻¹ r`
    sigma_r: Array1<f64>,
    /// `y - m_x - m_e(x)`
    r: Array1<f64>,
}

struct SparseInner {
    id: usize,
    graph: Graph,
    u: At,
    noise: GaussianProcess,
    ats: Vec<At>,
    y: Array1<f64>,
    sigma: Spd<f64>,
    nugget: f64,
    cache: Cache,
    state: OnceCell<SparseState>,
}

/// Observations of processes corrupted by independent noise, conditioning
/// through the inducing evaluation `u`
#[derive(Clone)]
pub struct SparseObs(Rc<SparseInner>);

impl fmt::Debug for SparseObs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SparseObs#{} of {} values through {} inducing inputs",
            self.0.id,
            self.0.y.len(),
            self.0.u.x.nrows()
        )
    }
}

impl SparseObs {
    /// Observations `y = f(x) + e(x)` of the evaluations `pairs`, `e` being the
    /// `noise` process, conditioned through the inducing evaluation `u`.
    ///
    /// The noise covariance at the observed inputs must be diagonal.
    pub fn new(u: At, noise: &GaussianProcess, pairs: Vec<(At, Array1<f64>)>) -> Result<SparseObs> {
        let (graph, ats, y) = check_pairs(
            pairs.into_iter().map(|(at, y)| (ObsInput::At(at), y)).collect(),
            None,
        )?;
        for p in [u.process(), noise] {
            if *p.graph() != graph {
                return Err(GpError::CrossGraph(format!(
                    "process {} is not in the observed graph {}",
                    p.id(),
                    graph.id()
                )));
            }
        }
        let cache = Cache::new();
        let x = SparseObs::inputs(&ats)?;
        let sigma = noise.kernel()?.structured(&x, &cache)?;
        if !matches!(
            sigma.structure(),
            Structure::Diagonal | Structure::UniformDiagonal
        ) {
            return Err(GpError::MalformedObservation(format!(
                "sparse conditioning needs a diagonal noise covariance, got a {} one",
                sigma.structure()
            )));
        }
        let nugget = graph.valid_params().nugget();
        Ok(SparseObs(Rc::new(SparseInner {
            id: next_id(),
            graph,
            u,
            noise: noise.clone(),
            ats,
            y,
            sigma,
            nugget,
            cache,
            state: OnceCell::new(),
        })))
    }

    fn inputs(ats: &[At]) -> Result<Array2<f64>> {
        let xs: Vec<_> = ats.iter().map(|at| at.x.clone()).collect();
        stack(Axis(0), &xs)
    }

    /// Observed values, concatenated
    pub fn y(&self) -> &Array1<f64> {
        &self.0.y
    }

    fn state(&self) -> Result<&SparseState> {
        if let Some(s) = self.0.state.get() {
            return Ok(s);
        }
        let start = Instant::now();
        let inner = &self.0;
        let cache = &inner.cache;
        let z = &inner.u.x;
        let k_z = inner
            .graph
            .kernel(inner.u.process(), inner.u.process())?
            .structured(z, cache)?
            .regularize(inner.nugget);
        let k_zx = inner
            .ats
            .iter()
            .map(|at| inner.graph.kernel(inner.u.process(), at.process())?.call(z, &at.x, cache))
            .collect::<Result<Vec<_>>>()?;
        let v = k_z.cholesky_solve(&stack(Axis(1), &k_zx)?)?;
        let sigma_vt = inner.sigma.inv_prod(&v.t())?;
        let b = Spd::dense(Array2::eye(v.nrows()) + v.dot(&sigma_vt));

        let x = SparseObs::inputs(&inner.ats)?;
        let noise_mean = inner.noise.mean()?.call(&x, cache)?;
        let r = &inner.y - &inner.graph.joint_mean(&inner.ats, cache)? - noise_mean;
        let sigma_r = inner
            .sigma
            .inv_prod(&r.clone().insert_axis(Axis(1)))?
            .column(0)
            .to_owned();
        let c = b
            .cholesky_solve(&v.dot(&sigma_r).insert_axis(Axis(1)))?
            .column(0)
            .to_owned();
        debug!(
            "sparse obs {} factorized {} inducing inputs against {} observations in {:?}",
            inner.id,
            z.nrows(),
            r.len(),
            start.elapsed()
        );
        Ok(self.0.state.get_or_init(|| SparseState {
            k_z,
            b,
            v,
            c,
            sigma_r,
            r,
        }))
    }

    /// Evidence lower bound of the observations
    pub fn elbo(&self) -> Result<f64> {
        let state = self.state()?;
        let inner = &self.0;
        let n = state.r.len() as f64;
        let fit = -0.5
            * (n * (2. * PI).ln()
                + inner.sigma.logdet()?
                + state.b.logdet()?
                + state.r.dot(&state.sigma_r)
                - state.c.dot(&state.c));
        let k_diag = inner
            .ats
            .iter()
            .map(|at| {
                inner
                    .graph
                    .kernel(at.process(), at.process())?
                    .elwise(&at.x, &at.x, &inner.cache)
            })
            .collect::<Result<Vec<_>>>()?;
        let q_diag = state.v.mapv(|v| v * v).sum_axis(Axis(0));
        let trace = ((stack1(&k_diag)? - q_diag) / inner.sigma.diag()).sum();
        Ok(fit - 0.5 * trace)
    }

    /// `L_B⁻¹ L_z⁻¹ K_za(x)` and `L_z⁻¹ K_za(x)`
    fn project(&self, k_ua: &Kernel, x: &Array2<f64>, cache: &Cache) -> Result<(Array2<f64>, Array2<f64>)> {
        let state = self.state()?;
        let a = state.k_z.cholesky_solve(&k_ua.call(&self.0.u.x, x, cache)?)?;
        Ok((state.b.cholesky_solve(&a)?, a))
    }
}

impl Observations for SparseObs {
    fn id(&self) -> usize {
        self.0.id
    }

    fn graph(&self) -> &Graph {
        &self.0.graph
    }

    fn posterior_kernel(&self, a: &GaussianProcess, b: &GaussianProcess) -> Result<Kernel> {
        let u = self.0.u.process();
        Ok(Kernel::new(SparseKernel {
            k_ab: self.0.graph.kernel(a, b)?,
            k_ua: self.0.graph.kernel(u, a)?,
            k_ub: self.0.graph.kernel(u, b)?,
            symmetric: a.id() == b.id(),
            obs: self.clone(),
        }))
    }

    fn posterior_mean(&self, a: &GaussianProcess) -> Result<Mean> {
        Ok(Mean::new(SparseMean {
            m_a: self.0.graph.mean(a)?,
            k_ua: self.0.graph.kernel(self.0.u.process(), a)?,
            obs: self.clone(),
        }))
    }

    fn shared(&self) -> Rc<dyn Observations> {
        Rc::new(self.clone())
    }
}

/// `k_ab - A_aᵗ A_b + (L_B⁻¹ A_a)ᵗ (L_B⁻¹ A_b)` with `A = L_z⁻¹ K_z·`
#[derive(Debug)]
struct SparseKernel {
    k_ab: Kernel,
    k_ua: Kernel,
    k_ub: Kernel,
    symmetric: bool,
    obs: SparseObs,
}

impl CovarianceModel for SparseKernel {
    fn compute(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array2<f64>> {
        let (la, a) = self.obs.project(&self.k_ua, x, cache)?;
        let (lb, b) = self.obs.project(&self.k_ub, y, cache)?;
        Ok(self.k_ab.call(x, y, cache)? - a.t().dot(&b) + la.t().dot(&lb))
    }

    fn compute_elwise(&self, x: &Array2<f64>, y: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        check_elwise(x, y)?;
        let (la, a) = self.obs.project(&self.k_ua, x, cache)?;
        let (lb, b) = self.obs.project(&self.k_ub, y, cache)?;
        Ok(self.k_ab.elwise(x, y, cache)? - (a * b).sum_axis(Axis(0)) + (la * lb).sum_axis(Axis(0)))
    }

    fn symmetric(&self) -> bool {
        self.symmetric
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("SparsePosterior({})", self.k_ab.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SparseMean {
    m_a: Mean,
    k_ua: Kernel,
    obs: SparseObs,
}

impl MeanModel for SparseMean {
    fn compute(&self, x: &Array2<f64>, cache: &Cache) -> Result<Array1<f64>> {
        let (la, _) = self.obs.project(&self.k_ua, x, cache)?;
        Ok(self.m_a.call(x, cache)? + la.t().dot(&self.obs.state()?.c))
    }

    fn display(&self, f: &dyn Fn(f64) -> f64) -> String {
        format!("SparsePosterior({})", self.m_a.display(f))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn inputs() -> Array2<f64> {
        Array::linspace(0., 3.5, 6).insert_axis(Axis(1))
    }

    #[test]
    fn test_malformed_observations() {
        let g = Graph::new();
        let p = g.gp(Kernel::new(SquaredExponential), Mean::zero());
        let x = inputs();
        assert!(matches!(
            Obs::new(vec![]),
            Err(GpError::MalformedObservation(_))
        ));
        assert!(matches!(
            Obs::new(vec![(p.at(&x), array![1., 2.])]),
            Err(GpError::MalformedObservation(_))
        ));
        assert!(matches!(
            Obs::from_inputs(vec![(ObsInput::Raw(x.clone()), Array1::zeros(6))], None),
            Err(GpError::MalformedObservation(_))
        ));
        let q = Graph::new().gp(Kernel::new(SquaredExponential), Mean::zero());
        assert!(matches!(
            Obs::new(vec![(p.at(&x), Array1::zeros(6)), (q.at(&x), Array1::zeros(6))]),
            Err(GpError::CrossGraph(_))
        ));
    }

    #[test]
    fn test_reference_inputs() {
        init();
        let g = Graph::new();
        let p = g.gp(Kernel::new(SquaredExponential), Mean::one());
        let x = inputs();
        let y = x.column(0).mapv(f64::cos);
        let a = Obs::with_ref(&p, &x, y.clone()).unwrap();
        let b = Obs::new(vec![(p.at(&x), y.clone())]).unwrap();
        assert_abs_diff_eq!(a.y(), &y);
        assert_abs_diff_eq!(
            a.k_x().unwrap().mat(),
            b.k_x().unwrap().mat(),
            epsilon = 1e-15
        );
        let xs = array![[0.3], [1.1]];
        let da = (&p | &a).unwrap().eval(&xs).unwrap();
        let db = (&p | &b).unwrap().eval(&xs).unwrap();
        assert_abs_diff_eq!(da.mean().unwrap(), db.mean().unwrap(), epsilon = 1e-12);
        assert_eq!(format!("{}", (&p | &a).unwrap()), "GP(Posterior(EQ()), Posterior(1))");
    }

    #[test]
    fn test_observation_covariance_is_computed_once() {
        let g = Graph::new();
        let p = g.gp(Kernel::new(SquaredExponential), Mean::zero());
        let x = inputs();
        let obs = Obs::new(vec![(p.at(&x), x.column(0).to_owned())]).unwrap();
        let post = (&p | &obs).unwrap();
        let _ = post.eval(&array![[0.2]]).unwrap().resolve().unwrap();
        let computed = obs.0.cache.computations();
        let _ = post.eval(&array![[0.7]]).unwrap().resolve().unwrap();
        assert_eq!(obs.0.cache.computations(), computed);
        assert!(obs.k_x().unwrap().dim() == 6);
    }

    #[test]
    fn test_posterior_elwise_matches_diagonal() {
        let g = Graph::new();
        let p = g.gp(Kernel::new(Matern52), Mean::zero());
        let x = inputs();
        let obs = Obs::new(vec![(p.at(&x), x.column(0).mapv(f64::sin))]).unwrap();
        let k = (&p | &obs).unwrap().kernel().unwrap();
        let xs = array![[0.1], [0.9], [2.2]];
        let cache = Cache::new();
        assert_abs_diff_eq!(
            k.elwise(&xs, &xs, &cache).unwrap(),
            k.call(&xs, &xs, &cache).unwrap().diag().to_owned(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_sparse_matches_exact() {
        init();
        let g = Graph::new();
        let f = g.gp(Kernel::new(SquaredExponential), Mean::zero());
        let e = g.gp(Kernel::new(Delta) * 1e-2, Mean::zero());
        let x = inputs();
        let y = x.column(0).mapv(|v| (2. * v).sin());
        let fe = (&f + &e).unwrap();

        let exact = Obs::new(vec![(fe.at(&x), y.clone())]).unwrap();
        let sparse = SparseObs::new(f.at(&x), &e, vec![(f.at(&x), y.clone())]).unwrap();
        let post_exact = (&f | &exact).unwrap();
        let post_sparse = (&f | &sparse).unwrap();

        let xs = array![[0.], [0.35], [1.4], [3.]];
        let d_exact = post_exact.eval(&xs).unwrap();
        let d_sparse = post_sparse.eval(&xs).unwrap();
        assert_abs_diff_eq!(
            d_sparse.mean().unwrap(),
            d_exact.mean().unwrap(),
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            d_sparse.var().unwrap().mat(),
            d_exact.var().unwrap().mat(),
            epsilon = 1e-6
        );

        let logpdf = fe.eval(&x).unwrap().logpdf_scalar(&y).unwrap();
        assert_abs_diff_eq!(sparse.elbo().unwrap(), logpdf, epsilon = 1e-6);
    }

    #[test]
    fn test_sparse_elbo_is_a_lower_bound() {
        let g = Graph::new();
        let f = g.gp(Kernel::new(SquaredExponential), Mean::zero());
        let e = g.gp(Kernel::new(Delta) * 0.1, Mean::zero());
        let x = Array::linspace(0., 4., 12).insert_axis(Axis(1));
        let y = x.column(0).mapv(f64::sin);
        let z = array![[0.5], [2.], [3.5]];
        let sparse = SparseObs::new(f.at(&z), &e, vec![(f.at(&x), y.clone())]).unwrap();
        let logpdf = (&f + &e)
            .unwrap()
            .eval(&x)
            .unwrap()
            .logpdf_scalar(&y)
            .unwrap();
        assert!(sparse.elbo().unwrap() <= logpdf);
    }

    #[test]
    fn test_sparse_through_affine_processes() {
        init();
        let g = Graph::new();
        let f = g.gp(Kernel::new(SquaredExponential), Mean::zero());
        let e = g.gp(Kernel::new(Delta) * 1e-2, Mean::zero());
        let f2 = &(&f * 2.) + 2.;
        let x = inputs();
        let y = x.column(0).mapv(|v| (2. * v).sin());
        let y2 = y.mapv(|v| 2. * v + 2.);
        let xs = array![[0.2], [1.4], [2.9]];

        // observing 2f + 2 with f itself inducing
        let sparse = SparseObs::new(f.at(&x), &e, vec![(f2.at(&x), y2.clone())]).unwrap();
        let noisy = (&f2 + &e).unwrap();
        let exact = Obs::new(vec![(noisy.at(&x), y2.clone())]).unwrap();
        let d_sparse = (&f | &sparse).unwrap().eval(&xs).unwrap();
        let d_exact = (&f | &exact).unwrap().eval(&xs).unwrap();
        assert_abs_diff_eq!(d_sparse.mean().unwrap(), d_exact.mean().unwrap(), epsilon = 1e-6);
        assert_abs_diff_eq!(
            d_sparse.var().unwrap().mat(),
            d_exact.var().unwrap().mat(),
            epsilon = 1e-6
        );
        let logpdf = noisy.eval(&x).unwrap().logpdf_scalar(&y2).unwrap();
        assert_abs_diff_eq!(sparse.elbo().unwrap(), logpdf, epsilon = 1e-6);

        // observing f with 2f + 2 inducing
        let sparse = SparseObs::new(f2.at(&x), &e, vec![(f.at(&x), y.clone())]).unwrap();
        let noisy = (&f + &e).unwrap();
        let exact = Obs::new(vec![(noisy.at(&x), y.clone())]).unwrap();
        let d_sparse = (&f | &sparse).unwrap().eval(&xs).unwrap();
        let d_exact = (&f | &exact).unwrap().eval(&xs).unwrap();
        assert_abs_diff_eq!(d_sparse.mean().unwrap(), d_exact.mean().unwrap(), epsilon = 1e-6);
        assert_abs_diff_eq!(
            d_sparse.var().unwrap().mat(),
            d_exact.var().unwrap().mat(),
            epsilon = 1e-6
        );
        let logpdf = noisy.eval(&x).unwrap().logpdf_scalar(&y).unwrap();
        assert_abs_diff_eq!(sparse.elbo().unwrap(), logpdf, epsilon = 1e-6);
    }

    #[test]
    fn test_sparse_needs_diagonal_noise() {
        let g = Graph::new();
        let f = g.gp(Kernel::new(SquaredExponential), Mean::zero());
        let e = g.gp(Kernel::new(SquaredExponential) * 0.1, Mean::zero());
        let x = inputs();
        assert!(matches!(
            SparseObs::new(f.at(&x), &e, vec![(f.at(&x), Array1::zeros(6))]),
            Err(GpError::MalformedObservation(_))
        ));
    }
}
