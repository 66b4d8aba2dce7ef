//! `gpgraph` composes, combines and conditions jointly distributed Gaussian
//! processes.
//!
//! The crate gathers the workspace libraries:
//! * [spd]: structured symmetric positive (semi-)definite operators and their
//!   arithmetic closure,
//! * [gp]: kernel and mean algebra, Gaussian distributions, process graphs and
//!   their exact or sparse conditioning.
//!
//! # Example
//!
//! ```
//! use gpgraph::gp::{covariance_models::SquaredExponential, Graph, Kernel, Mean, Obs};
//! use ndarray::array;
//!
//! let graph = Graph::new();
//! let f = graph.gp(Kernel::new(SquaredExponential), Mean::zero());
//! let g = (&f * 2.).shift(1.);
//! assert_eq!(format!("{g}"), "GP(4 * EQ() shift 1, 0)");
//!
//! let x = array![[0.], [1.], [2.]];
//! let obs = Obs::new(vec![(f.at(&x), array![1., 0., -1.])]).unwrap();
//! let posterior = (&g | &obs).unwrap();
//! let (mean, lower, upper) = posterior.eval(&array![[1.]]).unwrap().marginals().unwrap();
//! // g(1) = 2 f(0)
//! assert!((mean[0] - 2.).abs() < 1e-6);
//! assert!(upper[0] - lower[0] < 1e-3);
//! ```
pub use gpgraph_gp as gp;
pub use gpgraph_spd as spd;
