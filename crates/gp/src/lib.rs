//! This library implements a symbolic computation graph of jointly distributed
//! [Gaussian processes](https://en.wikipedia.org/wiki/Gaussian_process).
//!
//! Processes are registered in a [Graph] and combined by sums, products with
//! deterministic functions, input transforms and derivatives. Kernels and means
//! of derived processes, including cross-covariances, are assembled lazily as
//! [Kernel] and [Mean] expression trees, and evaluated at finite inputs as
//! [Normal] distributions whose covariances are structured
//! [Spd](gpgraph_spd::Spd) operators.
//!
//! Conditioning on exact observations ([Obs]) or on noisy observations through
//! inducing inputs ([SparseObs], the variational method of Titsias) gives
//! posterior processes living in a posterior graph.
//!
//! Every kernel and mean evaluation goes through a [Cache] so that a given
//! evaluation is computed at most once.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod cache;
pub mod covariance_models;
mod errors;
mod graph;
mod input;
mod kernel;
pub mod mean_models;
mod observations;
mod parameters;
mod random;
mod utils;

pub use cache::*;
pub use errors::*;
pub use graph::*;
pub use input::*;
pub use kernel::*;
pub use mean_models::Mean;
pub use observations::*;
pub use parameters::*;
pub use random::*;
pub use utils::{elwise_sq_distances, pairwise_dot, pairwise_sq_distances};
