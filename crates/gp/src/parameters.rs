use crate::errors::{GpError, Result};
use linfa::ParamGuard;

/// Default regularization added to observation covariances
pub const DEFAULT_NUGGET: f64 = 100. * f64::EPSILON;
/// Default step of the central differences used by derivative kernels
/// without a closed form; smaller steps lose the positive definiteness of
/// derivative covariances to rounding
pub const DEFAULT_DIFF_STEP: f64 = 1e-2;

/// A set of validated graph parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphValidParams {
    /// Diagonal regularization of observation covariances
    pub(crate) nugget: f64,
    /// Central difference step of derivative kernels
    pub(crate) diff_step: f64,
    /// Seed of the random generator used for joint sampling
    pub(crate) seed: Option<u64>,
}

impl Default for GraphValidParams {
    fn default() -> GraphValidParams {
        GraphValidParams {
            nugget: DEFAULT_NUGGET,
            diff_step: DEFAULT_DIFF_STEP,
            seed: None,
        }
    }
}

impl GraphValidParams {
    /// Get observation covariance regularization
    pub fn nugget(&self) -> f64 {
        self.nugget
    }

    /// Get derivative step
    pub fn diff_step(&self) -> f64 {
        self.diff_step
    }

    /// Get random generator seed
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

#[derive(Clone, Debug, Default)]
/// The set of hyperparameters that can be specified for the construction of
/// a [`Graph`](crate::Graph).
pub struct GraphParams(GraphValidParams);

impl GraphParams {
    /// A graph parameters builder with default values
    pub fn new() -> GraphParams {
        Self::default()
    }

    /// Set the regularization added to the diagonal of observation covariances
    /// before they are factorized.
    pub fn nugget(mut self, nugget: f64) -> Self {
        self.0.nugget = nugget;
        self
    }

    /// Set the step of the central differences approximating derivative kernels
    pub fn diff_step(mut self, diff_step: f64) -> Self {
        self.0.diff_step = diff_step;
        self
    }

    /// Set the seed of the random generator used by [`Graph::sample`](crate::Graph::sample)
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl From<GraphValidParams> for GraphParams {
    fn from(valid: GraphValidParams) -> Self {
        GraphParams(valid)
    }
}

impl ParamGuard for GraphParams {
    type Checked = GraphValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.0.nugget >= 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`nugget` should be a non negative number, got {}",
                self.0.nugget
            )));
        }
        if !(self.0.diff_step > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`diff_step` should be a positive number, got {}",
                self.0.diff_step
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
