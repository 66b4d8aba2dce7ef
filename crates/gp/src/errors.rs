use gpgraph_spd::SpdError;
use thiserror::Error;

/// A result type for Gaussian process graph computations
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building, evaluating or conditioning processes of a [`Graph`](crate::Graph)
#[derive(Error, Debug)]
pub enum GpError {
    /// When operands belong to different graphs
    #[error("Cross graph error: {0}")]
    CrossGraph(String),
    /// When combining incompatible kinds of random objects
    #[error("Type compatibility error: {0}")]
    TypeCompatibility(String),
    /// When a name is already held by another process of the graph
    #[error("Duplicate name error: {0}")]
    DuplicateName(String),
    /// When observations are not valid process bindings or have mismatched shapes
    #[error("Malformed observation error: {0}")]
    MalformedObservation(String),
    /// When a structured operator computation fails
    #[error(transparent)]
    SpdError(#[from] SpdError),
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}

impl GpError {
    /// Whether the error comes from inverting a structurally singular operator
    pub fn is_singular(&self) -> bool {
        matches!(self, GpError::SpdError(SpdError::Singular(_)))
    }
}
