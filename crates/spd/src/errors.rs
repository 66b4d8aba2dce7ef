use thiserror::Error;

/// A result type for structured operator computations
pub type Result<T> = std::result::Result<T, SpdError>;

/// An error when using an [`Spd`](crate::Spd) operator
#[derive(Error, Debug)]
pub enum SpdError {
    /// When an inversion is requested on a structurally singular operator
    #[error("Singular operator: {0}")]
    Singular(String),
    /// When operand sizes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
}
