use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{concatenate, Array1, Array2, ArrayBase, Axis, Data, Ix2};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Fresh handle shared by kernels, means, graphs and observations
pub(crate) fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn check_ncols<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<()> {
    if x.ncols() != y.ncols() {
        return Err(GpError::InvalidValueError(format!(
            "inputs of dimension {} and {} cannot be compared",
            x.ncols(),
            y.ncols()
        )));
    }
    Ok(())
}

/// Squared euclidean distances between each row of x and each row of y
/// resulting in a 2d array of shape (nrows(x), nrows(y))
pub fn pairwise_sq_distances<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    check_ncols(x, y)?;
    let mut result = Array2::zeros((x.nrows(), y.nrows()));
    for (i, x_row) in x.rows().into_iter().enumerate() {
        for (j, y_row) in y.rows().into_iter().enumerate() {
            result[[i, j]] = x_row
                .iter()
                .zip(y_row.iter())
                .fold(F::zero(), |acc, (a, b)| acc + (*a - *b) * (*a - *b));
        }
    }
    Ok(result)
}

/// Squared euclidean distances between rows of x and y taken pairwise,
/// x and y having the same shape
pub fn elwise_sq_distances<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array1<F>> {
    check_ncols(x, y)?;
    if x.nrows() != y.nrows() {
        return Err(GpError::InvalidValueError(format!(
            "elementwise evaluation needs as many rows, got {} and {}",
            x.nrows(),
            y.nrows()
        )));
    }
    let diff = x.to_owned() - y;
    Ok(diff.mapv(|v| v * v).sum_axis(Axis(1)))
}

/// Inner products between each row of x and each row of y
pub fn pairwise_dot<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    check_ncols(x, y)?;
    Ok(x.dot(&y.t()))
}

/// Concatenates blocks along the given axis
pub(crate) fn stack<F: Float>(axis: Axis, blocks: &[Array2<F>]) -> Result<Array2<F>> {
    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    concatenate(axis, &views).map_err(|e| GpError::InvalidValueError(e.to_string()))
}

/// Concatenates vectors end to end
pub(crate) fn stack1<F: Float>(blocks: &[Array1<F>]) -> Result<Array1<F>> {
    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| GpError::InvalidValueError(e.to_string()))
}
