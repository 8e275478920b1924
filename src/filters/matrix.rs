//! Graph thresholding and induced submatrix extraction.
//!
//! A square weight matrix is read as a graph: nodes are row/column positions and an edge joins
//! `i != j` when `|w[i][j]|` reaches the threshold. Thresholding keeps the nodes touched by at
//! least one surviving edge.

use ndarray::{Array, Array2, ArrayView, ArrayView2, Axis, RemoveAxis};
use serde_json::Value;

/// Parse a square JSON matrix (an array of equally long rows).
///
/// Returns `None` if the value is not a square array of arrays.
pub fn from_json(value: &Value) -> Option<Array2<Value>> {
    let rows = value.as_array()?;
    let n = rows.len();
    let mut elements = Vec::with_capacity(n * n);
    for row in rows {
        let row = row.as_array()?;
        if row.len() != n {
            return None;
        }
        elements.extend(row.iter().cloned());
    }
    Array2::from_shape_vec((n, n), elements).ok()
}

/// Render a matrix as a JSON array of rows.
pub fn to_json(matrix: &Array2<Value>) -> Value {
    Value::Array(
        matrix
            .outer_iter()
            .map(|row| Value::Array(row.to_vec()))
            .collect(),
    )
}

/// Numeric weights of a JSON matrix. Anything that is not a number becomes NaN.
pub fn weights(matrix: ArrayView2<Value>) -> Array2<f64> {
    matrix.mapv(|value| value.as_f64().unwrap_or(f64::NAN))
}

/// Nodes touched by at least one edge of absolute weight `>= threshold`, in ascending order.
///
/// Either direction of a pair forms the edge, so asymmetric input is read as its symmetric
/// closure. NaN weights never form an edge.
pub fn threshold_nodes(weights: ArrayView2<f64>, threshold: f64) -> Vec<usize> {
    let n = weights.nrows().min(weights.ncols());
    let mut touched = vec![false; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let edge = weights[[i, j]].abs() >= threshold || weights[[j, i]].abs() >= threshold;
            if edge {
                touched[i] = true;
                touched[j] = true;
            }
        }
    }
    touched
        .iter()
        .enumerate()
        .filter_map(|(i, &touched)| touched.then_some(i))
        .collect()
}

/// Restrict every axis of `array` to `nodes`, preserving their order.
///
/// For a matrix this is the induced submatrix `M'[a][b] = M[nodes[a]][nodes[b]]`.
///
/// # Panics
///
/// Panics if a node is out of bounds on any axis.
pub fn induced_submatrix<A, D>(array: ArrayView<A, D>, nodes: &[usize]) -> Array<A, D>
where
    A: Clone,
    D: RemoveAxis,
{
    let mut result = array.to_owned();
    for axis in 0..array.ndim() {
        result = result.select(Axis(axis), nodes);
    }
    result
}

/// Absolute values of the strict upper triangle, skipping NaN.
pub fn upper_triangle_abs(weights: ArrayView2<f64>) -> Vec<f64> {
    let n = weights.nrows().min(weights.ncols());
    (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .map(|(i, j)| weights[[i, j]].abs())
        .filter(|weight| !weight.is_nan())
        .collect()
}
