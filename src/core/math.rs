//! Shared numerical helpers: NaN-aware interpolation and statistics, small
//! dense least-squares solvers, and symmetric eigenvalues for condition
//! numbers. Everything here operates on a handful of unknowns at most, so
//! hand-rolled Gaussian elimination is plenty.

use crate::types::VelImage;
use ndarray::Array2;

/// Pivot magnitude below which a system is treated as singular
const SINGULAR_EPS: f64 = 1e-12;

/// NaN-aware bilinear sample of `data` (on coordinate vectors `x`, `y`) at
/// the query point `(xq, yq)`.
///
/// Coordinates must be uniform and monotone increasing. Returns NaN outside
/// the lattice or when all corners of the enclosing cell are NaN; partial
/// neighborhoods use the valid corners with renormalized weights.
pub fn bilinear_sample(data: &VelImage, x: &[f64], y: &[f64], xq: f64, yq: f64) -> f64 {
    let (rows, cols) = data.dim();
    if cols != x.len() || rows != y.len() || x.is_empty() || y.is_empty() {
        return f64::NAN;
    }
    let dx = if cols > 1 { x[1] - x[0] } else { 1.0 };
    let dy = if rows > 1 { y[1] - y[0] } else { 1.0 };

    // Fractional index, with a small tolerance at the outer edges
    let fx = (xq - x[0]) / dx;
    let fy = (yq - y[0]) / dy;
    let tol = 1e-9;
    if fx < -tol || fx > (cols - 1) as f64 + tol || fy < -tol || fy > (rows - 1) as f64 + tol {
        return f64::NAN;
    }
    let fx = fx.clamp(0.0, (cols - 1) as f64);
    let fy = fy.clamp(0.0, (rows - 1) as f64);

    let j0 = (fx.floor() as usize).min(cols.saturating_sub(2).max(0));
    let i0 = (fy.floor() as usize).min(rows.saturating_sub(2).max(0));
    let j1 = (j0 + 1).min(cols - 1);
    let i1 = (i0 + 1).min(rows - 1);
    let tx = fx - j0 as f64;
    let ty = fy - i0 as f64;

    let corners = [
        (data[[i0, j0]], (1.0 - tx) * (1.0 - ty)),
        (data[[i0, j1]], tx * (1.0 - ty)),
        (data[[i1, j0]], (1.0 - tx) * ty),
        (data[[i1, j1]], tx * ty),
    ];

    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for (value, weight) in corners {
        if value.is_finite() {
            sum += value * weight;
            weight_sum += weight;
        }
    }
    if weight_sum > 0.0 {
        sum / weight_sum
    } else {
        f64::NAN
    }
}

/// Mean over finite values; NaN when none are finite
pub fn nanmean(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        if v.is_finite() {
            sum += v;
            count += 1;
        }
    }
    if count > 0 {
        sum / count as f64
    } else {
        f64::NAN
    }
}

/// Median over finite values; NaN when none are finite
pub fn nanmedian(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = finite.len();
    if n % 2 == 1 {
        finite[n / 2]
    } else {
        0.5 * (finite[n / 2 - 1] + finite[n / 2])
    }
}

/// Mode of the finite values after rounding to one decimal place.
/// Ties resolve to the smallest candidate. NaN when no finite values.
pub fn nanmode_rounded(values: impl IntoIterator<Item = f64>) -> f64 {
    use std::collections::HashMap;
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for v in values {
        if v.is_finite() {
            let key = (v * 10.0).round() as i64;
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(key, _)| key as f64 / 10.0)
        .unwrap_or(f64::NAN)
}

/// Solve `A x = b` by Gaussian elimination with partial pivoting.
/// Returns None when the system is singular.
pub fn solve_dense(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    debug_assert!(a.len() == n && a.iter().all(|row| row.len() == n));
    for col in 0..n {
        // Partial pivot
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[i][col].abs().partial_cmp(&a[j][col].abs()).unwrap())?;
        if a[pivot_row][col].abs() < SINGULAR_EPS {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    // Back substitution
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

/// Invert a small square matrix; None when singular
pub fn invert_small(m: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = m.len();
    let mut inverse = vec![vec![0.0; n]; n];
    for col in 0..n {
        let mut e = vec![0.0; n];
        e[col] = 1.0;
        let column = solve_dense(m.to_vec(), e)?;
        for row in 0..n {
            inverse[row][col] = column[row];
        }
    }
    Some(inverse)
}

/// Ordinary least squares: minimize ||G m - d|| over the given design rows.
/// Returns None when the normal equations are singular.
pub fn ols_fit(design: &[Vec<f64>], obs: &[f64]) -> Option<Vec<f64>> {
    let weights = vec![1.0; obs.len()];
    wls_fit(design, obs, &weights).map(|solution| solution.params)
}

/// Weighted least-squares solution with uncertainty diagnostics
#[derive(Debug, Clone)]
pub struct WlsSolution {
    pub params: Vec<f64>,
    /// Diagonal of (G'WG)^-1
    pub variances: Vec<f64>,
    /// Condition number of G'WG (ratio of extreme eigenvalues)
    pub condition: f64,
}

/// Solve `m = (G'WG)^-1 G'W d` with diagonal weights.
/// Returns None when the normal matrix is singular.
pub fn wls_fit(design: &[Vec<f64>], obs: &[f64], weights: &[f64]) -> Option<WlsSolution> {
    let n_obs = obs.len();
    if n_obs == 0 || design.len() != n_obs || weights.len() != n_obs {
        return None;
    }
    let n_par = design[0].len();
    if n_obs < n_par {
        return None;
    }

    let mut normal = vec![vec![0.0; n_par]; n_par];
    let mut rhs = vec![0.0; n_par];
    for (row, (&d, &w)) in design.iter().zip(obs.iter().zip(weights.iter())) {
        for i in 0..n_par {
            rhs[i] += row[i] * w * d;
            for j in i..n_par {
                normal[i][j] += row[i] * w * row[j];
            }
        }
    }
    for i in 0..n_par {
        for j in 0..i {
            normal[i][j] = normal[j][i];
        }
    }

    let condition = sym_condition_number(&normal);
    let inverse = invert_small(&normal)?;
    let mut params = vec![0.0; n_par];
    for i in 0..n_par {
        for j in 0..n_par {
            params[i] += inverse[i][j] * rhs[j];
        }
    }
    let variances = (0..n_par).map(|i| inverse[i][i]).collect();
    Some(WlsSolution {
        params,
        variances,
        condition,
    })
}

/// Eigenvalues of a symmetric matrix, n <= 3 (closed forms)
pub fn sym_eigenvalues(m: &[Vec<f64>]) -> Vec<f64> {
    match m.len() {
        1 => vec![m[0][0]],
        2 => {
            let (a, b, c) = (m[0][0], m[0][1], m[1][1]);
            let mean = 0.5 * (a + c);
            let delta = (0.25 * (a - c) * (a - c) + b * b).sqrt();
            vec![mean - delta, mean + delta]
        }
        3 => {
            // Trigonometric solution for real symmetric 3x3
            let p1 = m[0][1] * m[0][1] + m[0][2] * m[0][2] + m[1][2] * m[1][2];
            let q = (m[0][0] + m[1][1] + m[2][2]) / 3.0;
            let p2 = (m[0][0] - q).powi(2)
                + (m[1][1] - q).powi(2)
                + (m[2][2] - q).powi(2)
                + 2.0 * p1;
            if p2 <= 0.0 {
                return vec![q, q, q];
            }
            let p = (p2 / 6.0).sqrt();
            let det = |b: &[[f64; 3]; 3]| -> f64 {
                b[0][0] * (b[1][1] * b[2][2] - b[1][2] * b[2][1])
                    - b[0][1] * (b[1][0] * b[2][2] - b[1][2] * b[2][0])
                    + b[0][2] * (b[1][0] * b[2][1] - b[1][1] * b[2][0])
            };
            let mut b = [[0.0; 3]; 3];
            for i in 0..3 {
                for j in 0..3 {
                    b[i][j] = (m[i][j] - if i == j { q } else { 0.0 }) / p;
                }
            }
            let r = (det(&b) / 2.0).clamp(-1.0, 1.0);
            let phi = r.acos() / 3.0;
            let e1 = q + 2.0 * p * phi.cos();
            let e3 = q + 2.0 * p * (phi + 2.0 * std::f64::consts::PI / 3.0).cos();
            let e2 = 3.0 * q - e1 - e3;
            vec![e3, e2, e1]
        }
        _ => unreachable!("symmetric eigenvalues only implemented for n <= 3"),
    }
}

/// Condition number (ratio of extreme absolute eigenvalues) of a symmetric
/// positive semi-definite matrix; infinite when effectively rank-deficient
pub fn sym_condition_number(m: &[Vec<f64>]) -> f64 {
    let eig = sym_eigenvalues(m);
    let max = eig.iter().fold(0.0_f64, |acc, &e| acc.max(e.abs()));
    let min = eig.iter().fold(f64::INFINITY, |acc, &e| acc.min(e.abs()));
    if min < SINGULAR_EPS * max.max(1.0) {
        f64::INFINITY
    } else {
        max / min
    }
}

/// NaN-aware rectangular moving-average filter.
///
/// Each output cell is the mean of the finite values inside the window;
/// cells whose window holds no finite value come out NaN. Window size must
/// be odd (validated by the caller).
pub fn moving_mean_nan(data: &VelImage, window: usize) -> VelImage {
    let (rows, cols) = data.dim();
    let mut filtered = Array2::from_elem((rows, cols), f64::NAN);
    let half = window / 2;

    for i in 0..rows {
        for j in 0..cols {
            let mut sum = 0.0;
            let mut count = 0usize;
            let i_lo = i.saturating_sub(half);
            let i_hi = (i + half + 1).min(rows);
            let j_lo = j.saturating_sub(half);
            let j_hi = (j + half + 1).min(cols);
            for wi in i_lo..i_hi {
                for wj in j_lo..j_hi {
                    let value = data[[wi, wj]];
                    if value.is_finite() {
                        sum += value;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                filtered[[i, j]] = sum / count as f64;
            }
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_bilinear_exact_on_nodes_and_midpoints() {
        let data = array![[0.0, 1.0], [2.0, 3.0]];
        let x = [0.0, 1.0];
        let y = [0.0, 1.0];
        assert_abs_diff_eq!(bilinear_sample(&data, &x, &y, 0.0, 0.0), 0.0);
        assert_abs_diff_eq!(bilinear_sample(&data, &x, &y, 1.0, 1.0), 3.0);
        assert_abs_diff_eq!(bilinear_sample(&data, &x, &y, 0.5, 0.5), 1.5);
        assert!(bilinear_sample(&data, &x, &y, 2.0, 0.0).is_nan());
    }

    #[test]
    fn test_bilinear_partial_nan_neighborhood() {
        let data = array![[f64::NAN, 1.0], [1.0, 1.0]];
        let x = [0.0, 1.0];
        let y = [0.0, 1.0];
        // All valid corners agree, so the renormalized result must too
        assert_abs_diff_eq!(bilinear_sample(&data, &x, &y, 0.5, 0.5), 1.0);
        let all_nan = array![[f64::NAN, f64::NAN], [f64::NAN, f64::NAN]];
        assert!(bilinear_sample(&all_nan, &x, &y, 0.5, 0.5).is_nan());
    }

    #[test]
    fn test_nan_statistics() {
        let vals = [1.0, f64::NAN, 3.0, 2.0];
        assert_abs_diff_eq!(nanmean(vals), 2.0);
        assert_abs_diff_eq!(nanmedian(vals), 2.0);
        assert!(nanmean([f64::NAN]).is_nan());

        let modal = [1.04, 1.01, 2.3, 2.31, 2.28, f64::NAN];
        assert_abs_diff_eq!(nanmode_rounded(modal), 2.3);
    }

    #[test]
    fn test_solve_dense_and_inverse() {
        let a = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let x = solve_dense(a.clone(), vec![5.0, 10.0]).unwrap();
        assert_abs_diff_eq!(2.0 * x[0] + x[1], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[0] + 3.0 * x[1], 10.0, epsilon = 1e-12);

        let inv = invert_small(&a).unwrap();
        assert_abs_diff_eq!(inv[0][0] * 2.0 + inv[0][1] * 1.0, 1.0, epsilon = 1e-12);

        let singular = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(solve_dense(singular, vec![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_wls_recovers_plane() {
        // z = 1 + 2x + 3y sampled exactly
        let mut design = Vec::new();
        let mut obs = Vec::new();
        for &(x, y) in &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (2.0, 1.0)] {
            design.push(vec![1.0, x, y]);
            obs.push(1.0 + 2.0 * x + 3.0 * y);
        }
        let params = ols_fit(&design, &obs).unwrap();
        assert_abs_diff_eq!(params[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(params[1], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(params[2], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_sym_eigenvalues_3x3() {
        let m = vec![
            vec![2.0, 0.0, 0.0],
            vec![0.0, 3.0, 4.0],
            vec![0.0, 4.0, 9.0],
        ];
        let mut eig = sym_eigenvalues(&m);
        eig.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // Block eigenvalues: 2 and (6 +/- sqrt(25)) = 1, 11
        assert_abs_diff_eq!(eig[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(eig[1], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(eig[2], 11.0, epsilon = 1e-9);
    }

    #[test]
    fn test_condition_number_identity_and_singular() {
        let eye = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert_abs_diff_eq!(sym_condition_number(&eye), 1.0);
        let rank1 = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        assert!(sym_condition_number(&rank1).is_infinite());
    }

    #[test]
    fn test_moving_mean_nan_window() {
        let data = array![
            [1.0, 1.0, 1.0],
            [1.0, f64::NAN, 1.0],
            [1.0, 1.0, 1.0]
        ];
        let filtered = moving_mean_nan(&data, 3);
        // The NaN center still averages to 1 from its 8 valid neighbors
        assert_abs_diff_eq!(filtered[[1, 1]], 1.0);
        assert_abs_diff_eq!(filtered[[0, 0]], 1.0);
    }
}
