//! Small dense linear algebra and normal distribution helpers.

use std::f64::consts::PI;

/// Dense row-major matrix.
pub type Matrix = Vec<Vec<f64>>;

/// Failed pivot of a Cholesky factorization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotPsd {
    pub index: usize,
    pub pivot: f64,
}

/// `m * x`.
pub fn mat_vec(m: &[Vec<f64>], x: &[f64]) -> Vec<f64> {
    m.iter()
        .map(|row| row.iter().zip(x).map(|(a, b)| a * b).sum())
        .collect()
}

/// `xᵀ m x`.
pub fn quad_form(m: &[Vec<f64>], x: &[f64]) -> f64 {
    mat_vec(m, x).iter().zip(x).map(|(a, b)| a * b).sum()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn trace(m: &[Vec<f64>]) -> f64 {
    m.iter().enumerate().map(|(i, row)| row[i]).sum()
}

/// Whether `m` is an `n x n` matrix of finite values.
pub fn is_square_finite(m: &[Vec<f64>], n: usize) -> bool {
    m.len() == n && m.iter().all(|row| row.len() == n && row.iter().all(|v| v.is_finite()))
}

/// Average `m` with its transpose. Returns the largest asymmetry found.
pub fn symmetrize(m: &[Vec<f64>]) -> (Matrix, f64) {
    let n = m.len();
    let mut out = m.to_vec();
    let mut max_gap: f64 = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let gap = (m[i][j] - m[j][i]).abs();
            max_gap = max_gap.max(gap);
            let avg = 0.5 * (m[i][j] + m[j][i]);
            out[i][j] = avg;
            out[j][i] = avg;
        }
    }
    (out, max_gap)
}

/// Shrink toward the scaled identity: `(1 - delta) m + delta (tr m / n) I`.
pub fn shrink_to_identity(m: &[Vec<f64>], delta: f64) -> Matrix {
    let n = m.len();
    if n == 0 {
        return Vec::new();
    }
    let avg_var = trace(m) / n as f64;
    let mut out = m.to_vec();
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v *= 1.0 - delta;
            if i == j {
                *v += delta * avg_var;
            }
        }
    }
    out
}

/// Lower-triangular `L` with `L Lᵀ = m`, tolerating semidefinite matrices.
///
/// Zero pivots (within a tolerance relative to the largest diagonal entry)
/// yield zero columns; a negative pivot or a non-zero column under a zero
/// pivot means `m` is not positive semidefinite.
pub fn cholesky_psd(m: &[Vec<f64>]) -> std::result::Result<Matrix, NotPsd> {
    let n = m.len();
    let scale = m
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0_f64, f64::max)
        .max(f64::MIN_POSITIVE);
    let pivot_tol = 1e-12 * scale;
    let column_tol = 1e-8 * scale;

    let mut l = vec![vec![0.0; n]; n];
    for j in 0..n {
        let d = m[j][j] - (0..j).map(|k| l[j][k] * l[j][k]).sum::<f64>();
        if d < -pivot_tol || !d.is_finite() {
            return Err(NotPsd { index: j, pivot: d });
        }
        if d <= pivot_tol {
            for i in (j + 1)..n {
                let s = m[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
                if s.abs() > column_tol {
                    return Err(NotPsd { index: j, pivot: d });
                }
            }
            continue;
        }
        let root = d.sqrt();
        l[j][j] = root;
        for i in (j + 1)..n {
            let s = m[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
            l[i][j] = s / root;
        }
    }
    Ok(l)
}

/// Standard normal density.
pub fn normal_pdf(x: f64) -> f64 {
    (-x * x / 2.0).exp() / (2.0 * PI).sqrt()
}

/// Standard normal distribution function.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz-Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = x.signum();
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Inverse of the standard normal distribution function for `p` in (0, 1).
///
/// Acklam's rational approximation, relative error below 1.2e-9.
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}
