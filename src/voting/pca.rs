use crate::error::GacError;
use crate::voting::PipelineContext;
use log::{debug, warn};

// Eigenvalues at or below this carry no usable variance
const EIGENVALUE_THRESHOLD: f64 = 1e-10;
const MAX_COMPONENTS: usize = 2;
const JACOBI_MAX_SWEEPS: usize = 100;
const IDENTICAL_ROW_TOLERANCE: f64 = 1e-12;

/// Participant coordinates handed to the clustering stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub points: Vec<Vec<f64>>,
    /// Number of principal axes kept, or `None` when the input passed through unreduced.
    pub components: Option<usize>,
}

impl Projection {
    fn identity(data: &[Vec<f64>]) -> Self {
        Self {
            points: data.to_vec(),
            components: None,
        }
    }
}

/// Project participant rows onto the top `min(2, participants, statements)` principal axes.
///
/// Never fails: too few columns, identical rows or a covariance matrix that cannot
/// be decomposed all return the input unchanged.
pub fn reduce_dimensions(ctx: &PipelineContext, data: &[Vec<f64>]) -> Projection {
    let n = data.len();
    let m = data.first().map_or(0, |row| row.len());
    let requested = MAX_COMPONENTS.min(n).min(m);

    if m <= requested {
        debug!("[{}] {} statements, skipping PCA", ctx.poll_id, m);
        return Projection::identity(data);
    }

    if rows_identical(data) {
        debug!("[{}] all participants vote identically, skipping PCA", ctx.poll_id);
        return Projection::identity(data);
    }

    match principal_components(data, requested) {
        Ok((projection, variances)) => {
            debug!(
                "[{}] projected onto {:?} components, variances {:?}",
                ctx.poll_id, projection.components, variances
            );
            projection
        }
        Err(e) => {
            warn!("[{}] PCA failed ({}), using unreduced matrix", ctx.poll_id, e);
            Projection::identity(data)
        }
    }
}

fn rows_identical(data: &[Vec<f64>]) -> bool {
    let Some(first) = data.first() else {
        return true;
    };
    data.iter().all(|row| {
        row.iter()
            .zip(first)
            .all(|(a, b)| (a - b).abs() <= IDENTICAL_ROW_TOLERANCE)
    })
}

fn principal_components(
    data: &[Vec<f64>],
    requested: usize,
) -> Result<(Projection, Vec<f64>), GacError> {
    let n = data.len();
    let m = data[0].len();

    if n < 2 {
        return Err(GacError::NumericDegeneracy(
            "covariance needs at least two participants".to_string(),
        ));
    }
    if data.iter().flatten().any(|v| !v.is_finite()) {
        return Err(GacError::NumericDegeneracy("non-finite matrix entry".to_string()));
    }

    let means: Vec<f64> = (0..m)
        .map(|j| data.iter().map(|row| row[j]).sum::<f64>() / n as f64)
        .collect();
    let centered: Vec<Vec<f64>> = data
        .iter()
        .map(|row| row.iter().zip(&means).map(|(v, mean)| v - mean).collect())
        .collect();

    let mut covariance = vec![vec![0.0; m]; m];
    for row in &centered {
        for i in 0..m {
            for j in i..m {
                covariance[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..m {
        for j in i..m {
            covariance[i][j] /= (n - 1) as f64;
            covariance[j][i] = covariance[i][j];
        }
    }

    let (eigenvalues, eigenvectors) = symmetric_eigen(&covariance)?;

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let meaningful = eigenvalues
        .iter()
        .filter(|&&value| value > EIGENVALUE_THRESHOLD)
        .count();
    let components = requested.min(meaningful).max(1);

    let axes: Vec<Vec<f64>> = order[..components]
        .iter()
        .map(|&k| (0..m).map(|i| eigenvectors[i][k]).collect())
        .collect();
    let points = centered
        .iter()
        .map(|row| {
            axes.iter()
                .map(|axis| row.iter().zip(axis).map(|(x, w)| x * w).sum())
                .collect()
        })
        .collect();
    let variances = order[..components].iter().map(|&k| eigenvalues[k]).collect();

    Ok((
        Projection {
            points,
            components: Some(components),
        },
        variances,
    ))
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns the eigenvalues and a matrix whose column `k` is the unit eigenvector of
/// eigenvalue `k`.
pub fn symmetric_eigen(matrix: &[Vec<f64>]) -> Result<(Vec<f64>, Vec<Vec<f64>>), GacError> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return Err(GacError::NumericDegeneracy(
            "eigen-decomposition needs a square matrix".to_string(),
        ));
    }

    let mut a: Vec<Vec<f64>> = matrix.to_vec();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    let mut converged = false;
    for _ in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        let diag: f64 = (0..n).map(|i| a[i][i] * a[i][i]).sum();
        if !off.is_finite() || !diag.is_finite() {
            return Err(GacError::NumericDegeneracy(
                "non-finite value during eigen-decomposition".to_string(),
            ));
        }
        if off <= 1e-22 * (off + diag) || off == 0.0 {
            converged = true;
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[p][q] == 0.0 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let vkp = row[p];
                    let vkq = row[q];
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    if !converged {
        return Err(GacError::NumericDegeneracy(format!(
            "Jacobi rotations did not converge in {} sweeps",
            JACOBI_MAX_SWEEPS
        )));
    }

    let eigenvalues = (0..n).map(|i| a[i][i]).collect();
    Ok((eigenvalues, v))
}
