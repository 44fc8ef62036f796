use crate::error::GacError;
use crate::voting::PipelineContext;
use crate::voting::matrix::{ImputedMatrix, VoteMatrix};
use log::{debug, warn};
use rayon::prelude::*;

// Shared-vote count at which confidence reaches sqrt(1/2)
const CONFIDENCE_HALF_POINT: f64 = 5.0;

// Below this many participants there is too little overlap to estimate anything
const MIN_PARTICIPANTS_FOR_IMPUTATION: usize = 4;

/// Pairwise participant similarity, damped by how many statements both have voted on.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    n: usize,
    similarity: Vec<f64>,
    confidence: Vec<f64>,
}

impl SimilarityMatrix {
    /// Cosine similarity of vote rows (missing read as 0) times
    /// `sqrt(common / (common + 5))`, where `common` counts statements both voted on.
    pub fn compute(matrix: &VoteMatrix) -> Result<Self, GacError> {
        let n = matrix.n_participants();
        let m = matrix.n_statements();

        let norms: Vec<f64> = (0..n)
            .map(|p| {
                let norm = (0..m)
                    .map(|s| matrix.value_or_zero(p, s).powi(2))
                    .sum::<f64>()
                    .sqrt();
                if norm == 0.0 { 1.0 } else { norm }
            })
            .collect();

        let rows: Vec<(Vec<f64>, Vec<f64>)> = (0..n)
            .into_par_iter()
            .map(|a| {
                let mut sims = vec![0.0; n];
                let mut confs = vec![0.0; n];
                for b in 0..n {
                    if a == b {
                        sims[b] = 1.0;
                        confs[b] = 1.0;
                        continue;
                    }
                    let mut dot = 0.0;
                    let mut common = 0usize;
                    for s in 0..m {
                        dot += matrix.value_or_zero(a, s) * matrix.value_or_zero(b, s);
                        if matrix.is_present(a, s) && matrix.is_present(b, s) {
                            common += 1;
                        }
                    }
                    let confidence = vote_overlap_confidence(common);
                    sims[b] = dot / (norms[a] * norms[b]) * confidence;
                    confs[b] = confidence;
                }
                (sims, confs)
            })
            .collect();

        let mut similarity = Vec::with_capacity(n * n);
        let mut confidence = Vec::with_capacity(n * n);
        for (sims, confs) in rows {
            similarity.extend(sims);
            confidence.extend(confs);
        }

        if let Some(bad) = similarity.iter().find(|v| !v.is_finite()) {
            return Err(GacError::NumericDegeneracy(format!(
                "non-finite participant similarity {}",
                bad
            )));
        }

        Ok(Self {
            n,
            similarity,
            confidence,
        })
    }

    pub fn get(&self, a: usize, b: usize) -> f64 {
        self.similarity[a * self.n + b]
    }

    pub fn confidence(&self, a: usize, b: usize) -> f64 {
        self.confidence[a * self.n + b]
    }

    /// The `count` participants most strongly correlated with `participant`, by absolute
    /// similarity, excluding `participant` itself. Ties go to the lower index.
    pub fn strongest_neighbors(&self, participant: usize, count: usize) -> Vec<usize> {
        let mut others: Vec<usize> = (0..self.n).filter(|&q| q != participant).collect();
        others.sort_by(|&x, &y| {
            self.get(participant, y)
                .abs()
                .total_cmp(&self.get(participant, x).abs())
                .then(x.cmp(&y))
        });
        others.truncate(count);
        others
    }
}

/// Saturating confidence in a similarity estimate built from `common` shared votes.
pub fn vote_overlap_confidence(common: usize) -> f64 {
    let common = common as f64;
    (common / (common + CONFIDENCE_HALF_POINT)).sqrt()
}

/// Number of neighbours consulted per missing cell: `min(n - 1, max(2, log2 n))`.
pub fn neighbor_count(n_participants: usize) -> usize {
    if n_participants < 2 {
        return 0;
    }
    let log = (n_participants as f64).log2().floor() as usize;
    (n_participants - 1).min(log.max(2))
}

/// Fill every missing cell from the votes of the most similar participants.
///
/// Falls back to 0 everywhere when there are fewer than four participants or the
/// similarity matrix cannot be computed. Recorded votes pass through unchanged.
pub fn impute_missing_votes(ctx: &PipelineContext, matrix: &VoteMatrix) -> ImputedMatrix {
    let n = matrix.n_participants();
    let m = matrix.n_statements();

    if matrix.missing_count() == 0 {
        return zero_filled(matrix);
    }

    if n < MIN_PARTICIPANTS_FOR_IMPUTATION {
        debug!(
            "[{}] {} participants, imputing missing votes as 0",
            ctx.poll_id, n
        );
        return zero_filled(matrix);
    }

    let similarity = match SimilarityMatrix::compute(matrix) {
        Ok(similarity) => similarity,
        Err(e) => {
            warn!("[{}] similarity failed ({}), imputing missing votes as 0", ctx.poll_id, e);
            return zero_filled(matrix);
        }
    };

    let k = neighbor_count(n);
    debug!("[{}] imputing with {} neighbours per participant", ctx.poll_id, k);

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|p| {
            let neighbors = if matrix.votes_by_participant(p) < m {
                similarity.strongest_neighbors(p, k)
            } else {
                Vec::new()
            };
            (0..m)
                .map(|s| match matrix.get(p, s) {
                    Some(value) => value,
                    None => impute_cell(matrix, &similarity, p, &neighbors, s),
                })
                .collect()
        })
        .collect();

    ImputedMatrix::new(matrix, rows.into_iter().flatten().collect())
}

// Weighted vote of the neighbours who voted on `statement`, sign-flipped for
// anti-correlated neighbours, then shrunk by the neighbours' overlap confidence.
fn impute_cell(
    matrix: &VoteMatrix,
    similarity: &SimilarityMatrix,
    participant: usize,
    neighbors: &[usize],
    statement: usize,
) -> f64 {
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    let mut confidence_sum = 0.0;

    for &q in neighbors {
        let Some(vote) = matrix.get(q, statement) else {
            continue;
        };
        let sim = similarity.get(participant, q);
        let weight = sim.abs();
        weighted += sim.signum() * vote * weight;
        weight_sum += weight;
        confidence_sum += similarity.confidence(participant, q) * weight;
    }

    if weight_sum == 0.0 {
        return 0.0;
    }

    let estimate = weighted / weight_sum;
    let confidence = confidence_sum / weight_sum;
    (estimate * confidence).clamp(-1.0, 1.0)
}

fn zero_filled(matrix: &VoteMatrix) -> ImputedMatrix {
    let values = (0..matrix.n_participants())
        .flat_map(|p| (0..matrix.n_statements()).map(move |s| matrix.value_or_zero(p, s)))
        .collect();
    ImputedMatrix::new(matrix, values)
}
