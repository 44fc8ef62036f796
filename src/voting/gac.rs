use crate::error::GacError;
use crate::models::GacScoreRecord;
use crate::voting::PipelineContext;
use crate::voting::clustering::ClusterAssignment;
use crate::voting::matrix::{ImputedMatrix, VoteMatrix};
use log::debug;
use std::collections::HashMap;

const THRESHOLD_CAP: f64 = 0.85;
const THRESHOLD_BASE: f64 = 0.66;

/// Smoothing added to agree/disagree counts: `0.3 * log2(1 + n / 10)`.
pub fn base_pseudocount(n_participants: usize) -> f64 {
    0.3 * (1.0 + n_participants as f64 / 10.0).log2()
}

/// Score a statement must reach to be constitutionable: `min(0.85, 0.66 * (1 + 2 / log2(2 + n)))`.
pub fn constitutionable_threshold(n_participants: usize) -> f64 {
    let adaptive = THRESHOLD_BASE * (1.0 + 2.0 / (2.0 + n_participants as f64).log2());
    adaptive.clamp(THRESHOLD_BASE, THRESHOLD_CAP)
}

/// Classify a score record against the adaptive threshold for its participant count.
pub fn is_constitutionable(record: &GacScoreRecord) -> Result<bool, GacError> {
    if !record.score.is_finite() || !(0.0..=1.0).contains(&record.score) {
        return Err(GacError::InvalidRecord(format!(
            "score {} outside [0, 1]",
            record.score
        )));
    }
    if record.participants_considered == 0 {
        return Err(GacError::InvalidRecord(
            "record considers no participants".to_string(),
        ));
    }
    Ok(record.score >= constitutionable_threshold(record.participants_considered))
}

/// Smoothed probability that a cluster agrees with a statement.
///
/// Neutral 0.5 when nobody in the cluster took a side; otherwise the smoothed agree ratio
/// raised to the cluster's participation rate.
pub fn cluster_agreement(
    n_agree: usize,
    n_active: usize,
    cluster_size: usize,
    pseudocount: f64,
) -> f64 {
    if n_active == 0 || cluster_size == 0 {
        return 0.5;
    }
    let p_agree = (n_agree as f64 + pseudocount) / (n_active as f64 + 2.0 * pseudocount);
    p_agree.powf(n_active as f64 / cluster_size as f64)
}

/// Group-aware consensus per statement: the product over clusters of each cluster's
/// agreement probability.
///
/// Statements nobody voted on produce no record. A lone participant scores 1.0, 0.0 or 0.5
/// straight from their vote.
pub fn calculate_gac_scores(
    ctx: &PipelineContext,
    votes: &VoteMatrix,
    imputed: &ImputedMatrix,
    clusters: &ClusterAssignment,
) -> HashMap<String, GacScoreRecord> {
    let n = imputed.n_participants();
    let pseudocount = base_pseudocount(n);
    let sizes = clusters.cluster_sizes();
    let mut scores = HashMap::new();

    for (s, statement_id) in imputed.statement_ids().iter().enumerate() {
        if votes.votes_on_statement(s) == 0 {
            continue;
        }

        if n == 1 {
            let (score, counted) = match votes.get(0, s) {
                Some(v) if v > 0.0 => (1.0, 1),
                Some(v) if v < 0.0 => (0.0, 1),
                _ => (0.5, 0),
            };
            scores.insert(
                statement_id.clone(),
                GacScoreRecord {
                    score,
                    votes_counted: counted,
                    participants_considered: 1,
                },
            );
            continue;
        }

        let mut agree = vec![0usize; sizes.len()];
        let mut active = vec![0usize; sizes.len()];
        for p in 0..n {
            let value = imputed.get(p, s);
            // Exact zero is a recorded pass or an imputation with no evidence
            if value == 0.0 {
                continue;
            }
            let cluster = clusters.label(p);
            active[cluster] += 1;
            if value > 0.0 {
                agree[cluster] += 1;
            }
        }

        let score = (0..sizes.len())
            .map(|c| cluster_agreement(agree[c], active[c], sizes[c], pseudocount))
            .product::<f64>()
            .clamp(0.0, 1.0);

        scores.insert(
            statement_id.clone(),
            GacScoreRecord {
                score,
                votes_counted: active.iter().sum(),
                participants_considered: n,
            },
        );
    }

    debug!(
        "[{}] scored {} of {} statements across {} clusters",
        ctx.poll_id,
        scores.len(),
        imputed.n_statements(),
        sizes.len()
    );

    scores
}
