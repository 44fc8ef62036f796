// Offline quality check for the imputation stage: hide a share of recorded votes,
// impute them back and compare against what was actually cast.

use crate::error::GacError;
use crate::voting::PipelineContext;
use crate::voting::imputation::impute_missing_votes;
use crate::voting::matrix::VoteMatrix;
use log::info;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteClass {
    Agree,
    Disagree,
    Pass,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassTally {
    pub correct: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Confusion {
    pub agree: ClassTally,
    pub disagree: ClassTally,
    pub pass: ClassTally,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Distribution {
    pub mean: f64,
    pub median: f64,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixStats {
    pub participants: usize,
    pub statements: usize,
    pub total_cells: usize,
    pub filled_cells: usize,
    pub sparsity: f64,
    pub votes_per_participant: Distribution,
    pub votes_per_statement: Distribution,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImputationMetrics {
    pub held_out: usize,
    /// Agree above 0.5, disagree below -0.5, pass in between.
    pub strict_accuracy: f64,
    /// Classified by sign alone.
    pub loose_accuracy: f64,
    pub rmse: f64,
    pub directional_accuracy: f64,
    /// Mean of |estimate| over correctly signed estimates, 0 for the rest.
    pub weighted_accuracy: f64,
    pub strict_confusion: Confusion,
    pub loose_confusion: Confusion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub test_ratio: f64,
    pub matrix: MatrixStats,
    pub metrics: ImputationMetrics,
}

/// Shape and density of a vote matrix.
pub fn matrix_stats(matrix: &VoteMatrix) -> MatrixStats {
    let total_cells = matrix.n_participants() * matrix.n_statements();
    let filled_cells = matrix.filled_count();
    let per_participant: Vec<usize> = (0..matrix.n_participants())
        .map(|p| matrix.votes_by_participant(p))
        .collect();
    let per_statement: Vec<usize> = (0..matrix.n_statements())
        .map(|s| matrix.votes_on_statement(s))
        .collect();

    MatrixStats {
        participants: matrix.n_participants(),
        statements: matrix.n_statements(),
        total_cells,
        filled_cells,
        sparsity: if total_cells == 0 {
            0.0
        } else {
            1.0 - filled_cells as f64 / total_cells as f64
        },
        votes_per_participant: distribution(&per_participant),
        votes_per_statement: distribution(&per_statement),
    }
}

/// Hold out `test_ratio` of the recorded votes, impute them and score the estimates.
pub fn evaluate_imputation(
    ctx: &PipelineContext,
    matrix: &VoteMatrix,
    test_ratio: f64,
    rng: &mut StdRng,
) -> Result<EvaluationReport, GacError> {
    if !(test_ratio > 0.0 && test_ratio < 1.0) {
        return Err(GacError::MalformedInput(format!(
            "test ratio {} must be strictly between 0 and 1",
            test_ratio
        )));
    }

    let cells = matrix.present_cells();
    let test_size = (cells.len() as f64 * test_ratio).floor() as usize;
    if test_size == 0 {
        return Err(GacError::InsufficientData(format!(
            "{} recorded votes leave nothing to hold out",
            cells.len()
        )));
    }

    let held_out: Vec<(usize, usize)> = sample(rng, cells.len(), test_size)
        .into_iter()
        .map(|i| cells[i])
        .collect();
    let imputed = impute_missing_votes(ctx, &matrix.with_masked(&held_out));

    let mut predicted = Vec::with_capacity(held_out.len());
    let mut truth = Vec::with_capacity(held_out.len());
    for &(p, s) in &held_out {
        if let Some(actual) = matrix.get(p, s) {
            predicted.push(imputed.get(p, s));
            truth.push(actual);
        }
    }

    let report = EvaluationReport {
        test_ratio,
        matrix: matrix_stats(matrix),
        metrics: score_predictions(&predicted, &truth),
    };
    info!(
        "[{}] imputation on {} held-out votes: loose accuracy {:.3}, rmse {:.3}",
        ctx.poll_id, report.metrics.held_out, report.metrics.loose_accuracy, report.metrics.rmse
    );
    Ok(report)
}

/// Compare continuous estimates against the votes actually cast.
pub fn score_predictions(predicted: &[f64], truth: &[f64]) -> ImputationMetrics {
    let n = predicted.len().min(truth.len());
    let mut strict_correct = 0usize;
    let mut loose_correct = 0usize;
    let mut directional = 0usize;
    let mut weighted = 0.0;
    let mut squared_error = 0.0;
    let mut strict_confusion = Confusion::default();
    let mut loose_confusion = Confusion::default();

    for (&estimate, &actual) in predicted.iter().zip(truth).take(n) {
        let actual_class = classify(actual, 0.0);
        let strict = classify(estimate, 0.5);
        let loose = classify(estimate, 0.0);

        strict_correct += usize::from(strict == actual_class);
        loose_correct += usize::from(loose == actual_class);
        tally(&mut strict_confusion, actual_class, strict == actual_class);
        tally(&mut loose_confusion, actual_class, loose == actual_class);

        if sign(estimate) == sign(actual) {
            directional += 1;
            weighted += estimate.abs();
        }
        squared_error += (estimate - actual).powi(2);
    }

    let ratio = |count: f64| if n == 0 { 0.0 } else { count / n as f64 };
    ImputationMetrics {
        held_out: n,
        strict_accuracy: ratio(strict_correct as f64),
        loose_accuracy: ratio(loose_correct as f64),
        rmse: ratio(squared_error).sqrt(),
        directional_accuracy: ratio(directional as f64),
        weighted_accuracy: ratio(weighted),
        strict_confusion,
        loose_confusion,
    }
}

fn classify(value: f64, band: f64) -> VoteClass {
    if value > band {
        VoteClass::Agree
    } else if value < -band {
        VoteClass::Disagree
    } else {
        VoteClass::Pass
    }
}

fn sign(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

fn tally(confusion: &mut Confusion, actual: VoteClass, correct: bool) {
    let entry = match actual {
        VoteClass::Agree => &mut confusion.agree,
        VoteClass::Disagree => &mut confusion.disagree,
        VoteClass::Pass => &mut confusion.pass,
    };
    entry.total += 1;
    entry.correct += usize::from(correct);
}

fn distribution(counts: &[usize]) -> Distribution {
    if counts.is_empty() {
        return Distribution {
            mean: 0.0,
            median: 0.0,
            min: 0,
            max: 0,
        };
    }
    let mut sorted = counts.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    };
    Distribution {
        mean: sorted.iter().sum::<usize>() as f64 / sorted.len() as f64,
        median,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
    }
}
