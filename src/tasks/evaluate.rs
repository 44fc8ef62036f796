use crate::db::Database;
use crate::error::GacError;
use crate::voting::PipelineContext;
use crate::voting::evaluation::{EvaluationReport, evaluate_imputation};
use crate::voting::matrix::VoteMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;

pub const DEFAULT_TEST_RATIO: f64 = 0.1;

/// Measure how well imputation recovers a poll's own votes.
pub async fn evaluate_poll(
    db: &Database,
    ctx: &PipelineContext,
    test_ratio: f64,
) -> Result<EvaluationReport, GacError> {
    let data = db.get_poll_data(&ctx.poll_id).await?;
    let matrix = VoteMatrix::build(ctx, &data.participants, &data.statements, &data.votes)?;
    let mut rng = StdRng::seed_from_u64(ctx.seed);
    evaluate_imputation(ctx, &matrix, test_ratio, &mut rng)
}
