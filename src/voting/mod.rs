pub mod clustering;
pub mod evaluation;
pub mod gac;
pub mod imputation;
pub mod matrix;
pub mod pca;

use crate::error::GacError;
use crate::models::{GacScoreRecord, Participant, Statement, Vote};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};

pub use gac::is_constitutionable;

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_KMEANS_RESTARTS: usize = 3;

/// Per-run context handed to every pipeline stage: the poll being scored (used as the
/// log prefix) and the clustering seed.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub poll_id: String,
    pub seed: u64,
    pub kmeans_restarts: usize,
}

impl PipelineContext {
    pub fn new(poll_id: impl Into<String>) -> Self {
        Self {
            poll_id: poll_id.into(),
            seed: DEFAULT_SEED,
            kmeans_restarts: DEFAULT_KMEANS_RESTARTS,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_kmeans_restarts(mut self, restarts: usize) -> Self {
        self.kmeans_restarts = restarts;
        self
    }
}

// Scores for one poll plus what the clustering found
#[derive(Debug, Clone)]
pub struct PollResults {
    pub scores: HashMap<String, GacScoreRecord>,
    pub cluster_sizes: Vec<usize>,
    pub components: Option<usize>,
}

impl PollResults {
    /// Ids of statements whose score clears the constitutionable threshold.
    pub fn constitutionable_ids(&self) -> HashSet<String> {
        self.scores
            .iter()
            .filter(|(_, record)| is_constitutionable(record).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Run the full pipeline for one poll: vote matrix, imputation, PCA, clustering, scoring.
///
/// Returns `InsufficientData` when there is nothing to score; callers skip the poll.
pub fn calculate_results(
    ctx: &PipelineContext,
    participants: &[Participant],
    statements: &[Statement],
    votes: &[Vote],
) -> Result<PollResults, GacError> {
    if participants.is_empty() || statements.is_empty() || votes.is_empty() {
        return Err(GacError::InsufficientData(format!(
            "{} participants, {} statements, {} votes",
            participants.len(),
            statements.len(),
            votes.len()
        )));
    }

    let vote_matrix = matrix::VoteMatrix::build(ctx, participants, statements, votes)?;
    if vote_matrix.is_empty() || vote_matrix.is_all_missing() {
        return Err(GacError::InsufficientData(
            "vote matrix has no recorded votes".to_string(),
        ));
    }

    let imputed = imputation::impute_missing_votes(ctx, &vote_matrix);
    let projection = pca::reduce_dimensions(ctx, &imputed.to_rows());

    let mut rng = StdRng::seed_from_u64(ctx.seed);
    let clusters = clustering::cluster_participants(ctx, &projection.points, &mut rng);
    let scores = gac::calculate_gac_scores(ctx, &vote_matrix, &imputed, &clusters);

    info!(
        "[{}] scored {} statements from {} participants in {} clusters",
        ctx.poll_id,
        scores.len(),
        vote_matrix.n_participants(),
        clusters.cluster_count()
    );

    Ok(PollResults {
        scores,
        cluster_sizes: clusters.cluster_sizes(),
        components: projection.components,
    })
}
