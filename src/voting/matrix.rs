use crate::error::GacError;
use crate::models::{Participant, Statement, Vote};
use crate::voting::PipelineContext;
use log::debug;
use std::collections::{HashMap, HashSet};

/// Participant x statement grid of vote values with an explicit presence mask.
///
/// Cells hold +1 (agree), -1 (disagree) or 0 (pass) when present. A missing cell
/// has `present == false` and its stored value is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteMatrix {
    participant_ids: Vec<String>,
    statement_ids: Vec<String>,
    values: Vec<f64>,
    present: Vec<bool>,
}

/// Vote matrix with every missing cell replaced by a continuous estimate in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImputedMatrix {
    participant_ids: Vec<String>,
    statement_ids: Vec<String>,
    values: Vec<f64>,
}

impl VoteMatrix {
    /// Assemble the matrix for one poll.
    ///
    /// Votes naming an unknown participant or statement are ignored. Duplicate ids
    /// and statements spanning several polls are structural misuse and rejected.
    pub fn build(
        ctx: &PipelineContext,
        participants: &[Participant],
        statements: &[Statement],
        votes: &[Vote],
    ) -> Result<Self, GacError> {
        let participant_ids: Vec<String> = participants.iter().map(|p| p.id.clone()).collect();
        let statement_ids: Vec<String> = statements.iter().map(|s| s.id.clone()).collect();

        let participant_index = index_ids(participants.iter().map(|p| p.id.as_str()), "participant")?;
        let statement_index = index_ids(statements.iter().map(|s| s.id.as_str()), "statement")?;

        let polls: HashSet<&str> = statements.iter().map(|s| s.poll_id.as_str()).collect();
        if polls.len() > 1 {
            return Err(GacError::MalformedInput(format!(
                "statements span {} polls, expected one",
                polls.len()
            )));
        }

        let cols = statement_ids.len();
        let mut matrix = Self {
            values: vec![0.0; participant_ids.len() * cols],
            present: vec![false; participant_ids.len() * cols],
            participant_ids,
            statement_ids,
        };

        let mut ignored = 0usize;
        for vote in votes {
            let row = participant_index.get(vote.participant_id.as_str());
            let col = statement_index.get(vote.statement_id.as_str());
            match (row, col) {
                (Some(&row), Some(&col)) => {
                    let idx = row * cols + col;
                    if matrix.present[idx] {
                        debug!(
                            "[{}] duplicate vote by {} on {}, keeping the later one",
                            ctx.poll_id, vote.participant_id, vote.statement_id
                        );
                    }
                    matrix.values[idx] = vote.value.as_f64();
                    matrix.present[idx] = true;
                }
                _ => ignored += 1,
            }
        }

        if ignored > 0 {
            debug!("[{}] ignored {} votes with unknown participant or statement", ctx.poll_id, ignored);
        }
        debug!(
            "[{}] built {}x{} vote matrix with {} missing cells",
            ctx.poll_id,
            matrix.n_participants(),
            matrix.n_statements(),
            matrix.missing_count()
        );

        Ok(matrix)
    }

    /// Build directly from rows of optional cell values. Rows must all have one entry per statement.
    #[cfg(test)]
    pub fn from_rows(
        participant_ids: Vec<String>,
        statement_ids: Vec<String>,
        rows: &[Vec<Option<f64>>],
    ) -> Result<Self, GacError> {
        if rows.len() != participant_ids.len() {
            return Err(GacError::MalformedInput(format!(
                "{} rows for {} participants",
                rows.len(),
                participant_ids.len()
            )));
        }
        let cols = statement_ids.len();
        let mut values = Vec::with_capacity(rows.len() * cols);
        let mut present = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(GacError::MalformedInput(format!(
                    "row has {} cells for {} statements",
                    row.len(),
                    cols
                )));
            }
            for cell in row {
                values.push(cell.unwrap_or(0.0));
                present.push(cell.is_some());
            }
        }
        Ok(Self {
            participant_ids,
            statement_ids,
            values,
            present,
        })
    }

    pub fn n_participants(&self) -> usize {
        self.participant_ids.len()
    }

    pub fn n_statements(&self) -> usize {
        self.statement_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participant_ids.is_empty() || self.statement_ids.is_empty()
    }

    pub fn is_all_missing(&self) -> bool {
        !self.present.iter().any(|&p| p)
    }

    pub fn is_present(&self, participant: usize, statement: usize) -> bool {
        self.present[participant * self.n_statements() + statement]
    }

    pub fn get(&self, participant: usize, statement: usize) -> Option<f64> {
        let idx = participant * self.n_statements() + statement;
        if self.present[idx] {
            Some(self.values[idx])
        } else {
            None
        }
    }

    /// Cell value with missing read as 0. Only for similarity arithmetic.
    pub fn value_or_zero(&self, participant: usize, statement: usize) -> f64 {
        self.get(participant, statement).unwrap_or(0.0)
    }

    pub fn votes_on_statement(&self, statement: usize) -> usize {
        (0..self.n_participants())
            .filter(|&p| self.is_present(p, statement))
            .count()
    }

    pub fn votes_by_participant(&self, participant: usize) -> usize {
        (0..self.n_statements())
            .filter(|&s| self.is_present(participant, s))
            .count()
    }

    pub fn filled_count(&self) -> usize {
        self.present.iter().filter(|&&p| p).count()
    }

    pub fn missing_count(&self) -> usize {
        self.present.len() - self.filled_count()
    }

    /// Positions of every present cell in row-major order.
    pub fn present_cells(&self) -> Vec<(usize, usize)> {
        let cols = self.n_statements();
        self.present
            .iter()
            .enumerate()
            .filter(|&(_, &p)| p)
            .map(|(idx, _)| (idx / cols, idx % cols))
            .collect()
    }

    /// Copy of the matrix with the given cells marked missing.
    pub fn with_masked(&self, cells: &[(usize, usize)]) -> Self {
        let mut masked = self.clone();
        let cols = self.n_statements();
        for &(row, col) in cells {
            masked.present[row * cols + col] = false;
        }
        masked
    }
}

impl ImputedMatrix {
    pub(crate) fn new(source: &VoteMatrix, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), source.present.len());
        Self {
            participant_ids: source.participant_ids.clone(),
            statement_ids: source.statement_ids.clone(),
            values,
        }
    }

    pub fn statement_ids(&self) -> &[String] {
        &self.statement_ids
    }

    pub fn n_participants(&self) -> usize {
        self.participant_ids.len()
    }

    pub fn n_statements(&self) -> usize {
        self.statement_ids.len()
    }

    pub fn get(&self, participant: usize, statement: usize) -> f64 {
        self.values[participant * self.n_statements() + statement]
    }

    pub fn row(&self, participant: usize) -> &[f64] {
        let cols = self.n_statements();
        &self.values[participant * cols..(participant + 1) * cols]
    }

    /// Dense rows, one per participant.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.n_participants()).map(|p| self.row(p).to_vec()).collect()
    }
}

fn index_ids<'a>(
    ids: impl Iterator<Item = &'a str>,
    kind: &str,
) -> Result<HashMap<&'a str, usize>, GacError> {
    let mut index = HashMap::new();
    for (i, id) in ids.enumerate() {
        if index.insert(id, i).is_some() {
            return Err(GacError::MalformedInput(format!("duplicate {} id: {}", kind, id)));
        }
    }
    Ok(index)
}
