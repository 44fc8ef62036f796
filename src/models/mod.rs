use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::GacError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: String,
    pub title: String,
    // Community model the poll feeds; carried into change notifications
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub id: String,
    pub poll_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteValue {
    Agree,
    Disagree,
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub participant_id: String,
    pub statement_id: String,
    pub value: VoteValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-statement output of the consensus pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GacScoreRecord {
    pub score: f64,
    pub votes_counted: usize,
    pub participants_considered: usize,
}

/// Persisted scoring state of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementScore {
    pub statement_id: String,
    pub gac_score: Option<f64>,
    pub is_constitutionable: bool,
}

/// Cached agree/disagree/pass tallies for one statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    pub agree: i64,
    pub disagree: i64,
    pub pass: i64,
}

impl Poll {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn new(title: String, model_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            model_id,
            created_at: Utc::now(),
        }
    }
}

impl Participant {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for Participant {
    fn default() -> Self {
        Self::new()
    }
}

impl Statement {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn new(poll_id: &str, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            poll_id: poll_id.to_string(),
            text,
        }
    }
}

impl Vote {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn new(participant_id: &str, statement_id: &str, value: VoteValue) -> Self {
        let now = Utc::now();
        Self {
            participant_id: participant_id.to_string(),
            statement_id: statement_id.to_string(),
            value,
            created_at: now,
            updated_at: now,
        }
    }
}

impl VoteValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteValue::Agree => "AGREE",
            VoteValue::Disagree => "DISAGREE",
            VoteValue::Pass => "PASS",
        }
    }

    /// Numeric cell value: +1 agree, -1 disagree, 0 pass.
    pub fn as_f64(&self) -> f64 {
        match self {
            VoteValue::Agree => 1.0,
            VoteValue::Disagree => -1.0,
            VoteValue::Pass => 0.0,
        }
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteValue {
    type Err = GacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AGREE" => Ok(VoteValue::Agree),
            "DISAGREE" => Ok(VoteValue::Disagree),
            "PASS" => Ok(VoteValue::Pass),
            other => Err(GacError::MalformedInput(format!("Unknown vote value: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_value_parses_wire_names() {
        assert_eq!("AGREE".parse::<VoteValue>().unwrap(), VoteValue::Agree);
        assert_eq!("DISAGREE".parse::<VoteValue>().unwrap(), VoteValue::Disagree);
        assert_eq!("PASS".parse::<VoteValue>().unwrap(), VoteValue::Pass);
        assert!(matches!("agree".parse::<VoteValue>(), Err(GacError::MalformedInput(_))));
    }

    #[test]
    fn score_record_uses_camel_case_and_requires_every_field() {
        let record = GacScoreRecord {
            score: 0.9,
            votes_counted: 4,
            participants_considered: 5,
        };
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["votesCounted"], 4);
        assert_eq!(json["participantsConsidered"], 5);

        let missing = serde_json::from_str::<GacScoreRecord>(r#"{"score": 0.9, "votesCounted": 4}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn vote_value_serializes_uppercase() {
        let json = serde_json::to_string(&VoteValue::Disagree).unwrap();
        assert_eq!(json, "\"DISAGREE\"");
    }
}
