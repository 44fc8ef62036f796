use crate::error::GacError;
use crate::models::{
    GacScoreRecord, Participant, Poll, Statement, StatementScore, Vote, VoteCounts, VoteValue,
};
use crate::voting::is_constitutionable;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use sqlx::{
    Row, Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};
use std::collections::HashMap;
use std::str::FromStr;

pub struct Database {
    pool: SqlitePool,
}

/// Everything needed to score one poll.
#[derive(Debug, Clone)]
pub struct PollData {
    pub poll: Poll,
    pub statements: Vec<Statement>,
    pub participants: Vec<Participant>,
    pub votes: Vec<Vote>,
}

/// A statement whose cached vote counts were corrected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteCountUpdate {
    pub statement_id: String,
    pub old: VoteCounts,
    pub new: VoteCounts,
}

// Fixed-width so that text comparison in SQL is chronological
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>, GacError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GacError::Storage(format!("Failed to parse {}: {}", column, e)))
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, GacError> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Self::init_schema(&pool).await?;
        info!("Connected to {}", database_url);

        Ok(Self { pool })
    }

    /// Private in-memory database. One connection that never expires, since every
    /// connection to `:memory:` opens a separate empty database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, GacError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), GacError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model_id TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS statements (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                gac_score REAL,
                last_calculated_at TEXT,
                is_constitutionable BOOLEAN NOT NULL DEFAULT FALSE,
                agree_count INTEGER NOT NULL DEFAULT 0,
                disagree_count INTEGER NOT NULL DEFAULT 0,
                pass_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                participant_id TEXT NOT NULL,
                statement_id TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (participant_id, statement_id),
                FOREIGN KEY (participant_id) REFERENCES participants(id) ON DELETE CASCADE,
                FOREIGN KEY (statement_id) REFERENCES statements(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_statements_poll ON statements(poll_id);")
            .execute(pool)
            .await?;

        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn create_poll(&self, poll: &Poll) -> Result<(), GacError> {
        sqlx::query(
            r#"
            INSERT INTO polls (id, title, model_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.title)
        .bind(&poll.model_id)
        .bind(format_timestamp(&poll.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn create_statement(&self, statement: &Statement) -> Result<(), GacError> {
        sqlx::query(
            r#"
            INSERT INTO statements (id, poll_id, text)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&statement.id)
        .bind(&statement.poll_id)
        .bind(&statement.text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn create_participant(&self, participant: &Participant) -> Result<(), GacError> {
        sqlx::query("INSERT OR IGNORE INTO participants (id) VALUES (?)")
            .bind(&participant.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or replace a participant's vote on a statement. A replaced vote keeps its
    /// original `created_at`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn save_vote(&self, vote: &Vote) -> Result<(), GacError> {
        sqlx::query(
            r#"
            INSERT INTO votes (participant_id, statement_id, value, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(participant_id, statement_id)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(&vote.participant_id)
        .bind(&vote.statement_id)
        .bind(vote.value.as_str())
        .bind(format_timestamp(&vote.created_at))
        .bind(format_timestamp(&vote.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Polls with a voted statement that was never scored or has votes newer than its score.
    pub async fn get_polls_with_changes(&self) -> Result<Vec<String>, GacError> {
        let polls = sqlx::query(
            r#"
            SELECT DISTINCT s.poll_id
            FROM statements s
            JOIN votes v ON v.statement_id = s.id
            WHERE s.last_calculated_at IS NULL
               OR v.created_at > s.last_calculated_at
               OR v.updated_at > s.last_calculated_at
            ORDER BY s.poll_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("poll_id"))
        .collect();
        Ok(polls)
    }

    pub async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, GacError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, model_id, created_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Poll {
                id: row.get("id"),
                title: row.get("title"),
                model_id: row.get("model_id"),
                created_at: parse_timestamp(&row.get::<String, _>("created_at"), "created_at")?,
            })
        })
        .transpose()
    }

    /// Statements of a poll, the votes cast on them and the participants who cast them.
    pub async fn get_poll_data(&self, poll_id: &str) -> Result<PollData, GacError> {
        let poll = self
            .get_poll(poll_id)
            .await?
            .ok_or_else(|| GacError::Storage(format!("Poll {} not found", poll_id)))?;

        let statements = sqlx::query(
            r#"
            SELECT id, poll_id, text
            FROM statements
            WHERE poll_id = ?
            ORDER BY rowid
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Statement {
            id: row.get("id"),
            poll_id: row.get("poll_id"),
            text: row.get("text"),
        })
        .collect();

        let participants = sqlx::query(
            r#"
            SELECT DISTINCT p.id
            FROM participants p
            JOIN votes v ON v.participant_id = p.id
            JOIN statements s ON s.id = v.statement_id
            WHERE s.poll_id = ?
            ORDER BY p.id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Participant::with_id(row.get::<String, _>("id")))
        .collect();

        let votes = sqlx::query(
            r#"
            SELECT v.participant_id, v.statement_id, v.value, v.created_at, v.updated_at
            FROM votes v
            JOIN statements s ON s.id = v.statement_id
            WHERE s.poll_id = ?
            ORDER BY v.participant_id, v.statement_id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(Vote {
                participant_id: row.get("participant_id"),
                statement_id: row.get("statement_id"),
                value: VoteValue::from_str(&row.get::<String, _>("value"))?,
                created_at: parse_timestamp(&row.get::<String, _>("created_at"), "created_at")?,
                updated_at: parse_timestamp(&row.get::<String, _>("updated_at"), "updated_at")?,
            })
        })
        .collect::<Result<Vec<_>, GacError>>()?;

        Ok(PollData {
            poll,
            statements,
            participants,
            votes,
        })
    }

    pub async fn get_statement_scores(&self, poll_id: &str) -> Result<Vec<StatementScore>, GacError> {
        let scores = sqlx::query(
            r#"
            SELECT id, gac_score, is_constitutionable
            FROM statements
            WHERE poll_id = ?
            ORDER BY rowid
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| StatementScore {
            statement_id: row.get("id"),
            gac_score: row.get("gac_score"),
            is_constitutionable: row.get("is_constitutionable"),
        })
        .collect();
        Ok(scores)
    }

    /// Persist a poll's scores in one transaction. Statements missing from `scores` are
    /// reset to no score, no timestamp and not constitutionable.
    pub async fn update_statement_scores(
        &self,
        poll_id: &str,
        statements: &[Statement],
        scores: &HashMap<String, GacScoreRecord>,
        now: DateTime<Utc>,
    ) -> Result<usize, GacError> {
        let calculated_at = format_timestamp(&now);
        let mut tx = self.pool.begin().await?;
        let mut scored = 0;

        for statement in statements {
            let (score, timestamp, constitutionable) = match scores.get(&statement.id) {
                Some(record) => {
                    scored += 1;
                    (
                        Some(record.score),
                        Some(calculated_at.as_str()),
                        is_constitutionable(record)?,
                    )
                }
                None => (None, None, false),
            };

            sqlx::query(
                r#"
                UPDATE statements
                SET gac_score = ?, last_calculated_at = ?, is_constitutionable = ?
                WHERE id = ? AND poll_id = ?
                "#,
            )
            .bind(score)
            .bind(timestamp)
            .bind(constitutionable)
            .bind(&statement.id)
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Stored {} scores and reset {} statements for poll {}",
            scored,
            statements.len() - scored,
            poll_id
        );
        Ok(scored)
    }

    /// Recompute cached vote counts from the votes table, writing only those that drifted.
    pub async fn sync_vote_counts(&self) -> Result<Vec<VoteCountUpdate>, GacError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.agree_count, s.disagree_count, s.pass_count,
                   COALESCE(SUM(CASE WHEN v.value = 'AGREE' THEN 1 ELSE 0 END), 0) AS agree,
                   COALESCE(SUM(CASE WHEN v.value = 'DISAGREE' THEN 1 ELSE 0 END), 0) AS disagree,
                   COALESCE(SUM(CASE WHEN v.value = 'PASS' THEN 1 ELSE 0 END), 0) AS pass
            FROM statements s
            LEFT JOIN votes v ON v.statement_id = s.id
            GROUP BY s.id
            ORDER BY s.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let updates: Vec<VoteCountUpdate> = rows
            .into_iter()
            .map(|row| VoteCountUpdate {
                statement_id: row.get("id"),
                old: VoteCounts {
                    agree: row.get("agree_count"),
                    disagree: row.get("disagree_count"),
                    pass: row.get("pass_count"),
                },
                new: VoteCounts {
                    agree: row.get("agree"),
                    disagree: row.get("disagree"),
                    pass: row.get("pass"),
                },
            })
            .filter(|update| update.old != update.new)
            .collect();

        if updates.is_empty() {
            return Ok(updates);
        }

        let mut tx = self.pool.begin().await?;
        for update in &updates {
            sqlx::query(
                r#"
                UPDATE statements
                SET agree_count = ?, disagree_count = ?, pass_count = ?
                WHERE id = ?
                "#,
            )
            .bind(update.new.agree)
            .bind(update.new.disagree)
            .bind(update.new.pass)
            .bind(&update.statement_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!("Synced vote counts for {} statements", updates.len());
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Fixture {
        db: Database,
        poll: Poll,
        statements: Vec<Statement>,
        participants: Vec<Participant>,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let poll = Poll::new("Test poll".to_string(), Some("model-1".to_string()));
        db.create_poll(&poll).await.unwrap();

        let mut statements = Vec::new();
        for i in 1..=3 {
            let statement = Statement::new(&poll.id, format!("Statement {}", i));
            db.create_statement(&statement).await.unwrap();
            statements.push(statement);
        }

        let mut participants = Vec::new();
        for i in 1..=3 {
            let participant = Participant::with_id(format!("participant{}", i));
            db.create_participant(&participant).await.unwrap();
            participants.push(participant);
        }

        Fixture {
            db,
            poll,
            statements,
            participants,
        }
    }

    fn record(score: f64, n: usize) -> GacScoreRecord {
        GacScoreRecord {
            score,
            votes_counted: n,
            participants_considered: n,
        }
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc::now();
        let late = early + Duration::milliseconds(1);
        let (a, b) = (format_timestamp(&early), format_timestamp(&late));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(a.ends_with('Z'));
        assert_eq!(parse_timestamp(&a, "t").unwrap().timestamp_micros(), early.timestamp_micros());
    }

    #[tokio::test]
    async fn poll_data_round_trips() {
        let f = fixture().await;
        let (p1, p2) = (&f.participants[0], &f.participants[1]);
        f.db.save_vote(&Vote::new(&p1.id, &f.statements[0].id, VoteValue::Agree)).await.unwrap();
        f.db.save_vote(&Vote::new(&p2.id, &f.statements[1].id, VoteValue::Pass)).await.unwrap();

        let data = f.db.get_poll_data(&f.poll.id).await.unwrap();
        assert_eq!(data.poll.model_id.as_deref(), Some("model-1"));
        assert_eq!(data.statements, f.statements);
        // participant3 never voted
        assert_eq!(data.participants, vec![p1.clone(), p2.clone()]);
        assert_eq!(data.votes.len(), 2);
        assert_eq!(data.votes[0].value, VoteValue::Agree);
        assert_eq!(data.votes[1].value, VoteValue::Pass);
    }

    #[tokio::test]
    async fn unknown_poll_is_an_error() {
        let f = fixture().await;
        assert!(f.db.get_poll("missing").await.unwrap().is_none());
        assert!(matches!(f.db.get_poll_data("missing").await, Err(GacError::Storage(_))));
    }

    #[tokio::test]
    async fn saving_again_replaces_the_vote() {
        let f = fixture().await;
        let participant = &f.participants[0].id;
        let statement = &f.statements[0].id;
        let first = Vote::new(participant, statement, VoteValue::Agree);
        f.db.save_vote(&first).await.unwrap();

        let mut second = Vote::new(participant, statement, VoteValue::Disagree);
        second.updated_at = first.updated_at + Duration::seconds(5);
        f.db.save_vote(&second).await.unwrap();

        let votes = f.db.get_poll_data(&f.poll.id).await.unwrap().votes;
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].value, VoteValue::Disagree);
        assert_eq!(votes[0].created_at.timestamp_micros(), first.created_at.timestamp_micros());
        assert_eq!(votes[0].updated_at.timestamp_micros(), second.updated_at.timestamp_micros());
    }

    #[tokio::test]
    async fn unreadable_vote_value_is_malformed() {
        let f = fixture().await;
        sqlx::query(
            "INSERT INTO votes (participant_id, statement_id, value, created_at, updated_at) VALUES (?, ?, 'MAYBE', ?, ?)",
        )
        .bind(&f.participants[0].id)
        .bind(&f.statements[0].id)
        .bind(format_timestamp(&Utc::now()))
        .bind(format_timestamp(&Utc::now()))
        .execute(f.db.pool())
        .await
        .unwrap();

        assert!(matches!(
            f.db.get_poll_data(&f.poll.id).await,
            Err(GacError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn change_detection_follows_votes_and_scores() {
        let f = fixture().await;
        assert!(f.db.get_polls_with_changes().await.unwrap().is_empty());

        let vote = Vote::new(&f.participants[0].id, &f.statements[0].id, VoteValue::Agree);
        f.db.save_vote(&vote).await.unwrap();
        assert_eq!(f.db.get_polls_with_changes().await.unwrap(), vec![f.poll.id.clone()]);

        let scores = HashMap::from([(f.statements[0].id.clone(), record(1.0, 1))]);
        let calculated = vote.updated_at + Duration::seconds(1);
        f.db.update_statement_scores(&f.poll.id, &f.statements, &scores, calculated)
            .await
            .unwrap();
        assert!(f.db.get_polls_with_changes().await.unwrap().is_empty());

        let mut newer = Vote::new(&f.participants[1].id, &f.statements[0].id, VoteValue::Disagree);
        newer.created_at = calculated + Duration::seconds(1);
        newer.updated_at = newer.created_at;
        f.db.save_vote(&newer).await.unwrap();
        assert_eq!(f.db.get_polls_with_changes().await.unwrap(), vec![f.poll.id.clone()]);
    }

    #[tokio::test]
    async fn scores_are_written_and_unscored_statements_reset() {
        let f = fixture().await;
        let now = Utc::now();
        let all = HashMap::from([
            (f.statements[0].id.clone(), record(1.0, 3)),
            (f.statements[1].id.clone(), record(0.2, 3)),
        ]);
        assert_eq!(
            f.db.update_statement_scores(&f.poll.id, &f.statements, &all, now).await.unwrap(),
            2
        );

        let stored = f.db.get_statement_scores(&f.poll.id).await.unwrap();
        assert_eq!(stored[0].gac_score, Some(1.0));
        assert!(stored[0].is_constitutionable);
        assert_eq!(stored[1].gac_score, Some(0.2));
        assert!(!stored[1].is_constitutionable);
        assert_eq!(stored[2].gac_score, None);

        // statement1 loses its votes
        let fewer = HashMap::from([(f.statements[1].id.clone(), record(0.2, 3))]);
        f.db.update_statement_scores(&f.poll.id, &f.statements, &fewer, now).await.unwrap();
        let stored = f.db.get_statement_scores(&f.poll.id).await.unwrap();
        assert_eq!(stored[0].gac_score, None);
        assert!(!stored[0].is_constitutionable);

        let calculated: Option<String> =
            sqlx::query_scalar("SELECT last_calculated_at FROM statements WHERE id = ?")
                .bind(&f.statements[0].id)
                .fetch_one(f.db.pool())
                .await
                .unwrap();
        assert_eq!(calculated, None);
    }

    #[tokio::test]
    async fn invalid_record_rolls_back_the_batch() {
        let f = fixture().await;
        let scores = HashMap::from([
            (f.statements[0].id.clone(), record(1.0, 3)),
            (f.statements[1].id.clone(), record(f64::NAN, 3)),
        ]);
        let result = f
            .db
            .update_statement_scores(&f.poll.id, &f.statements, &scores, Utc::now())
            .await;
        assert!(matches!(result, Err(GacError::InvalidRecord(_))));

        let stored = f.db.get_statement_scores(&f.poll.id).await.unwrap();
        assert!(stored.iter().all(|s| s.gac_score.is_none()));
    }

    #[tokio::test]
    async fn vote_counts_sync_only_drifted_statements() {
        let f = fixture().await;
        let s1 = &f.statements[0].id;
        for (participant, value) in f.participants.iter().zip([VoteValue::Agree, VoteValue::Agree, VoteValue::Pass]) {
            f.db.save_vote(&Vote::new(&participant.id, s1, value)).await.unwrap();
        }

        let updates = f.db.sync_vote_counts().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].statement_id, *s1);
        assert_eq!(updates[0].old, VoteCounts::default());
        assert_eq!(
            updates[0].new,
            VoteCounts {
                agree: 2,
                disagree: 0,
                pass: 1
            }
        );

        assert!(f.db.sync_vote_counts().await.unwrap().is_empty());
    }
}
