use crate::config::Config;
use crate::db::{Database, PollData};
use crate::error::GacError;
use crate::notify::{
    ChangeNotifier, GacScoresUpdated, changed_constitutionable_set, changed_statements,
    constitutionable_set,
};
use crate::voting::{PipelineContext, PollResults, calculate_results, is_constitutionable};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::interval;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to score; stored scores are left as they were.
    Skipped { reason: String },
    /// Scores computed and logged only.
    DryRun { scored: usize, constitutionable: usize },
    Updated {
        scored: usize,
        reset: usize,
        constitutionable: usize,
        notified: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub polls: usize,
    pub updated: usize,
    pub dry_run: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notified: usize,
    pub vote_counts_synced: usize,
}

/// Score one poll, persist the result and notify if its constitutionable set changed.
///
/// A failed notification is logged and does not undo the stored scores.
pub async fn process_poll(
    db: &Database,
    notifier: &dyn ChangeNotifier,
    poll_id: &str,
    ctx: &PipelineContext,
    dry_run: bool,
) -> Result<PollOutcome, GacError> {
    // Taken before the fetch; votes saved after it must stay newer than last_calculated_at
    let started = Utc::now();
    let data = db.get_poll_data(poll_id).await?;
    info!(
        "[{}] {} statements, {} participants, {} votes",
        poll_id,
        data.statements.len(),
        data.participants.len(),
        data.votes.len()
    );

    let results = match calculate_results(ctx, &data.participants, &data.statements, &data.votes) {
        Ok(results) => results,
        Err(GacError::InsufficientData(reason)) => {
            warn!("[{}] skipping: {}", poll_id, reason);
            return Ok(PollOutcome::Skipped { reason });
        }
        Err(e) => return Err(e),
    };
    info!(
        "[{}] cluster sizes {:?}, principal components {}",
        poll_id,
        results.cluster_sizes,
        results
            .components
            .map_or_else(|| "none".to_string(), |c| c.to_string())
    );

    if dry_run {
        let mut ids: Vec<&String> = results.scores.keys().collect();
        ids.sort();
        for id in ids {
            let record = &results.scores[id];
            info!(
                "[{}] dry run: {} score {:.4} ({} votes counted, constitutionable: {})",
                poll_id,
                id,
                record.score,
                record.votes_counted,
                is_constitutionable(record)?
            );
        }
        return Ok(PollOutcome::DryRun {
            scored: results.scores.len(),
            constitutionable: results.constitutionable_ids().len(),
        });
    }

    store_and_notify(db, notifier, &data, &results, started).await
}

async fn store_and_notify(
    db: &Database,
    notifier: &dyn ChangeNotifier,
    data: &PollData,
    results: &PollResults,
    calculated_at: DateTime<Utc>,
) -> Result<PollOutcome, GacError> {
    let poll_id = data.poll.id.as_str();
    let before = db.get_statement_scores(poll_id).await?;
    let scored = db
        .update_statement_scores(poll_id, &data.statements, &results.scores, calculated_at)
        .await?;
    let after = db.get_statement_scores(poll_id).await?;

    let notified = if changed_constitutionable_set(
        &constitutionable_set(&before),
        &constitutionable_set(&after),
    ) {
        let event = GacScoresUpdated::new(
            poll_id,
            data.poll.model_id.clone(),
            Utc::now(),
            changed_statements(&before, &after),
        );
        info!(
            "[{}] constitutionable set changed ({} statements), notifying",
            poll_id,
            event.changed_statements.len()
        );
        match notifier.notify(&event).await {
            Ok(()) => true,
            Err(e) => {
                error!("[{}] notification failed: {}", poll_id, e);
                false
            }
        }
    } else {
        debug!("[{}] constitutionable set unchanged", poll_id);
        false
    };

    Ok(PollOutcome::Updated {
        scored,
        reset: data.statements.len() - scored,
        constitutionable: results.constitutionable_ids().len(),
        notified,
    })
}

/// One batch: every poll with new votes (or the configured poll), then a vote-count sync.
/// A failing poll is logged and does not stop the others.
pub async fn run_gac_updates(
    db: &Database,
    notifier: &dyn ChangeNotifier,
    config: &Config,
) -> Result<BatchSummary, GacError> {
    let poll_ids = match &config.poll_id {
        Some(poll_id) => vec![poll_id.clone()],
        None => db.get_polls_with_changes().await?,
    };

    let mut summary = BatchSummary {
        polls: poll_ids.len(),
        ..Default::default()
    };
    if poll_ids.is_empty() {
        debug!("No polls with new votes");
    } else {
        info!("Processing {} poll(s)", poll_ids.len());
    }

    for poll_id in &poll_ids {
        let ctx = PipelineContext::new(poll_id)
            .with_seed(config.random_seed)
            .with_kmeans_restarts(config.kmeans_restarts);

        match process_poll(db, notifier, poll_id, &ctx, config.dry_run).await {
            Ok(PollOutcome::Skipped { reason }) => {
                debug!("Skipped poll {}: {}", poll_id, reason);
                summary.skipped += 1;
            }
            Ok(PollOutcome::DryRun {
                scored,
                constitutionable,
            }) => {
                info!(
                    "Dry run for poll {}: {} scored, {} constitutionable",
                    poll_id, scored, constitutionable
                );
                summary.dry_run += 1;
            }
            Ok(PollOutcome::Updated {
                scored,
                reset,
                constitutionable,
                notified,
            }) => {
                info!(
                    "Updated poll {}: {} scored, {} reset, {} constitutionable",
                    poll_id, scored, reset, constitutionable
                );
                summary.updated += 1;
                summary.notified += usize::from(notified);
            }
            Err(e) => {
                error!("Error processing poll {}: {}", poll_id, e);
                summary.failed += 1;
            }
        }
    }

    if !config.dry_run {
        match db.sync_vote_counts().await {
            Ok(updates) => summary.vote_counts_synced = updates.len(),
            Err(e) => error!("Failed to sync vote counts: {}", e),
        }
    }

    info!(
        "Batch done: {} of {} polls updated, {} dry run, {} skipped, {} failed, {} notified, {} vote counts synced",
        summary.updated,
        summary.polls,
        summary.dry_run,
        summary.skipped,
        summary.failed,
        summary.notified,
        summary.vote_counts_synced
    );
    Ok(summary)
}

pub async fn gac_update_task(
    database: Arc<Database>,
    notifier: Arc<dyn ChangeNotifier>,
    config: Config,
) {
    let period = config.update_interval_seconds.max(1);
    info!("Starting GAC update task, running every {} seconds", period);
    let mut interval = interval(StdDuration::from_secs(period));

    loop {
        interval.tick().await;
        if let Err(e) = run_gac_updates(&database, notifier.as_ref(), &config).await {
            error!("GAC update batch failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, Poll, Statement, Vote, VoteValue};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use VoteValue::{Agree, Disagree};

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<GacScoresUpdated>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn events(&self) -> Vec<GacScoresUpdated> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeNotifier for RecordingNotifier {
        async fn notify(&self, event: &GacScoresUpdated) -> Result<(), GacError> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(GacError::Delivery("status 500".to_string()));
            }
            Ok(())
        }
    }

    struct Seeded {
        poll: Poll,
        statements: Vec<Statement>,
        participants: Vec<Participant>,
    }

    // Ten participants: everyone agrees on the first statement, a 6/4 split on the
    // second, nobody votes on the third.
    async fn seed_poll(db: &Database, tag: &str) -> Seeded {
        let poll = Poll::new(format!("Poll {}", tag), Some(format!("model-{}", tag)));
        db.create_poll(&poll).await.unwrap();

        let mut statements = Vec::new();
        for i in 1..=3 {
            let statement = Statement::new(&poll.id, format!("{} statement {}", tag, i));
            db.create_statement(&statement).await.unwrap();
            statements.push(statement);
        }

        let mut participants = Vec::new();
        for i in 0..10 {
            let participant = Participant::with_id(format!("{}-participant{}", tag, i));
            db.create_participant(&participant).await.unwrap();
            let side = if i < 6 { Agree } else { Disagree };
            db.save_vote(&Vote::new(&participant.id, &statements[0].id, Agree))
                .await
                .unwrap();
            db.save_vote(&Vote::new(&participant.id, &statements[1].id, side))
                .await
                .unwrap();
            participants.push(participant);
        }

        Seeded {
            poll,
            statements,
            participants,
        }
    }

    fn ctx(poll: &Poll) -> PipelineContext {
        PipelineContext::new(&poll.id)
    }

    #[tokio::test]
    async fn scores_are_stored_and_change_is_notified() {
        let db = Database::in_memory().await.unwrap();
        let seeded = seed_poll(&db, "a").await;
        let notifier = RecordingNotifier::default();

        let outcome = process_poll(&db, &notifier, &seeded.poll.id, &ctx(&seeded.poll), false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Updated {
                scored: 2,
                reset: 1,
                constitutionable: 1,
                notified: true,
            }
        );

        let stored = db.get_statement_scores(&seeded.poll.id).await.unwrap();
        assert!(stored[0].is_constitutionable);
        assert!(!stored[1].is_constitutionable);
        assert!(stored[1].gac_score.is_some());
        assert_eq!(stored[2].gac_score, None);

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "gac_scores_updated");
        assert_eq!(events[0].model_id.as_deref(), Some("model-a"));
        assert_eq!(events[0].changed_statements.len(), 1);
        let changed = &events[0].changed_statements[0];
        assert_eq!(changed.statement_id, seeded.statements[0].id);
        assert_eq!(changed.old_score, None);
        assert_eq!(changed.new_score, stored[0].gac_score);
    }

    #[tokio::test]
    async fn unchanged_set_is_not_notified_again() {
        let db = Database::in_memory().await.unwrap();
        let seeded = seed_poll(&db, "a").await;
        let notifier = RecordingNotifier::default();

        process_poll(&db, &notifier, &seeded.poll.id, &ctx(&seeded.poll), false)
            .await
            .unwrap();
        let outcome = process_poll(&db, &notifier, &seeded.poll.id, &ctx(&seeded.poll), false)
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Updated { notified: false, .. }));
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let db = Database::in_memory().await.unwrap();
        let seeded = seed_poll(&db, "a").await;
        let notifier = RecordingNotifier::default();

        let outcome = process_poll(&db, &notifier, &seeded.poll.id, &ctx(&seeded.poll), true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::DryRun {
                scored: 2,
                constitutionable: 1
            }
        );
        let stored = db.get_statement_scores(&seeded.poll.id).await.unwrap();
        assert!(stored.iter().all(|s| s.gac_score.is_none()));
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn failed_notification_keeps_scores() {
        let db = Database::in_memory().await.unwrap();
        let seeded = seed_poll(&db, "a").await;
        let notifier = RecordingNotifier::failing();

        let outcome = process_poll(&db, &notifier, &seeded.poll.id, &ctx(&seeded.poll), false)
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Updated { notified: false, .. }));
        assert_eq!(notifier.events().len(), 1);
        let stored = db.get_statement_scores(&seeded.poll.id).await.unwrap();
        assert!(stored[0].is_constitutionable);
    }

    #[tokio::test]
    async fn poll_without_votes_is_skipped() {
        let db = Database::in_memory().await.unwrap();
        let poll = Poll::new("Empty".to_string(), None);
        db.create_poll(&poll).await.unwrap();
        db.create_statement(&Statement::new(&poll.id, "Unvoted".to_string()))
            .await
            .unwrap();

        let outcome = process_poll(&db, &RecordingNotifier::default(), &poll.id, &ctx(&poll), false)
            .await
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn batch_processes_changed_polls_and_syncs_counts() {
        let db = Database::in_memory().await.unwrap();
        let first = seed_poll(&db, "a").await;
        let second = seed_poll(&db, "b").await;
        let notifier = RecordingNotifier::default();
        let config = Config::default();

        let summary = run_gac_updates(&db, &notifier, &config).await.unwrap();
        assert_eq!(
            summary,
            BatchSummary {
                polls: 2,
                updated: 2,
                dry_run: 0,
                skipped: 0,
                failed: 0,
                notified: 2,
                vote_counts_synced: 4,
            }
        );
        assert!(db.get_polls_with_changes().await.unwrap().is_empty());

        // A new vote on the first poll only
        let late = Participant::with_id("late");
        db.create_participant(&late).await.unwrap();
        let mut vote = Vote::new(&late.id, &first.statements[2].id, Agree);
        vote.created_at = Utc::now() + chrono::Duration::seconds(1);
        vote.updated_at = vote.created_at;
        db.save_vote(&vote).await.unwrap();
        assert_eq!(db.get_polls_with_changes().await.unwrap(), vec![first.poll.id.clone()]);

        let summary = run_gac_updates(&db, &notifier, &config).await.unwrap();
        assert_eq!(summary.polls, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.vote_counts_synced, 1);
        assert_ne!(first.poll.id, second.poll.id);
    }

    #[tokio::test]
    async fn one_bad_poll_does_not_stop_the_batch() {
        let db = Database::in_memory().await.unwrap();
        let good = seed_poll(&db, "good").await;
        let bad = seed_poll(&db, "bad").await;
        sqlx::query("UPDATE votes SET value = 'MAYBE' WHERE participant_id = ?")
            .bind(&bad.participants[0].id)
            .execute(db.pool())
            .await
            .unwrap();

        let summary = run_gac_updates(&db, &RecordingNotifier::default(), &Config::default())
            .await
            .unwrap();
        assert_eq!(summary.polls, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 1);

        let stored = db.get_statement_scores(&good.poll.id).await.unwrap();
        assert!(stored[0].gac_score.is_some());
    }

    #[tokio::test]
    async fn configured_poll_is_processed_even_without_changes() {
        let db = Database::in_memory().await.unwrap();
        let seeded = seed_poll(&db, "a").await;
        let notifier = RecordingNotifier::default();
        run_gac_updates(&db, &notifier, &Config::default()).await.unwrap();
        assert!(db.get_polls_with_changes().await.unwrap().is_empty());

        let config = Config {
            poll_id: Some(seeded.poll.id.clone()),
            dry_run: true,
            ..Config::default()
        };
        let summary = run_gac_updates(&db, &notifier, &config).await.unwrap();
        assert_eq!(summary.polls, 1);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.dry_run, 1);
        assert_eq!(summary.vote_counts_synced, 0);
    }

    #[tokio::test]
    async fn vote_saved_during_scoring_is_picked_up_next_batch() {
        let db = Database::in_memory().await.unwrap();
        let seeded = seed_poll(&db, "a").await;
        let notifier = RecordingNotifier::default();

        let started = Utc::now();
        let data = db.get_poll_data(&seeded.poll.id).await.unwrap();
        let results = calculate_results(
            &ctx(&seeded.poll),
            &data.participants,
            &data.statements,
            &data.votes,
        )
        .unwrap();

        // Lands after the fetch but before the scores are written
        let late = Participant::with_id("late");
        db.create_participant(&late).await.unwrap();
        let mut vote = Vote::new(&late.id, &seeded.statements[0].id, Disagree);
        vote.created_at = started + chrono::Duration::milliseconds(1);
        vote.updated_at = vote.created_at;
        db.save_vote(&vote).await.unwrap();

        store_and_notify(&db, &notifier, &data, &results, started)
            .await
            .unwrap();
        assert_eq!(
            db.get_polls_with_changes().await.unwrap(),
            vec![seeded.poll.id.clone()]
        );

        let summary = run_gac_updates(&db, &notifier, &Config::default()).await.unwrap();
        assert_eq!(summary.polls, 1);
        assert_eq!(summary.updated, 1);
    }
}
