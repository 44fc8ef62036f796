mod cli;
mod config;
mod db;
mod error;
mod models;
mod notify;
mod tasks;
mod voting;

use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use db::Database;
use log::{error, info};
use notify::{ChangeNotifier, LogNotifier, WebhookNotifier};
use std::sync::Arc;
use tasks::evaluate::evaluate_poll;
use voting::PipelineContext;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let database = match Database::new(&config.database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(Command::Evaluate { poll_id, test_ratio }) = cli.command {
        let code = run_evaluation(&database, &config, poll_id, test_ratio).await;
        std::process::exit(code);
    }

    let notifier: Arc<dyn ChangeNotifier> = match &config.webhook {
        Some(webhook) => match WebhookNotifier::new(webhook) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                error!("Failed to build webhook client: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("WEBHOOK_URL not set, changes will only be logged");
            Arc::new(LogNotifier)
        }
    };

    if config.dry_run {
        info!("Dry run: scores will be computed and logged but not stored");
    }

    if config.run_once() {
        match tasks::gac_updater::run_gac_updates(&database, notifier.as_ref(), &config).await {
            Ok(summary) if summary.failed > 0 => std::process::exit(1),
            Ok(_) => {}
            Err(e) => {
                error!("GAC update failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let task = tokio::spawn(tasks::gac_updater::gac_update_task(
        Arc::clone(&database),
        notifier,
        config,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        result = task => {
            if let Err(e) = result {
                error!("GAC update task stopped: {}", e);
            }
        }
    }
}

async fn run_evaluation(
    database: &Database,
    config: &Config,
    poll_id: Option<String>,
    test_ratio: f64,
) -> i32 {
    let Some(poll_id) = poll_id.or_else(|| config.poll_id.clone()) else {
        error!("No poll to evaluate: pass a poll id or set GAC_POLL_ID");
        return 2;
    };

    let ctx = PipelineContext::new(&poll_id).with_seed(config.random_seed);
    match evaluate_poll(database, &ctx, test_ratio).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                1
            }
        },
        Err(e) => {
            error!("Evaluation failed for poll {}: {}", poll_id, e);
            1
        }
    }
}
