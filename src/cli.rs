use crate::tasks::evaluate::DEFAULT_TEST_RATIO;
use clap::{Parser, Subcommand};

/// Group-aware consensus scoring service. Without a subcommand it keeps poll scores up to date.
#[derive(Parser, Debug)]
#[command(name = "gac-consensus", version, about = "Group-aware consensus scoring service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Hold out part of a poll's recorded votes, impute them back and print the report as JSON.
    Evaluate {
        /// Poll to evaluate; falls back to GAC_POLL_ID.
        poll_id: Option<String>,

        /// Share of recorded votes to hold out, strictly between 0 and 1.
        #[arg(long, default_value_t = DEFAULT_TEST_RATIO, value_parser = parse_ratio)]
        test_ratio: f64,
    },
}

fn parse_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw.parse().map_err(|e| format!("{}", e))?;
    if ratio > 0.0 && ratio < 1.0 {
        Ok(ratio)
    } else {
        Err(format!("{} is not strictly between 0 and 1", ratio))
    }
}
