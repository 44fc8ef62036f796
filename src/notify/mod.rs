use crate::config::WebhookConfig;
use crate::error::GacError;
use crate::models::StatementScore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
const MAX_ATTEMPTS: usize = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedStatement {
    pub statement_id: String,
    pub old_score: Option<f64>,
    pub new_score: Option<f64>,
}

/// Event sent when a poll's set of constitutionable statements changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GacScoresUpdated {
    pub event: String,
    pub poll_id: String,
    pub model_id: Option<String>,
    pub timestamp: String,
    pub changed_statements: Vec<ChangedStatement>,
}

impl GacScoresUpdated {
    pub const EVENT: &'static str = "gac_scores_updated";

    pub fn new(
        poll_id: &str,
        model_id: Option<String>,
        timestamp: DateTime<Utc>,
        changed_statements: Vec<ChangedStatement>,
    ) -> Self {
        Self {
            event: Self::EVENT.to_string(),
            poll_id: poll_id.to_string(),
            model_id,
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            changed_statements,
        }
    }
}

pub fn constitutionable_set(scores: &[StatementScore]) -> HashSet<String> {
    scores
        .iter()
        .filter(|s| s.is_constitutionable)
        .map(|s| s.statement_id.clone())
        .collect()
}

/// True when the constitutionable statement sets differ, i.e. a notification is due.
pub fn changed_constitutionable_set(before: &HashSet<String>, after: &HashSet<String>) -> bool {
    before != after
}

/// Statements that entered or left the constitutionable set, ordered by id, with the
/// previously persisted score and the new one.
pub fn changed_statements(before: &[StatementScore], after: &[StatementScore]) -> Vec<ChangedStatement> {
    let old_scores: HashMap<&str, Option<f64>> = before
        .iter()
        .map(|s| (s.statement_id.as_str(), s.gac_score))
        .collect();
    let new_scores: HashMap<&str, Option<f64>> = after
        .iter()
        .map(|s| (s.statement_id.as_str(), s.gac_score))
        .collect();

    let before_set = constitutionable_set(before);
    let after_set = constitutionable_set(after);
    let flipped: BTreeSet<&String> = before_set.symmetric_difference(&after_set).collect();

    flipped
        .into_iter()
        .map(|id| ChangedStatement {
            statement_id: id.clone(),
            old_score: old_scores.get(id.as_str()).copied().flatten(),
            new_score: new_scores.get(id.as_str()).copied().flatten(),
        })
        .collect()
}

/// Lowercase hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign_payload(body: &[u8], secret: &str) -> Result<String, GacError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GacError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Server errors, request timeouts and rate limiting are worth another attempt.
pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, event: &GacScoresUpdated) -> Result<(), GacError>;
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl ChangeNotifier for LogNotifier {
    async fn notify(&self, event: &GacScoresUpdated) -> Result<(), GacError> {
        info!(
            "Webhook not configured, skipping notification for poll {} ({} changed statements)",
            event.poll_id,
            event.changed_statements.len()
        );
        Ok(())
    }
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
    secret: String,
    retry_backoff: Duration,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self, GacError> {
        let client = Client::builder().timeout(ATTEMPT_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
            retry_backoff: RETRY_BACKOFF,
        })
    }

    /// Base delay between attempts; attempt n waits n times this.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[async_trait]
impl ChangeNotifier for WebhookNotifier {
    async fn notify(&self, event: &GacScoresUpdated) -> Result<(), GacError> {
        // Sign the exact bytes that go on the wire
        let body = serde_json::to_vec(event)?;
        let signature = sign_payload(&body, &self.secret)?;
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!("Webhook delivered for poll {} (attempt {})", event.poll_id, attempt);
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = format!("status {}: {}", status, text);
                    if !is_retryable(status) {
                        error!(
                            "Webhook rejected for poll {} with {}, not retrying",
                            event.poll_id, last_error
                        );
                        return Err(GacError::Delivery(last_error));
                    }
                    warn!(
                        "Webhook attempt {}/{} for poll {} failed: {}",
                        attempt, MAX_ATTEMPTS, event.poll_id, last_error
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Webhook attempt {}/{} for poll {} failed: {}",
                        attempt, MAX_ATTEMPTS, event.poll_id, e
                    );
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.retry_backoff * attempt as u32).await;
            }
        }

        Err(GacError::Delivery(format!(
            "gave up after {} attempts: {}",
            MAX_ATTEMPTS, last_error
        )))
    }
}
