// ABOUTME: Conductor submission client with bounded retry and terminal-rejection handling
// ABOUTME: Fire-and-acknowledge: success means the conductor owns the turn, not that a reply exists

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use troupe_core::config::ConductorConfig;
use troupe_core::metrics;
use troupe_core::protocol::{TurnAck, TurnRequest};
use troupe_core::retry::{ErrorClass, RetryPolicy};
use troupe_core::utils::preview;

/// A failed submission attempt, classified for the retry policy
#[derive(Debug, Clone)]
pub enum SubmitError {
    /// The attempt exceeded the configured timeout
    Timeout,
    /// The conductor could not be reached
    Connection(String),
    /// The conductor answered and said no — a definitive decision
    Rejected { status: u16, detail: String },
}

impl SubmitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout => ErrorClass::Timeout,
            Self::Connection(_) => ErrorClass::Connection,
            Self::Rejected { .. } => ErrorClass::Rejected,
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "submission timed out"),
            Self::Connection(detail) => write!(f, "connection failure: {}", detail),
            Self::Rejected { status, detail } => {
                write!(f, "conductor rejected the turn ({}): {}", status, detail)
            }
        }
    }
}

impl std::error::Error for SubmitError {}

/// Transport seam for the conductor call, so retry behavior is testable
/// without a network
#[async_trait]
pub trait TurnTransport: Send + Sync {
    async fn post_turn(&self, request: &TurnRequest) -> Result<TurnAck, SubmitError>;
}

/// Real transport: `POST {conductor_url}/turns`
pub struct HttpTransport {
    http: reqwest::Client,
    turns_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, policy: &RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .context("Failed to build conductor HTTP client")?;
        let turns_url = format!("{}/turns", base_url.trim_end_matches('/'));
        Ok(Self { http, turns_url })
    }
}

#[async_trait]
impl TurnTransport for HttpTransport {
    async fn post_turn(&self, request: &TurnRequest) -> Result<TurnAck, SubmitError> {
        let response = self
            .http
            .post(&self.turns_url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SubmitError::Timeout
                } else {
                    SubmitError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        // A 2xx is acceptance per the contract; a malformed ack body is not
        // worth a resubmission
        Ok(response.json::<TurnAck>().await.unwrap_or(TurnAck {
            accepted: true,
        }))
    }
}

/// Per-agent client for handing turns to the conductor. Cheap to clone into
/// spawned submission tasks.
#[derive(Clone)]
pub struct ConductorClient {
    transport: Arc<dyn TurnTransport>,
    policy: RetryPolicy,
}

impl ConductorClient {
    pub fn new(transport: Arc<dyn TurnTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Construct the production client from config
    pub fn http(config: &ConductorConfig) -> Result<Self> {
        let policy = config.retry_policy();
        let transport = HttpTransport::new(&config.url, &policy)?;
        Ok(Self::new(Arc::new(transport), policy))
    }

    /// Submit a turn, retrying transient transport failures up to the
    /// configured bound with a fixed pause between attempts. Application-level
    /// rejections return immediately.
    pub async fn submit(&self, request: &TurnRequest) -> Result<(), SubmitError> {
        let mut attempt = 1u32;
        loop {
            match self.transport.post_turn(request).await {
                Ok(ack) => {
                    if !ack.accepted {
                        metrics::record_turn_failed();
                        return Err(SubmitError::Rejected {
                            status: 200,
                            detail: "conductor declined the turn".to_string(),
                        });
                    }
                    metrics::record_turn_submitted();
                    tracing::info!(
                        event_id = %request.event_id,
                        session_id = %request.session_id,
                        channel_id = %request.channel_id,
                        attempt,
                        query_preview = %preview(&request.user_query, 50),
                        "Turn accepted by conductor"
                    );
                    return Ok(());
                }
                Err(e) => match self.policy.next_delay(e.class(), attempt) {
                    Some(delay) => {
                        metrics::record_turn_retry();
                        tracing::warn!(
                            event_id = %request.event_id,
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying turn submission"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        metrics::record_turn_failed();
                        tracing::error!(
                            event_id = %request.event_id,
                            attempt,
                            error = %e,
                            "Turn submission failed terminally"
                        );
                        return Err(e);
                    }
                },
            }
        }
    }
}
