//! Periodic registration with the authority.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use daycare_spec::{DaycareRegistration, VERSION};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("authority answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Posts a signed [`DaycareRegistration`] on a fixed interval.
#[derive(Clone)]
pub struct Heartbeat {
    client: reqwest::Client,
    endpoint: String,
    hostname: String,
    problem_types: Vec<String>,
    capacity: u32,
    secret: Arc<[u8]>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(
        authority_url: &str,
        hostname: String,
        problem_types: Vec<String>,
        capacity: u32,
        secret: Arc<[u8]>,
        interval: Duration,
    ) -> Result<Self, HeartbeatError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/v2/daycare_registrations",
                authority_url.trim_end_matches('/')
            ),
            hostname,
            problem_types,
            capacity,
            secret,
            interval,
        })
    }

    pub fn registration(&self, now: DateTime<Utc>) -> DaycareRegistration {
        let mut registration = DaycareRegistration {
            hostname: self.hostname.clone(),
            problem_types: self.problem_types.clone(),
            capacity: self.capacity,
            time: now,
            version: VERSION.to_string(),
            signature: String::new(),
        };
        registration.sign(&self.secret);
        registration
    }

    /// Post one registration.
    pub async fn beat(&self) -> Result<(), HeartbeatError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.registration(Utc::now()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HeartbeatError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Beat forever. Only changes between success and failure are logged.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut last: Option<bool> = None;
            loop {
                ticker.tick().await;
                let result = self.beat().await;
                if !changed(last, result.is_ok()) {
                    continue;
                }
                last = Some(result.is_ok());
                match result {
                    Ok(()) => info!(endpoint = %self.endpoint, "registered with authority"),
                    Err(err) => {
                        warn!(endpoint = %self.endpoint, error = %err, "registration failed")
                    }
                }
            }
        })
    }
}

fn changed(last: Option<bool>, ok: bool) -> bool {
    last != Some(ok)
}
