//! Capture collaborator
//!
//! Browser automation runs outside this crate. The worker only needs one call,
//! [`Capture::capture`], which returns the observed price, the screenshot
//! fragments in page order and an initial status.

use crate::config::CaptureSettings;
use crate::imaging::RawFragment;
use crate::job::{JobRequest, ScreenshotStatus};
use crate::WorkerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureOutcome {
    pub price: f32,
    #[serde(default)]
    pub fragments: Vec<RawFragment>,
    pub status: ScreenshotStatus,
}

impl CaptureOutcome {
    pub fn failed(status: ScreenshotStatus) -> Self {
        Self {
            price: 0.0,
            fragments: Vec::new(),
            status,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Capture: Send + Sync {
    async fn capture(&self, job: &JobRequest) -> CaptureOutcome;
}

#[derive(Debug, Serialize)]
struct CaptureCall<'a> {
    channel: &'a str,
    country: &'a str,
    asin: &'a str,
}

/// Delegates to a capture service at the configured driver endpoint.
///
/// `POST {driver_endpoint}/capture` with `{channel, country, asin}`; the
/// response body is a [`CaptureOutcome`]. Any transport failure is reported
/// as `PAGE_ERROR`.
pub struct RemoteCapture {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteCapture {
    pub fn new(settings: &CaptureSettings) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| WorkerError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/capture", settings.driver_endpoint.trim_end_matches('/')),
        })
    }

    async fn request(&self, job: &JobRequest) -> Result<CaptureOutcome, WorkerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CaptureCall {
                channel: &job.channel,
                country: &job.country,
                asin: &job.asin,
            })
            .send()
            .await
            .map_err(|e| WorkerError::Capture(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::Capture(e.to_string()))?;

        response
            .json::<CaptureOutcome>()
            .await
            .map_err(|e| WorkerError::Capture(e.to_string()))
    }
}

#[async_trait]
impl Capture for RemoteCapture {
    async fn capture(&self, job: &JobRequest) -> CaptureOutcome {
        match self.request(job).await {
            Ok(outcome) => {
                debug!(
                    asin = %job.asin,
                    status = %outcome.status,
                    fragments = outcome.fragments.len(),
                    "Capture finished"
                );
                outcome
            }
            Err(e) => {
                warn!(asin = %job.asin, "Capture failed: {}", e);
                CaptureOutcome::failed(ScreenshotStatus::PageError)
            }
        }
    }
}
