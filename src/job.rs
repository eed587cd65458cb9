//! Job request/result wire types and the terminal status set

use crate::imaging::OutputFormat;
use crate::sanitize_filename;
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Terminal outcome of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScreenshotStatus {
    Success,
    PageError,
    ScreenshotError,
    PriceError,
    UploadToOssError,
}

impl ScreenshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenshotStatus::Success => "SUCCESS",
            ScreenshotStatus::PageError => "PAGE_ERROR",
            ScreenshotStatus::ScreenshotError => "SCREENSHOT_ERROR",
            ScreenshotStatus::PriceError => "PRICE_ERROR",
            ScreenshotStatus::UploadToOssError => "UPLOAD_TO_OSS_ERROR",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScreenshotStatus::Success)
    }
}

impl std::fmt::Display for ScreenshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound job body. Missing fields read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRequest {
    pub channel: String,
    pub country: String,
    /// Marketplace item id.
    pub asin: String,
    pub price: String,
    pub price_no: String,
}

impl JobRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, crate::WorkerError> {
        serde_json::from_slice(body).map_err(|e| crate::WorkerError::MalformedJob(e.to_string()))
    }
}

/// Outbound result body: the request echoed back plus the outcome.
///
/// `screenshot` is empty exactly when no image was produced.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub channel: String,
    pub country: String,
    pub asin: String,
    pub price: String,
    pub price_no: String,
    pub status: ScreenshotStatus,
    pub screenshot: String,
    pub new_price: f32,
}

impl JobResult {
    pub fn new(request: JobRequest, status: ScreenshotStatus, screenshot: String, new_price: f32) -> Self {
        Self {
            channel: request.channel,
            country: request.country,
            asin: request.asin,
            price: request.price,
            price_no: request.price_no,
            status,
            screenshot,
            new_price,
        }
    }
}

/// Object key for a job's composite:
/// `{channel}_{country}_{asin}_{YYYYmmddHHMMSS}.{ext}`.
pub fn artifact_name<Tz>(request: &JobRequest, at: &DateTime<Tz>, format: OutputFormat) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let stem = format!(
        "{}_{}_{}_{}",
        request.channel,
        request.country,
        request.asin,
        at.format("%Y%m%d%H%M%S")
    );
    format!("{}.{}", sanitize_filename(&stem), format.name())
}
