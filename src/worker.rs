//! Job orchestration
//!
//! [`JobWorker`] turns one job request into exactly one job result:
//! capture, compose the fragments, upload the composite and publish the
//! outcome to the result queue.

use crate::broker::{Broker, ConnectionDescriptor};
use crate::capture::Capture;
use crate::consumer::MessageHandler;
use crate::imaging::{compose_fragments, OutputFormat};
use crate::job::{artifact_name, JobRequest, JobResult, ScreenshotStatus};
use crate::storage::ObjectStore;
use crate::{format_bytes, format_duration, metrics, publisher, RetryConfig, WorkerError};
use async_trait::async_trait;
use chrono::Local;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub struct JobWorker<B: Broker> {
    broker: Arc<B>,
    capture: Arc<dyn Capture>,
    store: Arc<dyn ObjectStore>,
    result_descriptor: ConnectionDescriptor,
    output_format: OutputFormat,
    retry_config: RetryConfig,
    processed_count: AtomicUsize,
    failed_count: AtomicUsize,
    published_count: AtomicUsize,
}

impl<B: Broker> JobWorker<B> {
    pub fn new(
        broker: Arc<B>,
        capture: Arc<dyn Capture>,
        store: Arc<dyn ObjectStore>,
        result_descriptor: ConnectionDescriptor,
    ) -> Self {
        Self {
            broker,
            capture,
            store,
            result_descriptor,
            output_format: OutputFormat::Png,
            retry_config: RetryConfig::default(),
            processed_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
            published_count: AtomicUsize::new(0),
        }
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Run capture, composition and upload for one request.
    ///
    /// Never fails: every problem is folded into the result status.
    pub async fn process(&self, request: JobRequest) -> JobResult {
        let started = Instant::now();
        debug!(asin = %request.asin, channel = %request.channel, "Processing job");

        let outcome = self.capture.capture(&request).await;
        let mut status = outcome.status;
        let price = outcome.price;

        let mut composite = Vec::new();
        if status.is_success() && !outcome.fragments.is_empty() {
            match compose_fragments(&outcome.fragments, self.output_format) {
                Ok(bytes) => composite = bytes,
                Err(e) => {
                    warn!(asin = %request.asin, "Failed to compose screenshot: {}", e);
                    status = ScreenshotStatus::ScreenshotError;
                }
            }
        }

        let mut screenshot = String::new();
        if !composite.is_empty() {
            metrics::record_composite_size(composite.len());
            screenshot = artifact_name(&request, &Local::now(), self.output_format);

            let size = composite.len();
            if !self.store.put_bytes(&screenshot, composite).await {
                warn!(asin = %request.asin, "Upload of {} ({}) failed", screenshot, format_bytes(size));
                status = ScreenshotStatus::UploadToOssError;
            }
        }

        let elapsed = started.elapsed();
        metrics::record_job(status, elapsed);
        info!(
            asin = %request.asin,
            status = %status,
            "Job finished in {}",
            format_duration(elapsed)
        );

        if status.is_success() {
            self.processed_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
        }

        JobResult::new(request, status, screenshot, price)
    }

    /// Publish one result, retrying with exponential backoff.
    async fn publish_with_retry(&self, payload: &[u8]) -> Result<(), WorkerError> {
        let max_attempts = self.retry_config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match publisher::publish(self.broker.as_ref(), &self.result_descriptor, payload).await {
                Ok(()) => {
                    self.published_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    last_error = Some(e);

                    if !retryable || attempt == max_attempts - 1 {
                        break;
                    }

                    let delay = self.retry_config.delay_for(attempt);
                    metrics::record_publish_retry();
                    debug!(
                        "Retrying result publish after {:?} (attempt {}/{})",
                        delay,
                        attempt + 1,
                        max_attempts
                    );
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| WorkerError::Publish("no publish attempt made".to_string())))
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            processed_count: self.processed_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
            published_count: self.published_count.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<B: Broker> MessageHandler for JobWorker<B> {
    async fn handle(&self, body: &[u8]) -> Result<(), WorkerError> {
        let request = JobRequest::from_slice(body)?;
        let result = self.process(request).await;
        let payload = serde_json::to_vec(&result)?;

        if let Err(e) = self.publish_with_retry(&payload).await {
            error!(asin = %result.asin, status = %result.status, "Failed to publish result: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

/// Counters since start. A job counts as failed when its status is not `SUCCESS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed_count: usize,
    pub failed_count: usize,
    pub published_count: usize,
}
