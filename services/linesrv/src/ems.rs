//! EMS reporter
//!
//! Finished batch results are POSTed as JSON to the EMS endpoint. Each
//! submission is serialized once and every retry re-sends the identical
//! bytes. Only HTTP 200 counts as delivered; any other status or a network
//! failure schedules another attempt per the configured `RetryPolicy`.
//! Submissions never block the caller: delivery runs on spawned tasks whose
//! concurrent requests are bounded by a semaphore.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{LineSrvError, Result};
use crate::model::ProgramResult;
use crate::runtime::retry::{retry, RetryError, RetryPolicy};
use crate::workflow::ports::ResultReporter;

/// EMS client configuration
#[derive(Debug, Clone)]
pub struct EmsConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Maximum concurrent POSTs
    pub workers: usize,
}

impl EmsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::fixed(Duration::from_secs(5)),
            workers: 5,
        }
    }
}

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmsStats {
    pub submitted: u64,
    pub delivered: u64,
    /// Gave up after the retry policy was exhausted
    pub failed: u64,
    /// Dropped by shutdown before delivery
    pub abandoned: u64,
    pub attempts: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    attempts: AtomicU64,
}

struct Inner {
    config: EmsConfig,
    client: Client,
    permits: Semaphore,
    counters: Counters,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Asynchronous, retrying EMS client
#[derive(Clone)]
pub struct EmsReporter {
    inner: Arc<Inner>,
}

impl EmsReporter {
    pub fn new(config: EmsConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(LineSrvError::config("EMS URL is empty"));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LineSrvError::config(format!("failed to build EMS client: {}", e)))?;

        let workers = config.workers.max(1);
        Ok(Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(workers),
                client,
                config,
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn stats(&self) -> EmsStats {
        let c = &self.inner.counters;
        let submitted = c.submitted.load(Ordering::Relaxed);
        let delivered = c.delivered.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let abandoned = c.abandoned.load(Ordering::Relaxed);
        EmsStats {
            submitted,
            delivered,
            failed,
            abandoned,
            attempts: c.attempts.load(Ordering::Relaxed),
            in_flight: submitted.saturating_sub(delivered + failed + abandoned),
        }
    }

    /// Stop retrying and wait up to `grace` for in-flight requests
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!(
                "EMS reporter: {} deliveries still running at shutdown",
                self.inner.tasks.len()
            );
        }
    }

    async fn deliver(inner: Arc<Inner>, batch_id: String, body: Bytes) {
        let label = format!("EMS report for batch {}", batch_id);
        let outcome = retry(&inner.config.retry, &inner.shutdown, &label, |attempt| {
            let inner = inner.clone();
            let body = body.clone();
            async move {
                let _permit = inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| LineSrvError::internal("EMS worker pool closed"))?;
                inner.counters.attempts.fetch_add(1, Ordering::Relaxed);
                debug!("EMS POST attempt {} ({} bytes)", attempt, body.len());
                post(&inner.client, &inner.config.url, body).await
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                info!("EMS accepted batch {}", batch_id);
            },
            Err(RetryError::Cancelled) => {
                inner.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!("EMS report for batch {} abandoned at shutdown", batch_id);
            },
            Err(e) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("{}", e);
            },
        }
    }
}

async fn post(client: &Client, url: &str, body: Bytes) -> Result<()> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| LineSrvError::reporting(format!("EMS request failed: {}", e)))?;

    if response.status() != StatusCode::OK {
        return Err(LineSrvError::reporting(format!(
            "EMS returned HTTP {}",
            response.status()
        )));
    }
    Ok(())
}

impl ResultReporter for EmsReporter {
    fn submit(&self, result: ProgramResult) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LineSrvError::reporting("EMS reporter is shut down"));
        }

        let body = Bytes::from(serde_json::to_vec(&result)?);
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            "EMS report queued for batch {} ({} units)",
            result.batch_id,
            result.results.len()
        );

        self.inner
            .tasks
            .spawn(Self::deliver(self.inner.clone(), result.batch_id, body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_is_rejected() {
        assert!(EmsReporter::new(EmsConfig::new("  ")).is_err());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let reporter = EmsReporter::new(EmsConfig::new("http://127.0.0.1:9/api")).unwrap();
        reporter.shutdown(Duration::from_millis(10)).await;

        let result = ProgramResult {
            batch_id: "B1".to_string(),
            status: "done".to_string(),
            results: Vec::new(),
            complete_time: crate::model::now(),
        };
        assert!(reporter.submit(result).is_err());
        assert_eq!(reporter.stats(), EmsStats::default());
    }
}
