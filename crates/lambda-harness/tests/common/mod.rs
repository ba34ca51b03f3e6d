//! Shared test utilities for lambda-harness integration tests.

#![allow(dead_code)]

use lambda_harness::{HarnessConfig, QueueBatchEvent, QueueHandler};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration bound to an ephemeral port with a short poll interval.
pub fn test_config() -> HarnessConfig {
    HarnessConfig::builder()
        .http_port(0)
        .poll_interval(Duration::from_millis(10))
        .build()
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

/// Records every batch a queue handler receives.
#[derive(Clone, Default)]
pub struct BatchRecorder {
    batches: Arc<Mutex<Vec<QueueBatchEvent>>>,
}

impl BatchRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that records the batch and succeeds.
    pub fn handler(&self) -> QueueHandler {
        let batches = self.batches.clone();
        QueueHandler::new(move |batch, _context| {
            let batches = batches.clone();
            async move {
                batches.lock().push(batch);
                Ok(())
            }
        })
    }

    pub fn batches(&self) -> Vec<QueueBatchEvent> {
        self.batches.lock().clone()
    }

    pub fn bodies(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .iter()
            .map(|batch| batch.records().iter().map(|r| r.body.clone()).collect())
            .collect()
    }
}

/// Installs a test subscriber once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every 10ms until it holds or `timeout` expires.
pub async fn eventually<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
