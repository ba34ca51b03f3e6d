//! Invocation engine: lifecycle of a set of dispatchers.

use crate::error::{EngineError, EngineResult};
use crate::http_server::HttpDispatchServer;
use crate::poller::QueuePollDispatcher;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Owns HTTP dispatch servers and queue poll dispatchers and starts and
/// stops them together.
///
/// Dispatchers are shared through `Arc` so callers keep access to addresses,
/// registries and counters while the engine runs them.
///
/// # Examples
///
/// ```no_run
/// use lambda_harness::config::HarnessConfig;
/// use lambda_harness::engine::InvocationEngine;
/// use lambda_harness::http_server::HttpDispatchServer;
/// use lambda_harness::poller::QueuePollDispatcher;
/// use lambda_harness::queue::InMemoryQueueService;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = HarnessConfig::default();
/// let queues = InMemoryQueueService::new_shared(config.queue.clone());
///
/// let engine = InvocationEngine::new()
///     .with_http_server(Arc::new(HttpDispatchServer::new(&config)))
///     .with_queue_dispatcher(Arc::new(QueuePollDispatcher::new(&config, queues)));
///
/// engine.start().await?;
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
#[must_use]
pub struct InvocationEngine {
    http_servers: Vec<Arc<HttpDispatchServer>>,
    queue_dispatchers: Vec<Arc<QueuePollDispatcher>>,
}

impl InvocationEngine {
    /// Creates an engine with no dispatchers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an HTTP dispatch server.
    pub fn with_http_server(mut self, server: Arc<HttpDispatchServer>) -> Self {
        self.http_servers.push(server);
        self
    }

    /// Adds a queue poll dispatcher.
    pub fn with_queue_dispatcher(mut self, dispatcher: Arc<QueuePollDispatcher>) -> Self {
        self.queue_dispatchers.push(dispatcher);
        self
    }

    /// The engine's HTTP dispatch servers.
    pub fn http_servers(&self) -> &[Arc<HttpDispatchServer>] {
        &self.http_servers
    }

    /// The engine's queue poll dispatchers.
    pub fn queue_dispatchers(&self) -> &[Arc<QueuePollDispatcher>] {
        &self.queue_dispatchers
    }

    /// Addresses of the running HTTP dispatch servers.
    pub async fn http_addrs(&self) -> Vec<SocketAddr> {
        join_all(self.http_servers.iter().map(|server| server.local_addr()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Starts every dispatcher concurrently and returns once all of them are
    /// running.
    ///
    /// # Errors
    ///
    /// If any dispatcher fails to start, the ones that did start are stopped
    /// again and the first error is returned.
    pub async fn start(&self) -> EngineResult<()> {
        let (http_results, queue_results) = tokio::join!(
            join_all(self.http_servers.iter().map(|server| server.start())),
            join_all(self.queue_dispatchers.iter().map(|dispatcher| dispatcher.start())),
        );

        let mut first_error = None;
        let mut started_http = Vec::new();
        let mut started_queue = Vec::new();

        for (server, result) in self.http_servers.iter().zip(http_results) {
            match result {
                Ok(_) => started_http.push(server),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        for (dispatcher, result) in self.queue_dispatchers.iter().zip(queue_results) {
            match result {
                Ok(()) => started_queue.push(dispatcher),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(error) = first_error else {
            tracing::info!(
                target: "lambda_harness",
                http_servers = self.http_servers.len(),
                queue_dispatchers = self.queue_dispatchers.len(),
                "Invocation engine started"
            );
            return Ok(());
        };

        tracing::error!(error = %error, "Invocation engine failed to start, rolling back");
        tokio::join!(
            join_all(started_http.into_iter().map(|server| server.stop())),
            join_all(started_queue.into_iter().map(|dispatcher| dispatcher.stop())),
        );
        Err(error)
    }

    /// Stops every dispatcher. Safe to call more than once.
    pub async fn stop(&self) {
        tokio::join!(
            join_all(self.http_servers.iter().map(|server| server.stop())),
            join_all(self.queue_dispatchers.iter().map(|dispatcher| dispatcher.stop())),
        );
        tracing::info!(target: "lambda_harness", "Invocation engine stopped");
    }

    /// Waits for a condition to become true.
    ///
    /// The condition is re-evaluated every 10ms until it holds or the
    /// timeout expires.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if the condition is still false when
    /// the timeout expires.
    pub async fn wait_for<F, Fut>(&self, condition: F, timeout: Duration) -> EngineResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(10);

        loop {
            if condition().await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "Condition did not become true within {:?}",
                    timeout
                )));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_engine_starts_and_stops() {
        let engine = InvocationEngine::new();

        engine.start().await.unwrap();
        engine.stop().await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let engine = InvocationEngine::new();

        let result = engine
            .wait_for(|| async { false }, Duration::from_millis(30))
            .await;

        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[tokio::test]
    async fn wait_for_returns_when_condition_holds() {
        let engine = InvocationEngine::new();
        engine
            .wait_for(|| async { true }, Duration::from_millis(30))
            .await
            .unwrap();
    }
}
