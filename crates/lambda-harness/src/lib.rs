//! # Lambda Harness
//!
//! A local invocation engine for Lambda-style handlers triggered by HTTP
//! requests and queue messages.
//!
//! ## Overview
//!
//! Register async handlers against HTTP routes or queues and the harness
//! invokes them with synthesized event envelopes shaped like API Gateway
//! proxy events and SQS batch events. Nothing is deployed: HTTP requests are
//! served by a local `axum` listener and queues are polled through a
//! pluggable [`QueueService`], with an in-memory implementation included.
//!
//! ## Features
//!
//! - **HTTP dispatch**: One route per `(method, path)`, full-event or pure handlers
//! - **Queue polling**: Batched, at-least-once delivery with delete-after-success
//! - **Failure isolation**: Handler errors and panics never stop a dispatcher
//! - **Test-Friendly**: `poll_once`, per-function counters and `wait_for`
//!
//! ## Quick Start
//!
//! ```no_run
//! use lambda_harness::{
//!     HarnessConfig, HttpDispatchServer, HttpHandler, HttpResponse, HttpTrigger,
//!     InMemoryQueueService, InvocationEngine, QueueHandler, QueuePollDispatcher,
//!     QueueService, QueueTrigger,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarnessConfig::load()?;
//!
//!     let http = Arc::new(HttpDispatchServer::new(&config));
//!     http.register(
//!         "echo",
//!         HttpTrigger::post("/http"),
//!         HttpHandler::event(|event, _context| async move {
//!             let body = event.body.map(|b| b.to_string()).unwrap_or_default();
//!             Ok(HttpResponse::ok().with_body(body))
//!         }),
//!     )?;
//!
//!     let queues = InMemoryQueueService::new_shared(config.queue.clone());
//!     queues.create_queue("orders").await?;
//!
//!     let poller = Arc::new(QueuePollDispatcher::new(&config, queues.clone()));
//!     poller.register(
//!         "process-orders",
//!         QueueTrigger::new("orders").batch_size(10),
//!         QueueHandler::new(|batch, _context| async move {
//!             println!("received {} orders", batch.len());
//!             Ok(())
//!         }),
//!     )?;
//!
//!     let engine = InvocationEngine::new()
//!         .with_http_server(http)
//!         .with_queue_dispatcher(poller);
//!     engine.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Deterministic Queue Tests
//!
//! Drive the poll loop by hand instead of starting it:
//!
//! ```no_run
//! use lambda_harness::{
//!     HarnessConfig, InMemoryQueueService, PollOutcome, QueueHandler, QueuePollDispatcher,
//!     QueueService, QueueTrigger,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarnessConfig::default();
//! let queues = InMemoryQueueService::new_shared(config.queue.clone());
//! let url = queues.create_queue("123").await?;
//! queues.send_message(&url, r#"{"test":123}"#).await?;
//!
//! let dispatcher = QueuePollDispatcher::new(&config, queues.clone());
//! dispatcher.register(
//!     "f",
//!     QueueTrigger::new("123"),
//!     QueueHandler::new(|_batch, _context| async { Ok(()) }),
//! )?;
//!
//! let report = dispatcher.poll_once().await;
//! assert_eq!(report[0].1, PollOutcome::Delivered { records: 1, deleted: 1 });
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Everything is logged through `tracing`. Lifecycle messages use the
//! `lambda_harness` target; installing a subscriber is up to the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod handler;
pub mod http_server;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod translate;

pub use config::{FunctionConfig, HarnessConfig, HttpConfig, PollerConfig, QueueConfig};
pub use context::InvocationContext;
pub use engine::InvocationEngine;
pub use error::{
    ConfigError, EngineError, EngineResult, QueueError, QueueResult, RegistryError,
    RegistryResult, TranslateError,
};
pub use event::{
    HttpMethod, HttpRequestEvent, HttpResponse, QueueBatchEvent, QueueMessageRecord,
};
pub use handler::{HandlerError, HandlerResult, HttpHandler, InvokeFailure, QueueHandler};
pub use http_server::{HttpDispatchServer, RouteTable};
pub use poller::{FunctionStats, PollOutcome, QueuePollDispatcher};
pub use queue::{InMemoryQueueService, QueueService, RawMessage};
pub use registry::{HttpRegistry, HttpTrigger, QueueRegistry, QueueTrigger, Registration};
