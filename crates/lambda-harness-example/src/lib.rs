//! Example handlers for the local Lambda harness.
//!
//! This crate wires a small order pipeline into the harness:
//!
//! - `POST /http` echoes the JSON body back
//! - `GET /hello/{name}` greets the caller
//! - `GET /health` is a pure handler answered with an empty `200`
//! - `POST /orders` puts the order on the `orders` queue
//! - `forward-orders` moves each order from `orders` to `processed-orders`
//! - `record-orders` collects whatever reaches `processed-orders`
//!
//! ## Example: HTTP Handler
//!
//! ```no_run
//! use lambda_harness::{HarnessConfig, HttpDispatchServer, HttpTrigger};
//! use lambda_harness_example::echo_handler;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = HttpDispatchServer::new(&HarnessConfig::default());
//! server.register("echo", HttpTrigger::post("/http"), echo_handler())?;
//! let addr = server.start().await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Example: Whole Pipeline
//!
//! ```no_run
//! use lambda_harness::HarnessConfig;
//! use lambda_harness_example::ExampleHarness;
//!
//! # async fn example() -> Result<(), lambda_harness_example::BoxError> {
//! let harness = ExampleHarness::new(&HarnessConfig::default()).await?;
//! let engine = harness.engine();
//! engine.start().await?;
//! // POST orders to /orders, then inspect harness.processed
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use lambda_harness::{
    HarnessConfig, HttpDispatchServer, HttpHandler, HttpResponse, HttpTrigger,
    InMemoryQueueService, InvocationEngine, QueueHandler, QueuePollDispatcher, QueueService,
    QueueTrigger,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Boxed error used by the example setup code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Queue that receives submitted orders.
pub const ORDERS_QUEUE: &str = "orders";

/// Queue that receives orders after forwarding.
pub const PROCESSED_QUEUE: &str = "processed-orders";

/// Order payload accepted by `POST /orders`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Free-form order description.
    #[serde(default)]
    pub message: String,

    /// Makes the forwarder fail on this order.
    #[serde(default)]
    pub simulate_error: bool,
}

/// Order as it lands on the processed queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedOrder {
    /// The original order description.
    pub message: String,

    /// Message id the order had on the orders queue.
    pub source_message_id: String,

    /// Function that forwarded the order.
    pub forwarded_by: String,
}

#[derive(Debug, Serialize)]
struct Greeting {
    message: String,
    request_id: String,
}

#[derive(Debug, Serialize)]
struct Accepted {
    message_id: String,
    request_id: String,
}

/// Orders collected by the `record-orders` handler.
#[derive(Debug, Clone, Default)]
pub struct ProcessedOrders(Arc<Mutex<Vec<ProcessedOrder>>>);

impl ProcessedOrders {
    /// A snapshot of the orders collected so far.
    pub fn all(&self) -> Vec<ProcessedOrder> {
        self.0.lock().clone()
    }

    /// Number of orders collected so far.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns `true` if nothing has been collected yet.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    fn push(&self, order: ProcessedOrder) {
        self.0.lock().push(order);
    }
}

/// Echoes the JSON request body back with a JSON content type.
pub fn echo_handler() -> HttpHandler {
    HttpHandler::event(|event, context| async move {
        tracing::info!(
            request_id = %context.aws_request_id,
            method = %event.http_method,
            path = %event.path,
            "Echoing request"
        );

        let body = event.body.map(|b| b.to_string()).unwrap_or_default();
        Ok(HttpResponse::ok()
            .with_header("Content-Type", "application/json")
            .with_body(body))
    })
}

/// Greets the `{name}` path parameter.
pub fn greeting_handler() -> HttpHandler {
    HttpHandler::event(|event, context| async move {
        let name = event
            .path_parameters
            .get("name")
            .map(String::as_str)
            .unwrap_or("stranger");

        let greeting = Greeting {
            message: format!("Hello, {name}!"),
            request_id: context.aws_request_id,
        };
        Ok(HttpResponse::json(200, &greeting)?)
    })
}

/// Health check that never looks at the request.
pub fn health_handler() -> HttpHandler {
    HttpHandler::pure(|context| async move {
        tracing::debug!(function = %context.function_name, "Health check");
        Ok(())
    })
}

/// Accepts an order and puts it on the queue at `queue_url`.
///
/// Responds `202` with the message id, or `422` when the body is missing
/// or is not an order.
pub fn submit_order_handler(queues: Arc<dyn QueueService>, queue_url: String) -> HttpHandler {
    HttpHandler::event(move |event, context| {
        let queues = queues.clone();
        let queue_url = queue_url.clone();
        async move {
            let order = match event.body.map(serde_json::from_value::<OrderRequest>) {
                Some(Ok(order)) => order,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Rejecting malformed order");
                    return Ok(HttpResponse::new(422).with_body(e.to_string()));
                }
                None => return Ok(HttpResponse::new(422).with_body("missing order body")),
            };

            let message_id = queues
                .send_message(&queue_url, &serde_json::to_string(&order)?)
                .await?;
            tracing::info!(message_id = %message_id, "Order queued");

            let accepted = Accepted {
                message_id,
                request_id: context.aws_request_id,
            };
            Ok(HttpResponse::json(202, &accepted)?)
        }
    })
}

/// Forwards every order in the batch to the queue at `target_url`.
///
/// An order with `simulate_error` fails the whole batch, so none of its
/// messages are deleted and they come back after the visibility timeout.
pub fn forward_orders_handler(queues: Arc<dyn QueueService>, target_url: String) -> QueueHandler {
    QueueHandler::new(move |batch, context| {
        let queues = queues.clone();
        let target_url = target_url.clone();
        async move {
            tracing::info!(
                request_id = %context.aws_request_id,
                message_count = batch.len(),
                "Forwarding orders"
            );

            for record in batch.records() {
                let order: OrderRequest = serde_json::from_str(&record.body)?;
                if order.simulate_error {
                    tracing::warn!(message_id = %record.message_id, "Order rejected (simulated)");
                    return Err(format!("order {} rejected", record.message_id).into());
                }

                let processed = ProcessedOrder {
                    message: order.message,
                    source_message_id: record.message_id.clone(),
                    forwarded_by: context.function_name.clone(),
                };
                queues
                    .send_message(&target_url, &serde_json::to_string(&processed)?)
                    .await?;
            }
            Ok(())
        }
    })
}

/// Collects every processed order into `sink`.
pub fn record_orders_handler(sink: ProcessedOrders) -> QueueHandler {
    QueueHandler::new(move |batch, _context| {
        let sink = sink.clone();
        async move {
            for record in batch.records() {
                let order: ProcessedOrder = serde_json::from_str(&record.body)?;
                tracing::info!(message = %order.message, "Order processed");
                sink.push(order);
            }
            Ok(())
        }
    })
}

/// The example pipeline, registered and ready to start.
#[derive(Debug)]
pub struct ExampleHarness {
    /// Queue backend shared by the HTTP and queue handlers.
    pub queues: Arc<InMemoryQueueService>,
    /// Serves the example routes.
    pub http: Arc<HttpDispatchServer>,
    /// Polls the example queues.
    pub poller: Arc<QueuePollDispatcher>,
    /// Orders that made it through the pipeline.
    pub processed: ProcessedOrders,
}

impl ExampleHarness {
    /// Creates the example queues and registers every example handler.
    ///
    /// # Errors
    ///
    /// Returns an error if a queue cannot be created or a registration is
    /// rejected.
    pub async fn new(config: &HarnessConfig) -> Result<Self, BoxError> {
        let queues = InMemoryQueueService::new_shared(config.queue.clone());
        let orders_url = queues.create_queue(ORDERS_QUEUE).await?;
        let processed_url = queues.create_queue(PROCESSED_QUEUE).await?;

        let http = Arc::new(HttpDispatchServer::new(config));
        http.register("echo", HttpTrigger::post("/http"), echo_handler())?;
        http.register("greet", HttpTrigger::get("/hello/{name}"), greeting_handler())?;
        http.register("health", HttpTrigger::get("/health"), health_handler())?;
        http.register(
            "submit-order",
            HttpTrigger::post("/orders"),
            submit_order_handler(queues.clone(), orders_url),
        )?;

        let processed = ProcessedOrders::default();
        let poller = Arc::new(QueuePollDispatcher::new(config, queues.clone()));
        poller.register(
            "forward-orders",
            QueueTrigger::new(ORDERS_QUEUE)
                .batch_size(10)
                .wait(Duration::from_millis(20)),
            forward_orders_handler(queues.clone(), processed_url),
        )?;
        poller.register(
            "record-orders",
            QueueTrigger::new(PROCESSED_QUEUE).batch_size(10),
            record_orders_handler(processed.clone()),
        )?;

        Ok(Self {
            queues,
            http,
            poller,
            processed,
        })
    }

    /// An engine that runs both dispatchers.
    pub fn engine(&self) -> InvocationEngine {
        InvocationEngine::new()
            .with_http_server(self.http.clone())
            .with_queue_dispatcher(self.poller.clone())
    }
}
