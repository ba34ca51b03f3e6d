//! Handler callables and guarded invocation.
//!
//! Handlers are plain async closures. Each one is resolved to a tagged
//! variant at registration so dispatch never has to inspect a callable's
//! signature at runtime.

use crate::context::InvocationContext;
use crate::event::{HttpRequestEvent, HttpResponse, QueueBatchEvent};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

type EventFn = dyn Fn(HttpRequestEvent, InvocationContext) -> BoxFuture<'static, HandlerResult<HttpResponse>>
    + Send
    + Sync;

type PureFn = dyn Fn(InvocationContext) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync;

type BatchFn =
    dyn Fn(QueueBatchEvent, InvocationContext) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync;

/// A handler bound to an HTTP route.
#[derive(Clone)]
pub enum HttpHandler {
    /// Receives the full request event and produces a response.
    Event(Arc<EventFn>),
    /// Receives only the context. The request is answered with `200` and an
    /// empty body once the handler succeeds.
    Pure(Arc<PureFn>),
}

impl HttpHandler {
    /// Wraps a full-event handler.
    ///
    /// # Examples
    ///
    /// ```
    /// use lambda_harness::event::HttpResponse;
    /// use lambda_harness::handler::HttpHandler;
    ///
    /// let handler = HttpHandler::event(|event, _context| async move {
    ///     let body = event.body.map(|b| b.to_string()).unwrap_or_default();
    ///     Ok(HttpResponse::ok().with_body(body))
    /// });
    /// assert!(!handler.is_pure());
    /// ```
    pub fn event<F, Fut>(handler: F) -> Self
    where
        F: Fn(HttpRequestEvent, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<HttpResponse>> + Send + 'static,
    {
        HttpHandler::Event(Arc::new(move |event, context| handler(event, context).boxed()))
    }

    /// Wraps a handler that ignores the request.
    pub fn pure<F, Fut>(handler: F) -> Self
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        HttpHandler::Pure(Arc::new(move |context| handler(context).boxed()))
    }

    /// Returns `true` for handlers that never see the request event.
    pub fn is_pure(&self) -> bool {
        matches!(self, HttpHandler::Pure(_))
    }
}

impl fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpHandler::Event(_) => f.write_str("HttpHandler::Event"),
            HttpHandler::Pure(_) => f.write_str("HttpHandler::Pure"),
        }
    }
}

/// A handler bound to a queue.
#[derive(Clone)]
pub struct QueueHandler(Arc<BatchFn>);

impl QueueHandler {
    /// Wraps a batch handler.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(QueueBatchEvent, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        QueueHandler(Arc::new(move |batch, context| handler(batch, context).boxed()))
    }

    /// Invokes the handler on its own task.
    pub(crate) async fn invoke(
        &self,
        batch: QueueBatchEvent,
        context: InvocationContext,
    ) -> Result<(), InvokeFailure> {
        run_guarded((self.0)(batch, context)).await
    }
}

impl fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueHandler")
    }
}

/// Why an invocation did not complete successfully.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeFailure {
    /// The handler returned an error.
    #[error("handler returned an error: {0}")]
    Error(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler task was cancelled before completing.
    #[error("handler task was cancelled")]
    Cancelled,
}

/// Runs a handler future on a separate task so a panic is reported instead of
/// unwinding into the dispatcher.
pub(crate) async fn run_guarded<T>(
    future: BoxFuture<'static, HandlerResult<T>>,
) -> Result<T, InvokeFailure>
where
    T: Send + 'static,
{
    match tokio::spawn(future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(InvokeFailure::Error(err.to_string())),
        Err(join_err) if join_err.is_panic() => {
            Err(InvokeFailure::Panicked(panic_message(join_err.into_panic())))
        }
        Err(_) => Err(InvokeFailure::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
