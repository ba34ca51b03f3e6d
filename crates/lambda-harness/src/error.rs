//! Error types for the invocation harness.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised synchronously by handler registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A function with this name is already registered.
    #[error("Function already registered: {0}")]
    DuplicateName(String),

    /// No function with this name is registered.
    #[error("Function not found: {0}")]
    NotFound(String),

    /// The trigger parameters cannot be served.
    #[error("Invalid trigger for {name}: {reason}")]
    InvalidTrigger {
        /// Function the trigger belongs to.
        name: String,
        /// Why the trigger was rejected.
        reason: String,
    },
}

/// Errors raised while turning a raw trigger into an event envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// The HTTP request body is not valid JSON.
    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    /// The received queue batch cannot be mapped to records.
    #[error("Malformed message batch: {0}")]
    MalformedBatch(String),
}

/// Errors reported by a [`QueueService`](crate::queue::QueueService).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No queue exists with this name or URL.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The receipt handle does not belong to an in-flight message.
    #[error("Receipt handle is invalid: {0}")]
    ReceiptHandleInvalid(String),

    /// The queue backend could not serve the request.
    #[error("Queue service unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the dispatchers and the engine lifecycle.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The configured address is already bound by another listener.
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Error binding to the specified address.
    #[error("Failed to bind to address: {0}")]
    Bind(String),

    /// Error starting or running the HTTP server.
    #[error("Failed to start server: {0}")]
    ServerStart(String),

    /// Two routes cannot be served by the same routing table.
    #[error("Route conflict: {0}")]
    RouteConflict(String),

    /// The dispatcher is already running.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Timeout occurred while waiting for a condition.
    #[error("Timeout occurred: {0}")]
    Timeout(String),

    /// Registration error surfaced through the engine.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The layered configuration could not be extracted.
    #[error("configuration error")]
    Figment(#[source] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for queue service operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
