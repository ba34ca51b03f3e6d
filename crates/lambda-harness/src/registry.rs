//! Handler registries keyed by function name.
//!
//! A registry is generic over its trigger kind. The kind decides how trigger
//! parameters are validated and what happens when a name is registered twice:
//! HTTP registrations overwrite, queue registrations are rejected.

use crate::error::{RegistryError, RegistryResult};
use crate::event::HttpMethod;
use crate::handler::{HttpHandler, QueueHandler};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// What to do when a name is registered a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Replace the existing handler, keeping its position.
    Overwrite,
    /// Fail with [`RegistryError::DuplicateName`].
    Reject,
}

/// A trigger kind handlers can be bound to.
pub trait Trigger: Clone + Debug + Send + Sync + 'static {
    /// Handler type accepted for this trigger.
    type Handler: Clone + Debug + Send + Sync + 'static;

    /// Duplicate-name policy for registries of this kind.
    const DUPLICATES: DuplicatePolicy;

    /// Checks that the trigger parameters can be served.
    fn validate(&self, function_name: &str) -> RegistryResult<()>;
}

/// An HTTP route trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpTrigger {
    /// Method the route answers.
    pub method: HttpMethod,
    /// Route template. Path parameters use `{name}` segments.
    pub path: String,
}

impl HttpTrigger {
    /// Creates a trigger for `method` on `path`.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    /// Creates a `GET` trigger.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// Creates a `POST` trigger.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    /// Names of the `{name}` parameters in the template, in order.
    pub fn param_names(&self) -> Vec<String> {
        self.path
            .split('/')
            .filter_map(|segment| segment.strip_prefix('{')?.strip_suffix('}'))
            .map(str::to_string)
            .collect()
    }
}

impl Trigger for HttpTrigger {
    type Handler = HttpHandler;

    const DUPLICATES: DuplicatePolicy = DuplicatePolicy::Overwrite;

    fn validate(&self, function_name: &str) -> RegistryResult<()> {
        let invalid = |reason: String| RegistryError::InvalidTrigger {
            name: function_name.to_string(),
            reason,
        };

        let Some(rest) = self.path.strip_prefix('/') else {
            return Err(invalid(format!("path must start with '/': {}", self.path)));
        };
        if rest.is_empty() {
            return Ok(());
        }

        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(invalid(format!("path has an empty segment: {}", self.path)));
            }
            if segment.starts_with(':') || segment.starts_with('*') {
                return Err(invalid(format!(
                    "unsupported segment '{segment}', use {{name}} for parameters"
                )));
            }
            if let Some(inner) = segment.strip_prefix('{') {
                let valid = inner.strip_suffix('}').is_some_and(|name| {
                    !name.is_empty()
                        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                });
                if !valid {
                    return Err(invalid(format!("invalid path parameter '{segment}'")));
                }
            } else if segment.contains(['{', '}']) {
                return Err(invalid(format!(
                    "path parameters must span a whole segment: '{segment}'"
                )));
            }
        }

        let names = self.param_names();
        for (index, name) in names.iter().enumerate() {
            if names[..index].contains(name) {
                return Err(invalid(format!("path parameter '{name}' appears twice")));
            }
        }

        Ok(())
    }
}

/// A queue trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTrigger {
    /// Queue to poll.
    pub queue_name: String,
    /// Maximum number of messages per batch.
    pub batch_size: u32,
    /// Long-poll wait for each receive.
    pub wait: Duration,
}

impl QueueTrigger {
    /// Creates a trigger for `queue_name` delivering one message per batch
    /// without long polling.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            batch_size: 1,
            wait: Duration::ZERO,
        }
    }

    /// Sets the maximum batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the long-poll wait.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl Trigger for QueueTrigger {
    type Handler = QueueHandler;

    const DUPLICATES: DuplicatePolicy = DuplicatePolicy::Reject;

    fn validate(&self, function_name: &str) -> RegistryResult<()> {
        let invalid = |reason: &str| RegistryError::InvalidTrigger {
            name: function_name.to_string(),
            reason: reason.to_string(),
        };

        if self.queue_name.trim().is_empty() {
            return Err(invalid("queue name is empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch size must be at least 1"));
        }
        Ok(())
    }
}

/// A handler bound to a trigger under a function name.
#[derive(Debug, Clone)]
pub struct Registration<T: Trigger> {
    name: String,
    trigger: T,
    handler: T::Handler,
}

impl<T: Trigger> Registration<T> {
    /// Creates a registration.
    pub fn new(name: impl Into<String>, trigger: T, handler: T::Handler) -> Self {
        Self {
            name: name.into(),
            trigger,
            handler,
        }
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trigger parameters.
    pub fn trigger(&self) -> &T {
        &self.trigger
    }

    /// Handler callable.
    pub fn handler(&self) -> &T::Handler {
        &self.handler
    }
}

/// Point-in-time view of a registry, in registration order.
///
/// Iterating a snapshot never observes later registry changes and can be
/// repeated any number of times.
#[derive(Debug, Clone)]
pub struct Snapshot<T: Trigger> {
    entries: Arc<[Arc<Registration<T>>]>,
}

impl<T: Trigger> Snapshot<T> {
    /// Iterates the registrations.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Registration<T>>> {
        self.entries.iter()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a, T: Trigger> IntoIterator for &'a Snapshot<T> {
    type Item = &'a Arc<Registration<T>>;
    type IntoIter = std::slice::Iter<'a, Arc<Registration<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Name-keyed set of registrations for one trigger kind.
#[derive(Debug)]
pub struct Registry<T: Trigger> {
    entries: RwLock<IndexMap<String, Arc<Registration<T>>>>,
}

/// Registry of HTTP routes.
pub type HttpRegistry = Registry<HttpTrigger>;

/// Registry of queue subscriptions.
pub type QueueRegistry = Registry<QueueTrigger>;

impl<T: Trigger> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }
}

impl<T: Trigger> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTrigger`] when the name is empty or the
    /// trigger cannot be served, and [`RegistryError::DuplicateName`] when the
    /// name is taken and this kind rejects duplicates.
    pub fn register(&self, registration: Registration<T>) -> RegistryResult<()> {
        if registration.name.trim().is_empty() {
            return Err(RegistryError::InvalidTrigger {
                name: registration.name,
                reason: "function name is empty".to_string(),
            });
        }
        registration.trigger.validate(&registration.name)?;

        let mut entries = self.entries.write();
        if entries.contains_key(&registration.name) {
            match T::DUPLICATES {
                DuplicatePolicy::Reject => {
                    return Err(RegistryError::DuplicateName(registration.name));
                }
                DuplicatePolicy::Overwrite => {
                    tracing::debug!(function = %registration.name, "Replacing registered handler");
                }
            }
        }

        // IndexMap::insert keeps the original position of an existing key.
        entries.insert(registration.name.clone(), Arc::new(registration));
        Ok(())
    }

    /// Removes a registration by name and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown names.
    pub fn unregister(&self, name: &str) -> RegistryResult<Arc<Registration<T>>> {
        self.entries
            .write()
            .shift_remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Looks up a registration by name.
    pub fn get(&self, name: &str) -> Option<Arc<Registration<T>>> {
        self.entries.read().get(name).cloned()
    }

    /// Returns a snapshot of the current registrations.
    pub fn list(&self) -> Snapshot<T> {
        Snapshot {
            entries: self.entries.read().values().cloned().collect(),
        }
    }

    /// Registered function names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HttpResponse;
    use proptest::prelude::*;

    fn echo() -> HttpHandler {
        HttpHandler::event(|_event, _context| async { Ok(HttpResponse::ok()) })
    }

    fn noop() -> QueueHandler {
        QueueHandler::new(|_batch, _context| async { Ok(()) })
    }

    #[test]
    fn http_duplicate_overwrites_in_place() {
        let registry = HttpRegistry::new();
        registry
            .register(Registration::new("a", HttpTrigger::get("/a"), echo()))
            .unwrap();
        registry
            .register(Registration::new("b", HttpTrigger::get("/b"), echo()))
            .unwrap();
        registry
            .register(Registration::new("a", HttpTrigger::post("/a2"), echo()))
            .unwrap();

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().trigger().path, "/a2");
    }

    #[test]
    fn queue_duplicate_is_rejected() {
        let registry = QueueRegistry::new();
        registry
            .register(Registration::new("f", QueueTrigger::new("123"), noop()))
            .unwrap();

        let err = registry
            .register(Registration::new("f", QueueTrigger::new("321"), noop()))
            .unwrap_err();

        assert_eq!(err, RegistryError::DuplicateName("f".to_string()));
        assert_eq!(registry.get("f").unwrap().trigger().queue_name, "123");
    }

    #[test]
    fn unregister_unknown_name_is_not_found() {
        let registry = QueueRegistry::new();
        let err = registry.unregister("missing").unwrap_err();
        assert_eq!(err, RegistryError::NotFound("missing".to_string()));
    }

    #[test]
    fn unregister_keeps_remaining_order() {
        let registry = QueueRegistry::new();
        for name in ["a", "b", "c"] {
            registry
                .register(Registration::new(name, QueueTrigger::new(name), noop()))
                .unwrap();
        }

        registry.unregister("b").unwrap();
        assert_eq!(registry.names(), vec!["a", "c"]);
    }

    #[test]
    fn snapshot_ignores_later_changes() {
        let registry = QueueRegistry::new();
        registry
            .register(Registration::new("a", QueueTrigger::new("q"), noop()))
            .unwrap();

        let snapshot = registry.list();
        registry
            .register(Registration::new("b", QueueTrigger::new("q"), noop()))
            .unwrap();
        registry.unregister("a").unwrap();

        let names: Vec<_> = snapshot.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(snapshot.iter().count(), 1);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let registry = QueueRegistry::new();
        let err = registry
            .register(Registration::new(
                "f",
                QueueTrigger::new("q").batch_size(0),
                noop(),
            ))
            .unwrap_err();

        assert!(matches!(err, RegistryError::InvalidTrigger { .. }));
    }

    #[test]
    fn empty_names_are_invalid() {
        let registry = HttpRegistry::new();
        let err = registry
            .register(Registration::new("", HttpTrigger::get("/"), echo()))
            .unwrap_err();

        assert!(matches!(err, RegistryError::InvalidTrigger { .. }));
    }

    #[test]
    fn path_validation() {
        for valid in ["/", "/http", "/items/{id}", "/a/{b}/c/{d_2}"] {
            assert!(HttpTrigger::get(valid).validate("f").is_ok(), "{valid}");
        }
        for invalid in [
            "",
            "http",
            "/a//b",
            "/a/",
            "/items/:id",
            "/files/*rest",
            "/items/{}",
            "/items/x{id}",
            "/items/{id",
            "/{id}/{id}",
        ] {
            assert!(HttpTrigger::get(invalid).validate("f").is_err(), "{invalid}");
        }
    }

    #[test]
    fn param_names_in_order() {
        let trigger = HttpTrigger::get("/users/{user}/posts/{post}");
        assert_eq!(trigger.param_names(), vec!["user", "post"]);
    }

    proptest! {
        #[test]
        fn listing_preserves_registration_order(count in 1usize..20) {
            let registry = QueueRegistry::new();
            let names: Vec<String> = (0..count).map(|i| format!("fn-{i}")).collect();
            for name in &names {
                registry
                    .register(Registration::new(name.clone(), QueueTrigger::new("q"), noop()))
                    .unwrap();
            }

            let listed: Vec<String> = registry.list().iter().map(|r| r.name().to_string()).collect();
            prop_assert_eq!(listed, names);
        }
    }
}
