//! HTTP dispatch server.
//!
//! On start the server snapshots its registry into an immutable
//! [`RouteTable`], turns it into an axum router and serves it until stopped.
//! Registrations made while running only take effect after a restart.

use crate::config::{FunctionConfig, HarnessConfig, HttpConfig};
use crate::context::InvocationContext;
use crate::error::{EngineError, EngineResult, RegistryResult};
use crate::event::{HttpMethod, HttpResponse};
use crate::handler::{HttpHandler, InvokeFailure, run_guarded};
use crate::registry::{HttpRegistry, HttpTrigger, Registration, Snapshot};
use crate::translate::{EventEnvironment, MatchedRoute, RawHttpRequest, translate_http};
use axum::Router;
use axum::body::Body;
use axum::extract::{FromRequestParts, Path, Query, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A single served route.
#[derive(Debug)]
pub struct Route {
    /// Function the route dispatches to.
    pub function_name: String,
    /// Method the route answers.
    pub method: HttpMethod,
    /// Route template.
    pub template: String,
    /// Handler invoked for matching requests.
    pub handler: HttpHandler,
}

/// Immutable routing table keyed by `(method, path)`.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: BTreeMap<(String, HttpMethod), Arc<Route>>,
}

impl RouteTable {
    /// Builds a table from a registry snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RouteConflict`] when two functions are bound to
    /// the same method and path, or when two templates name the same
    /// parameter segment differently (`/items/{id}` next to `/items/{name}`).
    pub fn build(snapshot: &Snapshot<HttpTrigger>) -> EngineResult<Self> {
        let mut routes: BTreeMap<(String, HttpMethod), Arc<Route>> = BTreeMap::new();

        for registration in snapshot {
            let trigger = registration.trigger();
            let key = (trigger.path.clone(), trigger.method);
            if let Some(existing) = routes.get(&key) {
                return Err(EngineError::RouteConflict(format!(
                    "{} {} is bound to both {} and {}",
                    trigger.method,
                    trigger.path,
                    existing.function_name,
                    registration.name()
                )));
            }
            if let Some(existing) = routes
                .values()
                .find(|route| parameters_clash(&route.template, &trigger.path))
            {
                return Err(EngineError::RouteConflict(format!(
                    "{} ({}) and {} ({}) use different parameter names for the same segment",
                    existing.template,
                    existing.function_name,
                    trigger.path,
                    registration.name()
                )));
            }

            routes.insert(
                key,
                Arc::new(Route {
                    function_name: registration.name().to_string(),
                    method: trigger.method,
                    template: trigger.path.clone(),
                    handler: registration.handler().clone(),
                }),
            );
        }

        Ok(Self { routes })
    }

    /// Looks up the route for a method and template.
    pub fn get(&self, method: HttpMethod, path: &str) -> Option<&Route> {
        self.routes
            .get(&(path.to_string(), method))
            .map(Arc::as_ref)
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` when no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Converts the table into an axum router.
    fn into_router(self, environment: Arc<DispatchEnvironment>) -> Router {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();

        for ((path, method), route) in self.routes {
            let filter = match method {
                HttpMethod::Get => MethodFilter::GET,
                HttpMethod::Post => MethodFilter::POST,
            };
            let environment = environment.clone();
            let handler = move |request: Request| async move {
                dispatch(route, environment, request).await
            };

            let method_router = by_path
                .remove(&path)
                .unwrap_or_else(|| MethodRouter::new().fallback(method_not_allowed));
            by_path.insert(path, method_router.on(filter, handler));
        }

        by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(&path, method_router)
            })
            .fallback(|req: Request| async move {
                tracing::warn!(
                    method = %req.method(),
                    uri = %req.uri(),
                    "Unhandled request"
                );
                StatusCode::NOT_FOUND
            })
    }
}

/// Two templates clash when they agree up to a segment where both take a
/// parameter under different names. The router cannot tell such routes apart.
fn parameters_clash(left: &str, right: &str) -> bool {
    let is_param = |segment: &str| segment.starts_with('{');
    left.split('/')
        .zip(right.split('/'))
        .find(|(a, b)| a != b)
        .is_some_and(|(a, b)| is_param(a) && is_param(b))
}

async fn method_not_allowed(req: Request) -> StatusCode {
    tracing::warn!(
        method = %req.method(),
        uri = %req.uri(),
        "Method not allowed"
    );
    StatusCode::METHOD_NOT_ALLOWED
}

#[derive(Debug)]
struct DispatchEnvironment {
    event: EventEnvironment,
    function: FunctionConfig,
}

async fn dispatch(
    route: Arc<Route>,
    environment: Arc<DispatchEnvironment>,
    request: Request,
) -> Response {
    let context = InvocationContext::new(&route.function_name, &environment.function);
    let request_id = context.aws_request_id.clone();

    let result = match &route.handler {
        HttpHandler::Pure(handler) => run_guarded(handler(context))
            .await
            .map(|()| HttpResponse::ok()),
        HttpHandler::Event(handler) => {
            let raw = match raw_request(request).await {
                Ok(raw) => raw,
                Err(response) => return response,
            };
            let matched = MatchedRoute {
                method: route.method,
                template: &route.template,
            };
            let event = match translate_http(raw, matched, &environment.event) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(function = %route.function_name, error = %err, "Rejected request");
                    return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
                }
            };
            run_guarded(handler(event, context)).await
        }
    };

    let response =
        result.and_then(|response| into_response(response).map_err(InvokeFailure::Error));

    match response {
        Ok(response) => {
            tracing::debug!(
                function = %route.function_name,
                request_id = %request_id,
                status = response.status().as_u16(),
                "Invocation complete"
            );
            response
        }
        Err(failure) => {
            tracing::error!(
                function = %route.function_name,
                request_id = %request_id,
                error = %failure,
                "Invocation failed"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn raw_request(request: Request) -> Result<RawHttpRequest, Response> {
    let (mut parts, body) = request.into_parts();

    let path_params = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
        .await
        .map(|Path(params)| params)
        .unwrap_or_default();
    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(query)| query)
        .unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;

    Ok(RawHttpRequest {
        path: parts.uri.path().to_string(),
        headers,
        query,
        path_params,
        body,
    })
}

fn into_response(response: HttpResponse) -> Result<Response, String> {
    let status = StatusCode::from_u16(response.status_code)
        .map_err(|_| format!("invalid status code {}", response.status_code))?;

    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(response.body.unwrap_or_default()))
        .map_err(|e| e.to_string())
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<EngineResult<()>>,
}

/// Serves registered HTTP handlers on one listener.
///
/// # Examples
///
/// ```no_run
/// use lambda_harness::config::HarnessConfig;
/// use lambda_harness::event::HttpResponse;
/// use lambda_harness::handler::HttpHandler;
/// use lambda_harness::http_server::HttpDispatchServer;
/// use lambda_harness::registry::HttpTrigger;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = HttpDispatchServer::new(&HarnessConfig::default());
/// server.register(
///     "echo",
///     HttpTrigger::post("/http"),
///     HttpHandler::event(|event, _context| async move {
///         let body = event.body.map(|b| b.to_string()).unwrap_or_default();
///         Ok(HttpResponse::ok().with_body(body))
///     }),
/// )?;
///
/// let addr = server.start().await?;
/// println!("listening on http://{addr}");
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct HttpDispatchServer {
    registry: HttpRegistry,
    http: HttpConfig,
    function: FunctionConfig,
    running: Mutex<Option<RunningServer>>,
}

impl HttpDispatchServer {
    /// Creates a stopped server from the harness configuration.
    pub fn new(config: &HarnessConfig) -> Self {
        Self::with_config(config.http.clone(), config.function.clone())
    }

    /// Creates a stopped server from its individual configuration sections.
    pub fn with_config(http: HttpConfig, function: FunctionConfig) -> Self {
        Self {
            registry: HttpRegistry::new(),
            http,
            function,
            running: Mutex::new(None),
        }
    }

    /// Binds `handler` to `trigger` under `name`, replacing any handler
    /// already registered under that name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or the path is invalid.
    pub fn register(
        &self,
        name: impl Into<String>,
        trigger: HttpTrigger,
        handler: HttpHandler,
    ) -> RegistryResult<()> {
        self.registry
            .register(Registration::new(name, trigger, handler))
    }

    /// Removes a registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`](crate::error::RegistryError::NotFound)
    /// for unknown names.
    pub fn unregister(&self, name: &str) -> RegistryResult<()> {
        self.registry.unregister(name).map(|_| ())
    }

    /// The server's registry.
    pub fn registry(&self) -> &HttpRegistry {
        &self.registry
    }

    /// Returns the bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|server| server.addr)
    }

    /// Returns `true` while the server is running.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|server| !server.handle.is_finished())
    }

    /// Snapshots the registry, binds the listener and starts serving.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port `0` was requested.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyRunning`] if the server is running.
    /// - [`EngineError::RouteConflict`] if the routes cannot be served together.
    /// - [`EngineError::AddressInUse`] if the port is taken.
    /// - [`EngineError::Bind`] for any other bind failure.
    pub async fn start(&self) -> EngineResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EngineError::AlreadyRunning("HTTP dispatch server"));
        }

        let table = RouteTable::build(&self.registry.list())?;
        let route_count = table.len();
        let environment = Arc::new(DispatchEnvironment {
            event: EventEnvironment::new(&self.http, &self.function),
            function: self.function.clone(),
        });
        let router = table.into_router(environment);

        let addr = tokio::net::lookup_host((self.http.host.as_str(), self.http.port))
            .await
            .map_err(|e| EngineError::Bind(e.to_string()))?
            .next()
            .ok_or_else(|| EngineError::Bind(format!("cannot resolve {}", self.http.host)))?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                EngineError::AddressInUse(addr)
            } else {
                EngineError::Bind(e.to_string())
            }
        })?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| EngineError::ServerStart(e.to_string()))?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .map_err(|e| EngineError::ServerStart(e.to_string()))
        });

        tracing::info!(
            target: "lambda_harness",
            address = %local_addr,
            routes = route_count,
            "HTTP dispatch server listening"
        );

        *running = Some(RunningServer {
            addr: local_addr,
            shutdown,
            handle,
        });
        Ok(local_addr)
    }

    /// Stops accepting connections, drains in-flight requests and releases
    /// the listener. Does nothing if the server is not running.
    pub async fn stop(&self) {
        let Some(server) = self.running.lock().await.take() else {
            return;
        };

        server.shutdown.cancel();
        match server.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "HTTP dispatch server exited with error"),
            Err(e) => tracing::warn!(error = %e, "HTTP dispatch server task failed"),
        }

        tracing::info!(
            target: "lambda_harness",
            address = %server.addr,
            "HTTP dispatch server stopped"
        );
    }
}

impl std::fmt::Debug for HttpDispatchServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDispatchServer")
            .field("host", &self.http.host)
            .field("port", &self.http.port)
            .field("functions", &self.registry.names())
            .finish()
    }
}
