//! Chain composition, route table and the top-level error boundary.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use futures::FutureExt;
use tracing::{debug, error, info};

use super::context::{Reply, RequestContext};
use super::middleware::{handler_fn, Handler, Middleware, Next};
use crate::error::{HandlerResult, Result, TurnstileError};

/// Outermost stage of every chain.
///
/// Catches any error or panic escaping the downstream stages exactly once,
/// logs it, and commits a generic 500 reply unless a reply was already
/// committed. Never lets the failure reach the caller of the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorBoundary;

#[async_trait]
impl Middleware for ErrorBoundary {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult {
        let outcome = AssertUnwindSafe(next.run(ctx)).catch_unwind().await;

        let failure = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        error!(
            request_id = %ctx.id(),
            method = %ctx.method(),
            path = %ctx.path(),
            error = %failure,
            "Unhandled failure in request pipeline"
        );

        if !ctx.is_committed() {
            ctx.respond_with(Reply::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &serde_json::json!({ "error": "internal server error" }),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "error_boundary"
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

/// A fully composed chain: boundary, global stages, group stages, handler.
struct Chain {
    stages: Arc<[Arc<dyn Middleware>]>,
    handler: Arc<dyn Handler>,
}

impl Chain {
    fn new(stages: Vec<Arc<dyn Middleware>>, handler: Arc<dyn Handler>) -> Self {
        Self {
            stages: stages.into(),
            handler,
        }
    }

    async fn run(&self, ctx: &mut RequestContext) -> HandlerResult {
        Next::new(&self.stages, self.handler.as_ref()).run(ctx).await
    }
}

struct RouteEntry {
    method: Method,
    path: String,
    group: Option<String>,
    handler: Arc<dyn Handler>,
}

/// Registers middleware and routes, then composes one chain per route.
pub struct PipelineBuilder {
    global: Vec<Arc<dyn Middleware>>,
    groups: HashMap<String, Vec<Arc<dyn Middleware>>>,
    routes: Vec<RouteEntry>,
    fallback: Option<Arc<dyn Handler>>,
}

impl PipelineBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            global: Vec::new(),
            groups: HashMap::new(),
            routes: Vec::new(),
            fallback: None,
        }
    }

    /// Append a middleware that applies to every request.
    pub fn global<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.global.push(Arc::new(middleware));
        self
    }

    /// Append a middleware to a named group, creating the group if needed.
    pub fn group<M: Middleware + 'static>(mut self, group: &str, middleware: M) -> Self {
        self.groups
            .entry(group.to_string())
            .or_default()
            .push(Arc::new(middleware));
        self
    }

    /// Declare a group with no middleware of its own.
    pub fn empty_group(mut self, group: &str) -> Self {
        self.groups.entry(group.to_string()).or_default();
        self
    }

    /// Register a route outside any group.
    pub fn route<H: Handler + 'static>(mut self, method: Method, path: &str, handler: H) -> Self {
        self.routes.push(RouteEntry {
            method,
            path: path.to_string(),
            group: None,
            handler: Arc::new(handler),
        });
        self
    }

    /// Register a route that also runs the stages of `group`.
    pub fn group_route<H: Handler + 'static>(
        mut self,
        group: &str,
        method: Method,
        path: &str,
        handler: H,
    ) -> Self {
        self.routes.push(RouteEntry {
            method,
            path: path.to_string(),
            group: Some(group.to_string()),
            handler: Arc::new(handler),
        });
        self
    }

    /// Handler for requests that match no route. Defaults to a 404 reply.
    pub fn fallback<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Compose every chain.
    ///
    /// Fails if a route names an undeclared group or a `(method, path)`
    /// pair is registered twice.
    pub fn build(self) -> Result<Pipeline> {
        let boundary: Arc<dyn Middleware> = Arc::new(ErrorBoundary);
        let mut routes: HashMap<Method, HashMap<String, Chain>> = HashMap::new();

        for route in self.routes {
            let mut stages = Vec::with_capacity(1 + self.global.len());
            stages.push(Arc::clone(&boundary));
            stages.extend(self.global.iter().cloned());

            if let Some(group) = &route.group {
                let group_stages = self.groups.get(group).ok_or_else(|| {
                    TurnstileError::Config(format!(
                        "route {} {} references unknown middleware group '{}'",
                        route.method, route.path, group
                    ))
                })?;
                stages.extend(group_stages.iter().cloned());
            }

            debug!(
                method = %route.method,
                path = %route.path,
                group = ?route.group,
                stages = stages.len(),
                "Composed route chain"
            );

            let by_path = routes.entry(route.method.clone()).or_default();
            if by_path.contains_key(&route.path) {
                return Err(TurnstileError::Config(format!(
                    "route {} {} registered twice",
                    route.method, route.path
                )));
            }
            by_path.insert(route.path, Chain::new(stages, route.handler));
        }

        let fallback_handler: Arc<dyn Handler> = match self.fallback {
            Some(handler) => handler,
            None => Arc::new(not_found()),
        };
        let mut fallback_stages = Vec::with_capacity(1 + self.global.len());
        fallback_stages.push(boundary);
        fallback_stages.extend(self.global.iter().cloned());

        let pipeline = Pipeline {
            route_count: routes.values().map(HashMap::len).sum(),
            routes,
            fallback: Chain::new(fallback_stages, fallback_handler),
        };

        info!(
            routes = pipeline.route_count,
            global_stages = self.global.len(),
            groups = self.groups.len(),
            "Pipeline built"
        );
        Ok(pipeline)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found() -> impl Handler {
    handler_fn(|ctx| {
        ctx.respond_with(Reply::json(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "error": "not found" }),
        ));
        Ok(())
    })
}

/// The composed request pipeline.
///
/// Chains are built once by [`PipelineBuilder::build`]; dispatching a
/// request only looks up the matching chain and runs it.
pub struct Pipeline {
    routes: HashMap<Method, HashMap<String, Chain>>,
    fallback: Chain,
    route_count: usize,
}

impl Pipeline {
    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Run the chain matching the request.
    ///
    /// Never fails: downstream errors are resolved by the error boundary
    /// and reflected in the reply committed on `ctx`.
    pub async fn dispatch(&self, ctx: &mut RequestContext) {
        let chain = self.resolve(ctx.method(), ctx.path());
        if let Err(err) = chain.run(ctx).await {
            // The boundary absorbs every failure; nothing should get here.
            error!(request_id = %ctx.id(), error = %err, "Failure escaped error boundary");
        }
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.route_count
    }

    fn resolve(&self, method: &Method, path: &str) -> &Chain {
        self.routes
            .get(method)
            .and_then(|by_path| by_path.get(path))
            .unwrap_or(&self.fallback)
    }
}
