//! End-to-end admission behavior through a configured pipeline.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, Method, StatusCode};
use tokio::sync::Semaphore;

use turnstile::admission::{CustomResolvers, LimitCallbacks, PolicySet, ScopeFn};
use turnstile::config::TurnstileConfig;
use turnstile::error::HandlerResult;
use turnstile::pipeline::{handler_fn, Handler, Pipeline, RequestContext};
use turnstile::store::MockClock;

const START: u64 = 1_700_000_000;
const PROXY: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

fn client(last_octet: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(198, 51, 100, last_octet))
}

fn get(path: &str, peer: IpAddr) -> RequestContext {
    RequestContext::new(Method::GET, path, peer)
}

fn ok_handler() -> impl Handler {
    handler_fn(|ctx| {
        ctx.respond(StatusCode::OK, "ok");
        Ok(())
    })
}

fn policies(yaml: &str, clock: &MockClock) -> PolicySet {
    let config = TurnstileConfig::from_yaml(yaml).unwrap();
    let mut resolvers = CustomResolvers::new();
    let tenant: ScopeFn = Arc::new(|ctx: &RequestContext| ctx.header("x-tenant").map(str::to_owned));
    resolvers.insert("tenant".to_string(), tenant);
    PolicySet::from_config(&config, &resolvers, &LimitCallbacks::new(), Arc::new(clock.clone()))
        .unwrap()
}

async fn status_of(pipeline: &Pipeline, mut ctx: RequestContext) -> StatusCode {
    pipeline.dispatch(&mut ctx).await;
    ctx.reply().map(|reply| reply.status()).unwrap_or(StatusCode::NO_CONTENT)
}

/// Handler that parks until a permit is released.
struct Gated {
    gate: Arc<Semaphore>,
    entered: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Gated {
    async fn call(&self, ctx: &mut RequestContext) -> HandlerResult {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await?.forget();
        ctx.respond(StatusCode::OK, "done");
        Ok(())
    }
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn rate_limit_boundary_and_window_reset() {
    let clock = MockClock::new(START);
    let policies = policies(
        "rate_limits:\n  - name: r\n    limit: 3\n    window_seconds: 60\n",
        &clock,
    );
    let limiter = Arc::clone(&policies.rate_limiters()[0]);
    let pipeline = policies
        .install(Pipeline::builder())
        .route(Method::GET, "/", ok_handler())
        .build()
        .unwrap();

    for _ in 0..3 {
        assert_eq!(status_of(&pipeline, get("/", client(1))).await, StatusCode::OK);
    }
    assert_eq!(
        status_of(&pipeline, get("/", client(1))).await,
        StatusCode::TOO_MANY_REQUESTS
    );

    clock.advance(Duration::from_secs(60));
    assert_eq!(status_of(&pipeline, get("/", client(1))).await, StatusCode::OK);
    assert_eq!(limiter.current_count(&client(1).to_string()), 1);
}

#[tokio::test]
async fn per_identity_budgets_are_isolated() {
    let clock = MockClock::new(START);
    let pipeline = policies(
        "rate_limits:\n  - name: r\n    limit: 1\n    window_seconds: 60\n",
        &clock,
    )
    .install(Pipeline::builder())
    .route(Method::GET, "/", ok_handler())
    .build()
    .unwrap();

    assert_eq!(status_of(&pipeline, get("/", client(1))).await, StatusCode::OK);
    assert_eq!(
        status_of(&pipeline, get("/", client(1))).await,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(status_of(&pipeline, get("/", client(2))).await, StatusCode::OK);
}

#[tokio::test]
async fn forwarded_clients_behind_trusted_proxy_are_isolated() {
    let clock = MockClock::new(START);
    let pipeline = policies(
        "trusted_proxies: [\"10.0.0.1\"]\nrate_limits:\n  - name: r\n    limit: 1\n    window_seconds: 60\n",
        &clock,
    )
    .install(Pipeline::builder())
    .route(Method::GET, "/", ok_handler())
    .build()
    .unwrap();

    let via_proxy = |forwarded: &'static str| {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(forwarded));
        get("/", PROXY).with_headers(headers)
    };

    assert_eq!(status_of(&pipeline, via_proxy("203.0.113.5")).await, StatusCode::OK);
    assert_eq!(
        status_of(&pipeline, via_proxy("203.0.113.5, 10.0.0.1")).await,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(status_of(&pipeline, via_proxy("203.0.113.6")).await, StatusCode::OK);
}

#[tokio::test]
async fn custom_scope_shares_budget_across_addresses() {
    let clock = MockClock::new(START);
    let pipeline = policies(
        "rate_limits:\n  - name: tenants\n    scope: custom\n    resolver: tenant\n    limit: 1\n    window_seconds: 60\n",
        &clock,
    )
    .install(Pipeline::builder())
    .route(Method::GET, "/", ok_handler())
    .build()
    .unwrap();

    let as_tenant = |peer: IpAddr| {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));
        get("/", peer).with_headers(headers)
    };

    assert_eq!(status_of(&pipeline, as_tenant(client(1))).await, StatusCode::OK);
    assert_eq!(
        status_of(&pipeline, as_tenant(client(2))).await,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_boundary_recovers_after_completion() {
    let clock = MockClock::new(START);
    let policies = policies(
        "connection_limits:\n  - name: c\n    max_connections: 2\n",
        &clock,
    );
    let limiter = Arc::clone(&policies.connection_limiters()[0]);
    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(AtomicUsize::new(0));
    let pipeline = Arc::new(
        policies
            .install(Pipeline::builder())
            .route(
                Method::GET,
                "/slow",
                Gated {
                    gate: Arc::clone(&gate),
                    entered: Arc::clone(&entered),
                },
            )
            .build()
            .unwrap(),
    );

    let spawn_request = || {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { status_of(&pipeline, get("/slow", client(1))).await })
    };

    let first = spawn_request();
    let second = spawn_request();
    wait_for(&entered, 2).await;
    assert_eq!(limiter.in_flight(&client(1).to_string()), 2);

    assert_eq!(
        status_of(&pipeline, get("/slow", client(1))).await,
        StatusCode::TOO_MANY_REQUESTS
    );

    gate.add_permits(1);
    let finished = tokio::select! {
        status = first => status.unwrap(),
        status = second => status.unwrap(),
    };
    assert_eq!(finished, StatusCode::OK);

    let third = spawn_request();
    wait_for(&entered, 3).await;
    gate.add_permits(2);
    assert_eq!(third.await.unwrap(), StatusCode::OK);

    tokio::time::timeout(Duration::from_secs(5), async {
        while limiter.total() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(limiter.tracked_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_outcomes_release_every_slot() {
    let clock = MockClock::new(START);
    let policies = policies(
        "connection_limits:\n  - name: c\n    scope: global\n    max_connections: 64\n    global_max: 64\n",
        &clock,
    );
    let limiter = Arc::clone(&policies.connection_limiters()[0]);
    let pipeline = Arc::new(
        policies
            .install(Pipeline::builder())
            .route(Method::GET, "/ok", ok_handler())
            .route(Method::GET, "/fail", handler_fn(|_| Err("boom".into())))
            .build()
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..48u8 {
        let pipeline = Arc::clone(&pipeline);
        let path = if i % 3 == 0 { "/fail" } else { "/ok" };
        tasks.push(tokio::spawn(async move {
            status_of(&pipeline, get(path, client(i))).await
        }));
    }

    let mut failures = 0;
    for task in tasks {
        let status = task.await.unwrap();
        assert_ne!(status, StatusCode::TOO_MANY_REQUESTS);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            failures += 1;
        }
    }

    assert_eq!(failures, 16);
    assert_eq!(limiter.total(), 0);
    assert_eq!(limiter.in_flight(turnstile::admission::GLOBAL_SCOPE_KEY), 0);
}

#[tokio::test]
async fn connection_limiter_runs_before_rate_limiter() {
    let clock = MockClock::new(START);
    let policies = policies(
        "connection_limits:\n  - name: c\n    max_connections: 1\nrate_limits:\n  - name: r\n    limit: 1\n    window_seconds: 60\n",
        &clock,
    );
    let rate = Arc::clone(&policies.rate_limiters()[0]);
    let conns = Arc::clone(&policies.connection_limiters()[0]);
    let pipeline = policies
        .install(Pipeline::builder())
        .route(Method::GET, "/", ok_handler())
        .build()
        .unwrap();

    let held = conns.acquire(&client(1).to_string()).unwrap();
    assert_eq!(
        status_of(&pipeline, get("/", client(1))).await,
        StatusCode::TOO_MANY_REQUESTS
    );
    // Refused before the rate limiter counted it
    assert_eq!(rate.current_count(&client(1).to_string()), 0);

    drop(held);
    assert_eq!(status_of(&pipeline, get("/", client(1))).await, StatusCode::OK);
    assert_eq!(rate.current_count(&client(1).to_string()), 1);
}

#[derive(Clone, Default)]
struct ErrorEvents(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorEvents {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn failing_handler_logs_once_and_never_escapes() {
    use tracing_subscriber::layer::SubscriberExt;

    let errors = ErrorEvents::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(errors.clone()));

    let clock = MockClock::new(START);
    let pipeline = policies(
        "connection_limits:\n  - name: c\n    max_connections: 4\nrate_limits:\n  - name: r\n    limit: 10\n    window_seconds: 60\n",
        &clock,
    )
    .install(Pipeline::builder())
    .route(Method::POST, "/orders", handler_fn(|_| Err("ledger offline".into())))
    .build()
    .unwrap();

    let mut ctx = RequestContext::new(Method::POST, "/orders", client(9));
    pipeline.dispatch(&mut ctx).await;

    let reply = ctx.reply().unwrap();
    assert_eq!(reply.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.body().as_ref(), br#"{"error":"internal server error"}"#);
    assert_eq!(errors.0.load(Ordering::SeqCst), 1);
}
