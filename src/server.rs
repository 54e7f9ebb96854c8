//! HTTP front end that feeds requests into the pipeline.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::pipeline::{Pipeline, Reply, RequestContext};

#[derive(Clone)]
struct ServerState {
    pipeline: Arc<Pipeline>,
    max_body_bytes: usize,
}

/// HTTP server for the admission pipeline.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: ServerState,
}

impl HttpServer {
    /// Create a new server that dispatches every request to `pipeline`.
    pub fn new(addr: SocketAddr, pipeline: Arc<Pipeline>, max_body_bytes: usize) -> Self {
        Self {
            addr,
            state: ServerState {
                pipeline,
                max_body_bytes,
            },
        }
    }

    /// The axum router. Every path goes through the pipeline's own routing.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch_request)
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;
        self.run(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// In-flight requests finish before this returns.
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            routes = self.state.pipeline.route_count(),
            "Starting HTTP server with graceful shutdown"
        );

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn dispatch_request(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(peer = %peer, error = %err, "Rejecting unreadable request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let mut ctx = RequestContext::new(parts.method, parts.uri.path(), peer.ip())
        .with_headers(parts.headers)
        .with_body(body);

    state.pipeline.dispatch(&mut ctx).await;

    debug!(
        request_id = %ctx.id(),
        method = %ctx.method(),
        path = %ctx.path(),
        status = ?ctx.reply().map(Reply::status),
        aborted = ctx.is_aborted(),
        "Request dispatched"
    );

    let aborted = ctx.is_aborted();
    into_http_response(ctx.take_reply(), aborted)
}

/// Convert the committed reply into an HTTP response.
///
/// A request nobody replied to becomes `204 No Content`. An aborted request
/// asks the client to drop the connection.
fn into_http_response(reply: Option<Reply>, aborted: bool) -> Response {
    let mut response = match reply {
        Some(reply) => {
            let (status, headers, body) = reply.into_parts();
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        None => {
            let mut response = Response::new(Body::from(Bytes::new()));
            *response.status_mut() = StatusCode::NO_CONTENT;
            response
        }
    };

    if aborted {
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handler_fn;
    use axum::http::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[test]
    fn test_missing_reply_is_no_content() {
        let response = into_http_response(None, false);

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(header::CONNECTION).is_none());
    }

    #[test]
    fn test_reply_headers_carried_over() {
        let reply = Reply::new(StatusCode::TOO_MANY_REQUESTS, "slow down")
            .with_header(header::RETRY_AFTER, HeaderValue::from_static("7"));
        let response = into_http_response(Some(reply), false);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn test_aborted_request_closes_connection() {
        let response = into_http_response(None, true);

        assert_eq!(response.headers()[header::CONNECTION], "close");
    }

    async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn test_serves_pipeline_over_http() {
        let pipeline = Pipeline::builder()
            .route(
                Method::GET,
                "/health",
                handler_fn(|ctx| {
                    ctx.respond(StatusCode::OK, "ok");
                    Ok(())
                }),
            )
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = HttpServer::new(addr, Arc::new(pipeline), 1024);
        let handle = tokio::spawn(server.run(listener, async {
            let _ = stop_rx.await;
        }));

        let ok = roundtrip(addr, "GET /health HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n").await;
        assert!(ok.starts_with("HTTP/1.1 200"), "{}", ok);
        assert!(ok.ends_with("ok"));

        let missing = roundtrip(addr, "GET /nope HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{}", missing);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
