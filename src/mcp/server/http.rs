//! HTTP front end for the dispatcher.
//!
//! Each `POST /` or `POST /mcp` body is one JSON-RPC message and the reply
//! is the response body. `GET /health` answers without authentication.
//!
//! When the server requires auth, requests must carry
//! `Authorization: Bearer <token>`. A missing header is answered with `401`
//! and `WWW-Authenticate: Bearer`, a wrong token with `403`. Both bodies are
//! JSON-RPC errors so clients can report them like any other failure.
//!
//! All requests share one [`Session`]: the `initialize` handshake happens
//! once per front end.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{McpError, ProtocolError};
use crate::mcp::protocol::{ErrorCode, ErrorObject, ErrorResponse, Message};
use crate::mcp::server::{McpServer, ServerState, Session};

/// HTTP front end settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServerConfig {
    /// Add `Access-Control-Allow-Origin: *` and answer `OPTIONS` preflights.
    pub enable_cors: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self { enable_cors: true }
    }
}

#[derive(Clone)]
struct Endpoint {
    server: McpServer,
    session: Arc<Session>,
}

impl Endpoint {
    fn new(server: McpServer) -> Self {
        let config = server.config();
        // Only requests that passed the bearer check reach the dispatcher.
        let session = match config.auth_token.as_deref() {
            Some(token) if config.require_auth => Session::with_credential(token),
            _ => Session::new(),
        };
        Self {
            server,
            session: Arc::new(session),
        }
    }
}

/// Builds the router serving `server`.
pub fn router(server: McpServer, config: &HttpServerConfig) -> Router {
    let endpoint = Endpoint::new(server);
    let protected = Router::new()
        .route("/", post(mcp_endpoint))
        .route("/mcp", post(mcp_endpoint))
        .route_layer(middleware::from_fn_with_state(
            endpoint.clone(),
            require_bearer_token,
        ));

    let router = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(endpoint);
    if config.enable_cors {
        router.layer(middleware::from_fn(cors))
    } else {
        router
    }
}

impl McpServer {
    /// Serves HTTP on `listener` until [`Self::stop`] or a `shutdown` request.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotRunning`] before [`Self::start`], or the I/O
    /// error that ended the accept loop.
    pub async fn serve_http(
        &self,
        listener: TcpListener,
        config: &HttpServerConfig,
    ) -> Result<(), McpError> {
        if !self.is_running() {
            return Err(McpError::NotRunning);
        }
        let addr = listener.local_addr()?;
        info!(server = %self.config().name, %addr, "Serving HTTP");
        let server = self.clone();
        axum::serve(listener, router(self.clone(), config))
            .with_graceful_shutdown(async move { server.stopped().await })
            .await?;
        info!(server = %self.config().name, %addr, "HTTP server finished");
        Ok(())
    }

    /// Binds `addr` and serves HTTP until `shutdown`, [`Self::stop`], or a
    /// termination signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or
    /// [`Self::serve_http`] fails.
    pub async fn run_http(&self, addr: SocketAddr, config: &HttpServerConfig) -> Result<(), McpError> {
        let listener = TcpListener::bind(addr).await?;
        tokio::select! {
            result = self.serve_http(listener, config) => result,
            () = termination() => {
                self.stop();
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
async fn termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Could not install signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(windows)]
async fn termination() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, initiating graceful shutdown");
    } else {
        std::future::pending::<()>().await;
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn require_bearer_token(
    State(endpoint): State<Endpoint>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Response {
    let config = endpoint.server.config();
    let expected = match config.auth_token.as_deref() {
        Some(token) if config.require_auth => token,
        _ => return next.run(request).await,
    };

    match auth_header {
        Some(TypedHeader(auth)) if auth.token() == expected => next.run(request).await,
        Some(_) => {
            warn!("Rejected request with invalid bearer token");
            rejection(StatusCode::FORBIDDEN, "Forbidden: invalid credentials")
        }
        None => {
            warn!("Rejected request without bearer token");
            let mut response = rejection(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: authentication required",
            );
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            response
        }
    }
}

fn rejection(status: StatusCode, message: &str) -> Response {
    let reply = Message::error(None, ErrorObject::with_message(ErrorCode::Unauthorized, message));
    json_reply(status, &reply)
}

fn json_reply(status: StatusCode, reply: &Message) -> Response {
    match reply.to_json() {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn mcp_endpoint(State(endpoint): State<Endpoint>, body: String) -> Response {
    let message = match Message::parse(&body) {
        Ok(message) => message,
        Err(ProtocolError::MalformedMessage { reason, id }) => {
            warn!(%reason, "Malformed message");
            let reply = Message::from(ErrorResponse::invalid_request(id, reason));
            endpoint.server.count_reply(&reply);
            return json_reply(StatusCode::BAD_REQUEST, &reply);
        }
        Err(e) => {
            warn!(error = %e, "Unparsable request body");
            let reply = Message::from(ErrorResponse::parse_error());
            endpoint.server.count_reply(&reply);
            return json_reply(StatusCode::BAD_REQUEST, &reply);
        }
    };

    let reply = endpoint.server.handle_message(&endpoint.session, message);
    if endpoint.server.state() == ServerState::ShuttingDown {
        endpoint.server.stop();
    }
    match reply {
        Some(reply) => {
            endpoint.server.count_reply(&reply);
            json_reply(StatusCode::OK, &reply)
        }
        None => {
            debug!("Notification accepted");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        let mut preflight = StatusCode::NO_CONTENT.into_response();
        let headers = preflight.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, GET, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        );
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
        preflight
    } else {
        next.run(request).await
    };
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
