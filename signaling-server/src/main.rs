mod api;
mod config;
mod connection;
mod coordinator;
mod error;
mod protocol;
mod relay;
mod state;


use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyper_tungstenite::tungstenite::protocol::WebSocketConfig;
use log::{error, info};

use crate::config::ServerConfig;
use crate::state::AppState;

/// Opaque connection identifier, assigned when the WebSocket is accepted.
pub type ConnId = String;

// ============================================
// Main Request Handler
// ============================================

async fn handle_request(
    mut req: Request<Body>,
    remote_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    // CORS preflight
    if method == Method::OPTIONS {
        return Ok(api::preflight());
    }

    // Health check endpoint
    if path == "/health" {
        return Ok(api::with_cors(api::text_response(StatusCode::OK, "ok")));
    }

    // API endpoints (REST)
    if path.starts_with("/api/") {
        let resp = api::handle_api_request(&method, &path, &state).await;
        return Ok(api::with_cors(resp));
    }

    // WebSocket upgrade
    if hyper_tungstenite::is_upgrade_request(&req) {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(state.config.max_message_size);
        ws_config.max_frame_size = Some(state.config.max_message_size);

        return match hyper_tungstenite::upgrade(&mut req, Some(ws_config)) {
            Ok((response, websocket)) => {
                // Spawn a task to handle the WebSocket connection
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => connection::handle_connection(ws, remote_addr, state).await,
                        Err(e) => error!("WebSocket handshake with {} failed: {}", remote_addr, e),
                    }
                });
                Ok(response)
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                Ok(api::text_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid WebSocket upgrade request",
                ))
            }
        };
    }

    // Default response for other requests
    Ok(api::text_response(
        StatusCode::NOT_FOUND,
        "Not found. Use /health for health check, /api/* for REST API, or upgrade to WebSocket.",
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================
// Main Entry Point
// ============================================

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();

    // Healthcheck mode: exit 0 if server is running (port in use), exit 1 if not
    if std::env::args().any(|a| a == "--healthcheck") {
        use std::net::TcpListener;
        let probe = SocketAddr::from(([127, 0, 0, 1], config.bind_addr.port()));
        match TcpListener::bind(probe) {
            Ok(_) => std::process::exit(1), // Port free = server NOT running
            Err(_) => std::process::exit(0), // Port in use = server IS running (healthy)
        }
    }

    let addr = config.bind_addr;
    info!(
        "Room policy: {}",
        if config.open_room_creation {
            "joins may create rooms"
        } else {
            "joins require an existing room"
        }
    );
    let state = Arc::new(AppState::new(config));

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, remote_addr, state.clone())
            }))
        }
    });

    let builder = match Server::try_bind(&addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    let server = builder.serve(make_svc).with_graceful_shutdown(shutdown_signal());

    info!("Signaling server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}", addr);
    info!("REST API: http://{}/api/rooms/{{room_id}}", addr);
    info!("Health check: http://{}/health", addr);

    if let Err(e) = server.await {
        error!("Server error: {}", e);
    }
}
