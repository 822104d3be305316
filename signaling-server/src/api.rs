// ============================================
// HTTP REST API Handlers
// ============================================

use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
};
use hyper::{Body, Method, Response, StatusCode};
use log::{error, warn};
use serde::Serialize;

use crate::state::{AppState, RoomId};

#[derive(Debug, Serialize)]
struct RoomStatusBody {
    room_id: RoomId,
    exists: bool,
    member_count: usize,
}

fn decode_path_segment(seg: &str) -> String {
    match urlencoding::decode(seg) {
        Ok(s) => s.into_owned(),
        Err(_) => seg.to_string(),
    }
}

pub fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(json) => {
            let mut resp = Response::new(Body::from(json));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

/// Permissive CORS headers for browser clients.
pub fn with_cors(mut resp: Response<Body>) -> Response<Body> {
    let headers = resp.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    resp
}

pub fn preflight() -> Response<Body> {
    let mut resp = with_cors(text_response(StatusCode::NO_CONTENT, Body::empty()));
    resp.headers_mut()
        .insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    resp
}

/// `GET /api/rooms/{room_id}` and `GET /api/stats`. Read-only; never creates
/// a room.
pub async fn handle_api_request(method: &Method, path: &str, state: &AppState) -> Response<Body> {
    // Parse path: /api/...
    let path_parts: Vec<&str> = path.trim_end_matches('/').split('/').collect();

    if path_parts.len() < 3 || path_parts[1] != "api" {
        return text_response(StatusCode::NOT_FOUND, "API endpoint not found");
    }
    if *method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    match (path_parts[2], path_parts.get(3)) {
        ("rooms", Some(seg)) if path_parts.len() == 4 => {
            let raw = decode_path_segment(seg);
            match RoomId::parse(&raw) {
                Ok(room_id) => {
                    let status = state.coordinator.room_status(&room_id).await;
                    json_response(
                        StatusCode::OK,
                        &RoomStatusBody {
                            room_id,
                            exists: status.exists,
                            member_count: status.member_count,
                        },
                    )
                }
                Err(e) => {
                    warn!("Rejected room lookup {:?}: {}", raw, e);
                    text_response(StatusCode::BAD_REQUEST, e.to_string())
                }
            }
        }
        ("stats", None) => json_response(StatusCode::OK, &state.coordinator.stats().await),
        _ => text_response(StatusCode::NOT_FOUND, "API endpoint not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::tests::connect;
    use serde_json::{json, Value};

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn room_lookup_normalizes_and_reports_members() {
        let state = AppState::new(ServerConfig::default());
        let _a = connect(&state.coordinator, "a").await;
        state
            .coordinator
            .create_room(&"a".to_string(), "abcdef", "Ann")
            .await
            .unwrap();

        let resp = handle_api_request(&Method::GET, "/api/rooms/abcdef", &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({ "room_id": "ABCDEF", "exists": true, "member_count": 1 })
        );

        let resp = handle_api_request(&Method::GET, "/api/rooms/zzzzzz", &state).await;
        assert_eq!(body_json(resp).await["exists"], false);
        // the lookup must not have created anything
        assert_eq!(state.coordinator.stats().await.rooms, 1);
    }

    #[tokio::test]
    async fn percent_encoded_room_with_space_is_rejected() {
        let state = AppState::new(ServerConfig::default());
        let resp = handle_api_request(&Method::GET, "/api/rooms/a%20b", &state).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_counts_connections_and_rooms() {
        let state = AppState::new(ServerConfig::default());
        let _a = connect(&state.coordinator, "a").await;
        let _b = connect(&state.coordinator, "b").await;
        state
            .coordinator
            .create_room(&"a".to_string(), "r", "Ann")
            .await
            .unwrap();

        let resp = handle_api_request(&Method::GET, "/api/stats", &state).await;
        assert_eq!(body_json(resp).await, json!({ "connections": 2, "rooms": 1 }));
    }

    #[tokio::test]
    async fn unknown_paths_and_methods() {
        let state = AppState::new(ServerConfig::default());
        let resp = handle_api_request(&Method::GET, "/api/houses", &state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = handle_api_request(&Method::POST, "/api/stats", &state).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn cors_headers_are_attached() {
        let resp = preflight();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(resp.headers()[ACCESS_CONTROL_MAX_AGE], "86400");
    }
}
