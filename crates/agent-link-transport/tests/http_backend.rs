//! HTTP backend against an in-process server.

use agent_link_core::{
    ClientConfig, Fragment, TransportError,
    traits::{ChatBackend, StreamRequest},
};
use agent_link_transport::{HttpBackend, StreamEvent};
use axum::{
    Json, Router,
    extract::{Path, Query},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;

const SSE_BODY: &str = "event: connected\n\
data: {\"sessionId\":\"s1\",\"requestId\":\"r1\"}\n\n\
data: {\"message\":\"Hel\",\"streamId\":\"a\"}\n\n\
data: {\"message\":\"lo\",\"streamId\":\"a\",\"done\":true}\n\n";

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn config(headers: HeaderMap) -> impl IntoResponse {
    if bearer(&headers).as_deref() == Some("bad") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid credential"})));
    }
    (
        StatusCode::OK,
        Json(json!({"token": "tok", "socketUrl": "ws://socket.test/ws", "theme": "dark"})),
    )
}

async fn sessions(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let external = query.get("externalId").cloned().unwrap_or_default();
    Json(json!([{ "sessionId": format!("{external}-1") }, { "id": format!("{external}-2") }]))
}

async fn history(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
    if bearer(&headers).as_deref() != Some("tok") {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    Json(json!({
        "sessionId": query.get("sessionId"),
        "messages": [
            {"role": "user", "message": "hi"},
            {"role": "system", "type": "video", "message": "", "video": {"url": "https://v.test/1"}},
        ]
    }))
    .into_response()
}

async fn stream(Path(session_id): Path<String>, headers: HeaderMap, body: String) -> impl IntoResponse {
    let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    if session_id != "s1" || body["message"] != "hello" {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "unexpected request"}))).into_response();
    }
    assert_eq!(
        headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], SSE_BODY).into_response()
}

async fn serve() -> String {
    let app = Router::new()
        .route("/api/config", get(config))
        .route("/api/sessions", get(sessions))
        .route("/api/session", get(history))
        .route("/api/session/{id}/stream", post(stream));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

#[tokio::test]
async fn test_fetch_config() {
    let base = serve().await;
    let backend = HttpBackend::new(&base).unwrap();
    let config = backend.fetch_config().await.unwrap();
    assert_eq!(config.token.as_deref(), Some("tok"));
    assert_eq!(config.socket_url.as_deref(), Some("ws://socket.test/ws"));
    assert_eq!(config.extra.get("theme"), Some(&json!("dark")));
}

#[tokio::test]
async fn test_config_error_payload_surfaces_as_backend_error() {
    let base = serve().await;
    let backend = HttpBackend::from_config(&ClientConfig::new(base).with_credential("bad")).unwrap();
    let err = backend.fetch_config().await.unwrap_err();
    assert_eq!(err, TransportError::Backend("invalid credential".to_string()));
}

#[tokio::test]
async fn test_history_and_sessions() {
    let base = serve().await;
    let backend = HttpBackend::new(&base).unwrap();

    let history = backend.fetch_history("s1", Some("tok")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].kind.as_deref(), Some("video"));
    assert_eq!(history[1].video.as_ref().unwrap().url, "https://v.test/1");

    let err = backend.fetch_history("s1", None).await.unwrap_err();
    assert!(matches!(err, TransportError::Http { status: 403, .. }));

    let sessions = backend.list_sessions("u", None).await.unwrap();
    let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["u-1", "u-2"]);
}

#[tokio::test]
async fn test_open_stream_decodes_events() {
    let base = serve().await;
    let backend = HttpBackend::new(&base).unwrap();
    let stream = backend
        .open_stream(StreamRequest {
            session_id: Some("s1".into()),
            message: "hello".into(),
            ..StreamRequest::default()
        })
        .await
        .unwrap();

    let events: Vec<StreamEvent> = stream
        .map(|raw| StreamEvent::decode(&raw.unwrap()).unwrap())
        .collect()
        .await;
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        StreamEvent::Connected {
            session_id: Some("s1".into()),
            request_id: Some("r1".into()),
        }
    );
    let StreamEvent::Fragment(Fragment::Content(last)) = &events[2] else {
        panic!("expected content, got {:?}", events[2]);
    };
    assert_eq!(last.text, "lo");
    assert!(last.done);
}

#[tokio::test]
async fn test_open_stream_rejected() {
    let base = serve().await;
    let backend = HttpBackend::new(&base).unwrap();
    let err = backend
        .open_stream(StreamRequest {
            session_id: Some("other".into()),
            message: "hello".into(),
            ..StreamRequest::default()
        })
        .await
        .err()
        .unwrap();
    assert_eq!(
        err,
        TransportError::Http {
            status: 400,
            message: "unexpected request".into(),
        }
    );
}

#[tokio::test]
async fn test_unreachable_backend_is_connect_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let backend = HttpBackend::new(&format!("http://{addr}")).unwrap();
    let err = backend.fetch_config().await.unwrap_err();
    assert!(err.is_connect_failure(), "{err:?}");
}
