use std::collections::BTreeMap;
use std::path::Path as FsPath;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::StoreError;
use crate::rooms::RoomSnapshot;
use crate::service::ChatService;
use crate::storage::SharedStore;
use crate::websocket::chat_socket_handler;

const TODO_PREFIX: &str = "todo:";

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub chat: ChatService,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(store: SharedStore, chat: ChatService, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            store,
            chat,
            metrics,
        }
    }
}

pub fn build_router(state: AppState, static_dir: Option<&FsPath>) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/debug/rooms", get(rooms_handler))
        .route("/todos", get(list_todos))
        .route("/todos/:todo_id", post(create_todo).delete(delete_todo))
        .route("/ws/chat/:room_id", get(chat_socket_handler))
        .with_state(state);

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.route("/", get(root)),
    };

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    NotFound(&'static str),
    StoreUnavailable(String),
    Store(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => ApiError::StoreUnavailable(detail),
            StoreError::Command(detail) => ApiError::Store(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.to_string()),
            ApiError::StoreUnavailable(detail) => {
                warn!(error = %detail, "store unavailable while serving request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    "Cannot connect to store".to_string(),
                )
            }
            ApiError::Store(detail) => {
                warn!(error = %detail, "store command failed while serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    "Store command failed".to_string(),
                )
            }
        };
        (
            status,
            Json(ApiErrorBody {
                error,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Welcome to todo-chat" }))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomSnapshot>,
    pub total_members: usize,
}

async fn rooms_handler(State(state): State<AppState>) -> Json<RoomsResponse> {
    let rooms = state.chat.registry().snapshot();
    let total_members = rooms.iter().map(|room| room.members).sum();
    Json(RoomsResponse {
        rooms,
        total_members,
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateTodoQuery {
    pub task: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TodoResponse {
    pub todo_id: String,
    pub task: String,
}

fn todo_key(todo_id: &str) -> String {
    format!("{}{}", TODO_PREFIX, todo_id)
}

async fn list_todos(State(state): State<AppState>) -> ApiResult<BTreeMap<String, String>> {
    let keys = state.store.keys(TODO_PREFIX).await?;
    let values = state.store.get_many(&keys).await?;
    let todos = keys
        .into_iter()
        .zip(values)
        .filter_map(|(key, value)| value.map(|task| (key, task)))
        .collect();
    Ok(Json(todos))
}

async fn create_todo(
    State(state): State<AppState>,
    Path(todo_id): Path<String>,
    Query(query): Query<CreateTodoQuery>,
) -> ApiResult<TodoResponse> {
    let key = todo_key(&todo_id);
    if state.store.exists(&key).await? {
        return Err(ApiError::BadRequest("Todo already exists"));
    }
    state.store.set(&key, &query.task).await?;
    Ok(Json(TodoResponse {
        todo_id,
        task: query.task,
    }))
}

async fn delete_todo(
    State(state): State<AppState>,
    Path(todo_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let key = todo_key(&todo_id);
    if !state.store.exists(&key).await? {
        return Err(ApiError::NotFound("Todo not found"));
    }
    state.store.delete(&key).await?;
    Ok(Json(json!({ "message": "Todo deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::storage::{InMemoryStore, KeyValueStore};
    use axum::body::{self, Body};
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn app() -> (Router, Arc<InMemoryStore>) {
        let store = InMemoryStore::new();
        let chat = ChatService::new(store.clone(), ChatConfig::default());
        let state = AppState::new(store.clone(), chat, None);
        (build_router(state, None), store)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _store) = app();
        let (status, body) = call(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn todo_create_list_delete_flow() {
        let (app, store) = app();

        let (status, body) = call(&app, "POST", "/todos/1?task=write%20tests").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"todo_id": "1", "task": "write tests"}));
        assert_eq!(
            store.get("todo:1").await.unwrap().as_deref(),
            Some("write tests")
        );

        let (status, body) = call(&app, "POST", "/todos/1?task=again").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], json!("Todo already exists"));

        call(&app, "POST", "/todos/2?task=ship").await;
        let (status, body) = call(&app, "GET", "/todos").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"todo:1": "write tests", "todo:2": "ship"}));

        let (status, body) = call(&app, "DELETE", "/todos/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Todo deleted"}));

        let (status, body) = call(&app, "DELETE", "/todos/1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("not_found"));
    }

    #[tokio::test]
    async fn todos_ignore_chat_history() {
        let (app, store) = app();
        store
            .set("chat:r1:2024-05-01T12:00:00.000000Z", "{}")
            .await
            .unwrap();
        let (_, body) = call(&app, "GET", "/todos").await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn store_outage_maps_to_service_unavailable() {
        let (app, store) = app();
        store.set_available(false);
        let (status, body) = call(&app, "GET", "/todos").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], json!("store_unavailable"));
    }

    #[tokio::test]
    async fn metrics_absent_without_recorder() {
        let (app, _store) = app();
        let (status, _) = call(&app, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn root_welcomes_without_static_dir() {
        let (app, _store) = app();
        let (status, body) = call(&app, "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Welcome to todo-chat"}));
    }

    #[test]
    fn metrics_endpoint_exports_chat_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let rendered = metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let store = InMemoryStore::new();
                let chat = ChatService::new(store.clone(), ChatConfig::default());
                for text in ["one", "two", "three"] {
                    chat.broadcaster()
                        .handle_incoming("r1", &json!({ "text": text }).to_string())
                        .await
                        .unwrap();
                }
                let app = build_router(AppState::new(store, chat, Some(handle)), None);
                let response = app
                    .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                let bytes = body::to_bytes(response.into_body(), usize::MAX)
                    .await
                    .unwrap();
                String::from_utf8(bytes.to_vec()).unwrap()
            })
        });

        assert!(rendered.contains("todo_chat_broadcasts_total 3"), "{rendered}");
        assert!(rendered.contains("todo_chat_window_size"), "{rendered}");
        assert!(!rendered.contains("room_id"), "{rendered}");
    }

    #[tokio::test]
    async fn debug_rooms_lists_empty_registry() {
        let (app, _store) = app();
        let (status, body) = call(&app, "GET", "/debug/rooms").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"rooms": [], "total_members": 0}));
    }
}
