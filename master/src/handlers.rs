use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use common::broker::Broker;
use common::{
    AcquireResponse, BrokerError, CreateTasksRequest, CreateTasksResponse, EventsResponse,
    OkResponse, OutputChunk, OutputResponse, PublishRequest, SetStatusRequest, SetStatusResponse,
    TaskFilter, TaskId, TaskIdsRequest, TaskUpdate, TasksResponse,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(create_tasks))
        .route("/api/v1/tasks/fetch", post(fetch_tasks))
        .route("/api/v1/tasks/delete", post(delete_tasks))
        .route("/api/v1/tasks/status", post(set_status))
        .route("/api/v1/tasks/search", post(search_tasks))
        .route("/api/v1/tasks/heartbeat", post(heartbeat))
        .route("/api/v1/tasks/:id", patch(update_task))
        .route("/api/v1/tasks/:id/acquire", post(acquire_task))
        .route("/api/v1/tasks/:id/release", post(release_task))
        .route("/api/v1/tasks/:id/output", post(append_output))
        .route("/api/v1/output", post(get_output))
        .route("/api/v1/events", post(publish_events).get(read_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(err: BrokerError) -> StatusCode {
    match err {
        BrokerError::NotFound(id) => {
            debug!("tarea {} no existe", id);
            StatusCode::NOT_FOUND
        }
        other => {
            warn!("error del broker: {}", other);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn ok() -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_tasks(
    State(state): State<AppState>,
    Json(req): Json<CreateTasksRequest>,
) -> Result<Json<CreateTasksResponse>, StatusCode> {
    let ids = state.broker.create(req.tasks).await.map_err(status_for)?;
    debug!("creadas {} tareas", ids.len());
    Ok(Json(CreateTasksResponse { ids }))
}

async fn fetch_tasks(
    State(state): State<AppState>,
    Json(req): Json<TaskIdsRequest>,
) -> Result<Json<TasksResponse>, StatusCode> {
    let found = state.broker.fetch(&req.ids).await.map_err(status_for)?;
    // en el orden pedido
    let tasks = req
        .ids
        .iter()
        .filter_map(|id| found.get(id).cloned())
        .collect();
    Ok(Json(TasksResponse { tasks }))
}

async fn delete_tasks(
    State(state): State<AppState>,
    Json(req): Json<TaskIdsRequest>,
) -> Result<Json<OkResponse>, StatusCode> {
    state.broker.delete(&req.ids).await.map_err(status_for)?;
    Ok(ok())
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<OkResponse>, StatusCode> {
    state.broker.update(id, update).await.map_err(status_for)?;
    Ok(ok())
}

async fn set_status(
    State(state): State<AppState>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<SetStatusResponse>, StatusCode> {
    let changed = state
        .broker
        .set_status(&req.ids, req.status, req.outcome)
        .await
        .map_err(status_for)?;
    Ok(Json(SetStatusResponse { changed }))
}

async fn search_tasks(
    State(state): State<AppState>,
    Json(filter): Json<TaskFilter>,
) -> Result<Json<TasksResponse>, StatusCode> {
    let tasks = state.broker.search(&filter).await.map_err(status_for)?;
    Ok(Json(TasksResponse { tasks }))
}

async fn acquire_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<AcquireResponse>, StatusCode> {
    let acquired = state.broker.try_acquire(id).await.map_err(status_for)?;
    Ok(Json(AcquireResponse { acquired }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<TaskIdsRequest>,
) -> Result<Json<OkResponse>, StatusCode> {
    state.broker.refresh_leases(&req.ids).await.map_err(status_for)?;
    Ok(ok())
}

async fn release_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<OkResponse>, StatusCode> {
    state.broker.clear_lease(id).await.map_err(status_for)?;
    Ok(ok())
}

async fn append_output(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
    Json(mut chunk): Json<OutputChunk>,
) -> Result<Json<OkResponse>, StatusCode> {
    chunk.task_id = id;
    state.broker.append_output(chunk).await.map_err(status_for)?;
    Ok(ok())
}

async fn get_output(
    State(state): State<AppState>,
    Json(req): Json<TaskIdsRequest>,
) -> Result<Json<OutputResponse>, StatusCode> {
    let chunks = state.broker.get_output(&req.ids).await.map_err(status_for)?;
    Ok(Json(OutputResponse { chunks }))
}

async fn publish_events(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Json<OkResponse> {
    let seq = state.events().publish(req.origin, req.events, req.payload);
    debug!("evento {} publicado", seq);
    ok()
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<u64>,
}

/// Sin `since` sólo devuelve la cabeza del log.
async fn read_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let log = state.events();
    let events = match query.since {
        Some(since) => log.since(since),
        None => Vec::new(),
    };
    Json(EventsResponse {
        next: log.head(),
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::task::TaskSpec;
    use common::{EventPayload, TaskStatus};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use tower::ServiceExt;

    async fn call<B: Serialize, R: DeserializeOwned>(
        app: &Router,
        method: &str,
        uri: &str,
        body: &B,
    ) -> (StatusCode, Option<R>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).ok())
    }

    #[tokio::test]
    async fn crear_buscar_y_tomar() {
        let app = build_router(AppState::new());
        let new = TaskSpec::call("str", vec![serde_json::json!(1)]).normalize(vec![], vec![]);

        let (status, created): (_, Option<CreateTasksResponse>) = call(
            &app,
            "POST",
            "/api/v1/tasks",
            &CreateTasksRequest { tasks: vec![new] },
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created.unwrap().ids[0];

        let (_, moved): (_, Option<SetStatusResponse>) = call(
            &app,
            "POST",
            "/api/v1/tasks/status",
            &SetStatusRequest {
                ids: vec![id],
                status: TaskStatus::Pending,
                outcome: None,
            },
        )
        .await;
        assert_eq!(moved.unwrap().changed, vec![id]);

        let (_, found): (_, Option<TasksResponse>) = call(
            &app,
            "POST",
            "/api/v1/tasks/search",
            &TaskFilter::status(TaskStatus::Pending),
        )
        .await;
        assert_eq!(found.unwrap().tasks.len(), 1);

        let uri = format!("/api/v1/tasks/{}/acquire", id);
        let (_, first): (_, Option<AcquireResponse>) = call(&app, "POST", &uri, &()).await;
        let (_, second): (_, Option<AcquireResponse>) = call(&app, "POST", &uri, &()).await;
        assert!(first.unwrap().acquired);
        assert!(!second.unwrap().acquired);
    }

    #[tokio::test]
    async fn update_de_tarea_inexistente_es_404() {
        let app = build_router(AppState::new());
        let (status, _): (_, Option<OkResponse>) =
            call(&app, "PATCH", "/api/v1/tasks/999", &TaskUpdate::default()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn eventos_desde_la_cabeza() {
        let app = build_router(AppState::new());

        let req = Request::builder()
            .uri("/api/v1/events")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let head: EventsResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(head.next, 0);

        let (_, _): (_, Option<OkResponse>) = call(
            &app,
            "POST",
            "/api/v1/events",
            &PublishRequest {
                origin: "a".into(),
                events: vec!["task_status.1".into()],
                payload: EventPayload::Status {
                    ids: vec![1],
                    status: TaskStatus::Success,
                },
            },
        )
        .await;

        let req = Request::builder()
            .uri("/api/v1/events?since=0")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let page: EventsResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(page.next, 1);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].origin, "a");
    }
}
