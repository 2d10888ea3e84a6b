//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::{error, instrument};

use super::dto::{ContainerListResponse, ErrorResponse, HealthResponse, LogsQuery};
use crate::backend::Backend;
use crate::domain::Container;
use crate::error::Error;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(code: &str, err: Error) -> ApiError {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ValidationError(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!("{} failed: {}", code, err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorResponse::new(code, &err.to_string())))
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Metrics endpoint
#[cfg(feature = "metrics")]
pub async fn metrics() -> String {
    crate::metrics::encode_text()
}

#[instrument(skip(backend))]
pub async fn list_containers(
    State(backend): State<Arc<dyn Backend>>,
) -> Result<Json<ContainerListResponse>, ApiError> {
    let items = backend
        .list_containers()
        .await
        .map_err(|e| api_error("list_failed", e))?;
    let total = items.len();
    Ok(Json(ContainerListResponse { items, total }))
}

#[instrument(skip(backend))]
pub async fn get_container(
    State(backend): State<Arc<dyn Backend>>,
    Path(app_id): Path<String>,
) -> Result<Json<Container>, ApiError> {
    backend
        .get_container(&app_id)
        .await
        .map(Json)
        .map_err(|e| api_error("get_failed", e))
}

#[instrument(skip(backend))]
pub async fn restart_container(
    State(backend): State<Arc<dyn Backend>>,
    Path(app_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    backend
        .restart_container(&app_id)
        .await
        .map_err(|e| api_error("restart_failed", e))?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(backend))]
pub async fn container_logs(
    State(backend): State<Arc<dyn Backend>>,
    Path(app_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<String, ApiError> {
    backend
        .container_logs(&app_id, query.tail)
        .await
        .map_err(|e| api_error("logs_failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContainerState;
    use crate::test_support::FakeBackend;

    fn backend(state: Option<ContainerState>) -> Arc<dyn Backend> {
        Arc::new(FakeBackend {
            state,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_list_containers() {
        let Json(list) = list_containers(State(backend(Some(ContainerState::Running))))
            .await
            .unwrap();
        assert_eq!(list.total, 1);
        assert_eq!(list.items[0].state, ContainerState::Running);
    }

    #[tokio::test]
    async fn test_get_missing_container() {
        let Json(container) = get_container(State(backend(None)), Path("a9".to_string()))
            .await
            .unwrap();
        assert_eq!(container.state, ContainerState::Missing);
    }

    #[tokio::test]
    async fn test_restart_not_found_maps_to_404() {
        let (status, Json(body)) = restart_container(State(backend(None)), Path("a9".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "restart_failed");

        let status = restart_container(
            State(backend(Some(ContainerState::Exited))),
            Path("a1".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_logs_use_tail() {
        let logs = container_logs(
            State(backend(Some(ContainerState::Running))),
            Path("a1".to_string()),
            Query(LogsQuery { tail: 5 }),
        )
        .await
        .unwrap();
        assert_eq!(logs, "a1 last 5 lines\n");
    }
}
