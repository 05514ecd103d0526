use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dupcheck_core::{
    CancelOutcome, CheckSession, DocumentId, DupError, RetryHint, SessionId, StepReport,
};
use dupcheck_engine::{
    CheckResults, DocumentInsert, DupcheckConfig, DuplicateChecker, ErrorEntry, StartCheck,
    StartedCheck, StepRequest, UsagePeriod, UsageReport,
};

struct AppState {
    checker: DuplicateChecker,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let config = DupcheckConfig::load(&DupcheckConfig::default_path())?;
    let checker = DuplicateChecker::open(config)?;
    info!(judge = checker.has_judge(), "duplicate checker ready");
    let state = Arc::new(AppState { checker });
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/documents", post(handle_import))
        .route("/checks", post(handle_start).get(handle_history))
        .route("/checks/step", post(handle_step))
        .route("/checks/cancel", post(handle_cancel))
        .route("/checks/:id", get(handle_results).delete(handle_delete))
        .route("/checks/:id/cancel", post(handle_cancel_check))
        .route("/usage", get(handle_usage))
        .route("/usage/export", get(handle_usage_export))
        .route("/usage/cleanup", post(handle_usage_cleanup))
        .route("/errors", get(handle_errors).delete(handle_clear_errors))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    documents: Vec<ImportDocument>,
}

#[derive(Debug, Deserialize)]
struct ImportDocument {
    id: DocumentId,
    title: Option<String>,
    body: Option<String>,
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    imported: usize,
    total_documents: usize,
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UsageParams {
    period: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    days: i64,
}

#[derive(Debug, Serialize)]
struct RemovedResponse {
    removed: usize,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    session_id: SessionId,
    deleted: bool,
}

async fn handle_import(
    State(state): State<SharedState>,
    Json(body): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, AppError> {
    let response = task::spawn_blocking(move || {
        let mut imported = 0;
        for doc in body.documents {
            if let Some(vector) = &doc.vector {
                if vector.is_empty() {
                    return Err(AppError::bad_request(format!(
                        "document {} has an empty vector",
                        doc.id
                    )));
                }
            }
            state
                .checker
                .import(&DocumentInsert {
                    id: doc.id,
                    title: doc.title,
                    body: doc.body,
                    vector: doc.vector,
                })
                .map_err(AppError::internal)?;
            imported += 1;
        }
        let total_documents = state
            .checker
            .store()
            .document_count()
            .map_err(AppError::internal)?;
        Ok(ImportResponse {
            imported,
            total_documents,
        })
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(response))
}

async fn handle_start(
    State(state): State<SharedState>,
    Json(body): Json<StartCheck>,
) -> Result<Json<StartedCheck>, AppError> {
    let started = task::spawn_blocking(move || state.checker.start(&body))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(started))
}

async fn handle_step(
    State(state): State<SharedState>,
    Json(body): Json<StepRequest>,
) -> Result<Json<StepReport>, AppError> {
    let report = task::spawn_blocking(move || state.checker.step(&body))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(report))
}

async fn handle_cancel(State(state): State<SharedState>) -> Result<Json<CancelOutcome>, AppError> {
    let outcome = task::spawn_blocking(move || state.checker.cancel())
        .await
        .map_err(AppError::internal)??;
    Ok(Json(outcome))
}

async fn handle_cancel_check(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<SessionId>,
) -> Result<Json<CancelOutcome>, AppError> {
    let outcome = task::spawn_blocking(move || state.checker.cancel_session(id))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(outcome))
}

async fn handle_results(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<SessionId>,
) -> Result<Json<CheckResults>, AppError> {
    let results = task::spawn_blocking(move || state.checker.results(id))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(results))
}

async fn handle_history(
    State(state): State<SharedState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<CheckSession>>, AppError> {
    let sessions = task::spawn_blocking(move || {
        state
            .checker
            .recent(params.limit.unwrap_or(20), params.offset.unwrap_or(0))
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(sessions))
}

async fn handle_delete(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<SessionId>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = task::spawn_blocking(move || state.checker.delete(id))
        .await
        .map_err(AppError::internal)??;
    if !deleted {
        return Err(DupError::SessionNotFound(id).into());
    }
    Ok(Json(DeleteResponse {
        session_id: id,
        deleted,
    }))
}

async fn handle_usage(
    State(state): State<SharedState>,
    Query(params): Query<UsageParams>,
) -> Result<Json<UsageReport>, AppError> {
    let period = parse_period(params.period.as_deref())?;
    let report = task::spawn_blocking(move || {
        state.checker.usage(period, params.limit.unwrap_or(12))
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(report))
}

async fn handle_usage_export(
    State(state): State<SharedState>,
    Query(params): Query<UsageParams>,
) -> Result<Response, AppError> {
    let period = parse_period(params.period.as_deref())?;
    let csv = task::spawn_blocking(move || {
        state
            .checker
            .export_usage_csv(period, params.limit.unwrap_or(usize::MAX))
    })
    .await
    .map_err(AppError::internal)??;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"usage.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

async fn handle_usage_cleanup(
    State(state): State<SharedState>,
    Json(body): Json<CleanupRequest>,
) -> Result<Json<RemovedResponse>, AppError> {
    let removed = task::spawn_blocking(move || state.checker.cleanup_usage(body.days))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(RemovedResponse { removed }))
}

async fn handle_errors(
    State(state): State<SharedState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<ErrorEntry>>, AppError> {
    let entries = task::spawn_blocking(move || {
        state
            .checker
            .errors(params.limit.unwrap_or(50), params.offset.unwrap_or(0))
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(entries))
}

async fn handle_clear_errors(
    State(state): State<SharedState>,
) -> Result<Json<RemovedResponse>, AppError> {
    let removed = task::spawn_blocking(move || state.checker.clear_errors())
        .await
        .map_err(AppError::internal)??;
    Ok(Json(RemovedResponse { removed }))
}

fn parse_period(value: Option<&str>) -> Result<UsagePeriod, AppError> {
    let value = value.unwrap_or("month");
    UsagePeriod::from_str(value)
        .ok_or_else(|| AppError::bad_request(format!("unknown period {value}")))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Check(#[from] DupError),
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    /// Keeps check errors that travelled through `anyhow` classifiable.
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        match err.into().downcast::<DupError>() {
            Ok(dup) => Self::Check(dup),
            Err(other) => Self::Internal(other),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Check(err) => match err {
                DupError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                DupError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                DupError::SessionClosed { .. } | DupError::NoActiveCheck => StatusCode::CONFLICT,
                DupError::Persistence(_) | DupError::Judge(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_hint(&self) -> RetryHint {
        match self {
            AppError::BadRequest(_) => RetryHint::Terminal,
            AppError::Check(err) => err.retry_hint(),
            AppError::Internal(_) => RetryHint::Transient,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = json!({ "error": message, "retry": self.retry_hint().as_str() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupcheck_core::{ComparisonMode, SessionStatus};
    use dupcheck_engine::SqliteStore;

    fn state_in(dir: &tempfile::TempDir) -> SharedState {
        let config = DupcheckConfig {
            database: dir.path().join("service.sqlite"),
            ..DupcheckConfig::default()
        };
        let store = SqliteStore::open(&config.database).unwrap();
        Arc::new(AppState {
            checker: DuplicateChecker::new(store, config, None),
        })
    }

    fn doc(id: &str, vector: Vec<f32>) -> ImportDocument {
        ImportDocument {
            id: id.into(),
            title: Some(format!("title {id}")),
            body: Some("body".into()),
            vector: Some(vector),
        }
    }

    async fn seeded(dir: &tempfile::TempDir) -> SharedState {
        let state = state_in(dir);
        let imported = handle_import(
            State(state.clone()),
            Json(ImportRequest {
                documents: vec![
                    doc("1", vec![1.0, 0.0]),
                    doc("2", vec![1.0, 0.0]),
                    doc("3", vec![0.0, 1.0]),
                ],
            }),
        )
        .await
        .unwrap();
        assert_eq!(imported.0.total_documents, 3);
        state
    }

    fn start_body(threshold: f32) -> StartCheck {
        StartCheck {
            threshold: Some(threshold),
            mode: Some(ComparisonMode::VectorOnly),
            document_ids: None,
        }
    }

    fn step_body(session_id: SessionId, cursor: usize) -> StepRequest {
        StepRequest {
            session_id,
            cursor: Some(cursor),
            ..StepRequest::default()
        }
    }

    #[tokio::test]
    async fn check_steps_to_completion_over_http_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded(&dir).await;
        let started = handle_start(State(state.clone()), Json(start_body(0.9)))
            .await
            .unwrap()
            .0;
        assert_eq!(started.document_ids.len(), 3);

        let mut cursor = 0;
        loop {
            let report = handle_step(State(state.clone()), Json(step_body(started.session_id, cursor)))
                .await
                .unwrap()
                .0;
            cursor = report.cursor;
            if report.done {
                assert_eq!(report.progress_percent, 100.0);
                break;
            }
        }

        let results = handle_results(State(state.clone()), AxumPath(started.session_id))
            .await
            .unwrap()
            .0;
        assert_eq!(results.session.status, SessionStatus::Completed);
        assert_eq!(results.groups.len(), 1);

        let history = handle_history(
            State(state.clone()),
            Query(PageParams {
                limit: None,
                offset: None,
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_status_and_retry_hint() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded(&dir).await;

        let invalid = handle_start(State(state.clone()), Json(start_body(0.3)))
            .await
            .unwrap_err();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let missing = handle_results(State(state.clone()), AxumPath(99)).await.unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let idle = handle_cancel(State(state.clone())).await.unwrap_err();
        assert_eq!(idle.status(), StatusCode::CONFLICT);

        let started = handle_start(State(state.clone()), Json(start_body(0.9)))
            .await
            .unwrap()
            .0;
        let cancelled = handle_cancel(State(state.clone())).await.unwrap().0;
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        let closed = handle_step(State(state.clone()), Json(step_body(started.session_id, 0)))
            .await
            .unwrap_err();
        assert_eq!(closed.status(), StatusCode::CONFLICT);
        assert_eq!(closed.retry_hint(), RetryHint::Terminal);
        assert_eq!(closed.into_response().status(), StatusCode::CONFLICT);

        let transient = AppError::from(DupError::persistence("database is locked"));
        assert_eq!(transient.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transient.retry_hint(), RetryHint::Transient);
    }

    #[tokio::test]
    async fn processing_check_is_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded(&dir).await;
        let started = handle_start(State(state.clone()), Json(start_body(0.9)))
            .await
            .unwrap()
            .0;
        let refused = handle_delete(State(state.clone()), AxumPath(started.session_id))
            .await
            .unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);

        handle_cancel(State(state.clone())).await.unwrap();
        let deleted = handle_delete(State(state.clone()), AxumPath(started.session_id))
            .await
            .unwrap()
            .0;
        assert!(deleted.deleted);
        let gone = handle_delete(State(state.clone()), AxumPath(started.session_id))
            .await
            .unwrap_err();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn replaced_check_can_be_cancelled_by_id_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded(&dir).await;
        let first = handle_start(State(state.clone()), Json(start_body(0.9)))
            .await
            .unwrap()
            .0;
        let second = handle_start(State(state.clone()), Json(start_body(0.9)))
            .await
            .unwrap()
            .0;
        let cancelled = handle_cancel(State(state.clone())).await.unwrap().0;
        assert_eq!(cancelled.session_id, second.session_id);

        let stuck = handle_delete(State(state.clone()), AxumPath(first.session_id))
            .await
            .unwrap_err();
        assert_eq!(stuck.status(), StatusCode::BAD_REQUEST);

        let cancelled = handle_cancel_check(State(state.clone()), AxumPath(first.session_id))
            .await
            .unwrap()
            .0;
        assert_eq!(cancelled.session_id, first.session_id);
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        let again = handle_cancel_check(State(state.clone()), AxumPath(first.session_id))
            .await
            .unwrap_err();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let deleted = handle_delete(State(state.clone()), AxumPath(first.session_id))
            .await
            .unwrap()
            .0;
        assert!(deleted.deleted);
        let missing = handle_cancel_check(State(state), AxumPath(first.session_id))
            .await
            .unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn usage_export_is_csv_and_cleanup_enforces_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(&dir);
        let response = handle_usage_export(
            State(state.clone()),
            Query(UsageParams {
                period: Some("day".into()),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/csv; charset=utf-8"
        );

        let bad_period = handle_usage(
            State(state.clone()),
            Query(UsageParams {
                period: Some("week".into()),
                limit: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(bad_period.status(), StatusCode::BAD_REQUEST);

        let removed = handle_usage_cleanup(State(state.clone()), Json(CleanupRequest { days: 1 }))
            .await
            .unwrap()
            .0;
        assert_eq!(removed.removed, 0);

        let out_of_range = handle_usage_cleanup(
            State(state.clone()),
            Json(CleanupRequest { days: i64::MAX }),
        )
        .await
        .unwrap_err();
        assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);

        let errors = handle_errors(
            State(state.clone()),
            Query(PageParams {
                limit: None,
                offset: None,
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(errors.is_empty());
        assert_eq!(handle_clear_errors(State(state)).await.unwrap().0.removed, 0);
    }
}
