//! Axum JSON API over the ingestion pipeline and the project repository.
//!
//! Field names in responses use the aliases the read layer has always
//! exposed (`project_name`, `booking_percentage`, ...) so existing dashboard
//! consumers keep working.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use grip_core::{CancelFlag, ProjectRecord, ProjectStatus, ProjectType, Provenance, RawRecord};
use grip_extract::records_from_json;
use grip_ingest::{normalize, Orchestrator, RunScope, RunTracker};
use grip_storage::{ProjectQuery, ProjectRepository, RepositoryError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grip-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub tracker: RunTracker,
    pub repository: Arc<dyn ProjectRepository>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let tracker = orchestrator.tracker();
        let repository = orchestrator.repository();
        Self {
            orchestrator,
            tracker,
            repository,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ingestion/trigger", post(trigger_handler))
        .route("/ingestion/status/{run_id}", get(status_handler))
        .route("/api/projects", get(projects_handler))
        .route("/api/projects/lookup", get(project_lookup_handler))
        .route("/api/projects/stats", get(stats_handler))
        .route(
            "/api/admin/projects",
            post(admin_add_handler).delete(admin_clear_handler),
        )
        .route("/api/admin/upload", post(admin_upload_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "grip web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

fn ok_json(data: JsonValue) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn error_json(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = Json(json!({
        "success": false,
        "error": { "code": code, "message": message.into() }
    }));
    (status, body).into_response()
}

fn repository_error(err: RepositoryError) -> Response {
    match err {
        RepositoryError::DuplicateRegistration(id) => error_json(
            StatusCode::CONFLICT,
            "validation_error",
            format!("registration id {id} already exists"),
        ),
        RepositoryError::Database(err) => {
            error!(error = %err, "repository failure");
            error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "repository_error",
                "persistence failure",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiProject {
    registration_no: String,
    project_name: String,
    promoter_name: String,
    project_type: String,
    status: String,
    district: String,
    locality: String,
    pincode: String,
    address: String,
    approved_on: Option<String>,
    completion_date: Option<String>,
    total_units: u32,
    available_units: u32,
    booking_percentage: u8,
    project_area: f64,
    total_buildings: u32,
    provenance: String,
    low_confidence: bool,
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%d-%m-%Y").to_string())
}

impl From<ProjectRecord> for ApiProject {
    fn from(record: ProjectRecord) -> Self {
        Self {
            registration_no: record.registration_id,
            project_name: record.name,
            promoter_name: record.promoter_name,
            project_type: record.project_type.to_string(),
            status: record.status.to_string(),
            district: record.district,
            locality: record.locality,
            pincode: record.pincode,
            address: record.address,
            approved_on: format_date(record.approved_on),
            completion_date: format_date(record.completion_date),
            total_units: record.total_units,
            available_units: record.available_units,
            booking_percentage: record.booking_percentage,
            project_area: record.project_area,
            total_buildings: record.total_buildings,
            provenance: record.provenance.to_string(),
            low_confidence: record.low_confidence,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProjectsParams {
    city: Option<String>,
    status: Option<String>,
    project_type: Option<String>,
    search: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

async fn health_handler(State(_state): State<Arc<AppState>>) -> Response {
    ok_json(json!({ "status": "up" }))
}

async fn projects_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProjectsParams>,
) -> Response {
    let status = match parse_filter::<ProjectStatus>(params.status.as_deref()) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let project_type = match parse_filter::<ProjectType>(params.project_type.as_deref()) {
        Ok(value) => value,
        Err(response) => return response,
    };

    let query = ProjectQuery {
        city: params.city,
        status,
        project_type,
        search: params.search,
        page: params.page.unwrap_or(1),
        limit: params.limit.unwrap_or(20),
    };

    match state.repository.query(&query).await {
        Ok(page) => {
            let projects: Vec<ApiProject> =
                page.projects.into_iter().map(ApiProject::from).collect();
            ok_json(json!({
                "projects": projects,
                "pagination": page.pagination,
            }))
        }
        Err(err) => repository_error(err),
    }
}

fn parse_filter<T: FromStr>(raw: Option<&str>) -> Result<Option<T>, Response>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) => text.parse::<T>().map(Some).map_err(|err| {
            error_json(StatusCode::BAD_REQUEST, "invalid_filter", err.to_string())
        }),
    }
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    registration_no: String,
}

async fn project_lookup_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LookupParams>,
) -> Response {
    match state
        .repository
        .find_by_registration_id(&params.registration_no)
        .await
    {
        Ok(Some(record)) => ok_json(json!({ "project": ApiProject::from(record) })),
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no project registered as {}", params.registration_no),
        ),
        Err(err) => repository_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.stats().await {
        Ok(stats) => ok_json(serde_json::to_value(stats).unwrap_or_default()),
        Err(err) => repository_error(err),
    }
}

// ---------------------------------------------------------------------------
// Ingestion trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct TriggerRequest {
    scope: Option<String>,
}

async fn trigger_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: TriggerRequest = if body.is_empty() {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("invalid JSON body: {err}"),
                )
            }
        }
    };
    let scope = match request.scope {
        Some(city) if !city.trim().is_empty() => RunScope::city(city.trim().to_string()),
        _ => RunScope::all(),
    };

    // The run proceeds asynchronously; its id is queryable through the
    // tracker before this response is sent.
    let run_id = state
        .orchestrator
        .clone()
        .start_detached(scope, CancelFlag::new())
        .await;

    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "data": { "run_id": run_id } })),
    )
        .into_response()
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<Uuid>,
) -> Response {
    match state.tracker.get(run_id).await {
        Some(summary) => ok_json(serde_json::to_value(&summary).unwrap_or_default()),
        None => error_json(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no run {run_id}"),
        ),
    }
}

// ---------------------------------------------------------------------------
// Admin operations
// ---------------------------------------------------------------------------

async fn admin_add_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JsonValue>,
) -> Response {
    let records = records_from_json(&json!([payload]), "manual:single-add");
    let Some(raw) = records.first() else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "request body is not a project object",
        );
    };

    let record = match normalize(raw, Provenance::ManualUpload, Utc::now()) {
        Ok(record) => record,
        Err(reason) => {
            return error_json(StatusCode::BAD_REQUEST, "validation_error", reason.to_string())
        }
    };

    match state.repository.insert_new(&record).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "data": { "project": ApiProject::from(record) }
            })),
        )
            .into_response(),
        Err(err) => repository_error(err),
    }
}

#[derive(Debug, Serialize, Default)]
struct UploadOutcome {
    accepted: usize,
    dropped: usize,
    inserted: usize,
    updated: usize,
}

/// Bulk upload: a JSON array or a CSV document, selected by content type.
/// Every row flows through the same normalizer as live extraction, with
/// `manual_upload` provenance.
async fn admin_upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    let raw_records = if content_type.contains("csv") {
        match csv_records(&body) {
            Ok(records) => records,
            Err(message) => {
                return error_json(StatusCode::BAD_REQUEST, "validation_error", message)
            }
        }
    } else {
        match serde_json::from_slice::<JsonValue>(&body) {
            Ok(value) => records_from_json(&value, "manual:bulk-upload"),
            Err(err) => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("invalid JSON payload: {err}"),
                )
            }
        }
    };

    if raw_records.is_empty() {
        return error_json(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "no project rows found in upload",
        );
    }

    let mut outcome = UploadOutcome::default();
    let fetched_at = Utc::now();
    let mut records = Vec::with_capacity(raw_records.len());
    for raw in &raw_records {
        match normalize(raw, Provenance::ManualUpload, fetched_at) {
            Ok(record) => {
                records.push(record);
                outcome.accepted += 1;
            }
            Err(_) => outcome.dropped += 1,
        }
    }

    match state.repository.upsert_batch(&records).await {
        Ok(upsert) => {
            outcome.inserted = upsert.inserted;
            outcome.updated = upsert.updated;
            ok_json(serde_json::to_value(outcome).unwrap_or_default())
        }
        Err(err) => repository_error(err),
    }
}

fn csv_records(body: &[u8]) -> Result<Vec<RawRecord>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(body);
    let headers = reader
        .headers()
        .map_err(|err| format!("invalid CSV header: {err}"))?
        .clone();

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(|err| format!("invalid CSV row {}: {err}", idx + 2))?;
        let mut record = RawRecord::new();
        record.source_url = Some("manual:bulk-upload".to_string());
        for (header, value) in headers.iter().zip(row.iter()) {
            record.set(header, value);
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

async fn admin_clear_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.clear_all().await {
        Ok(removed) => ok_json(json!({ "removed": removed })),
        Err(err) => repository_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use grip_core::booking_percentage;
    use grip_ingest::{IngestionConfig, RunState};
    use grip_storage::MemoryRepository;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn record(registration_id: &str, district: &str) -> ProjectRecord {
        ProjectRecord {
            registration_id: registration_id.to_string(),
            name: format!("Project {registration_id}"),
            promoter_name: "Acme Developers".to_string(),
            project_type: ProjectType::Residential,
            status: ProjectStatus::Ongoing,
            district: district.to_string(),
            locality: "Bopal".to_string(),
            pincode: "380058".to_string(),
            address: "Near SG Highway".to_string(),
            approved_on: None,
            completion_date: None,
            total_units: 100,
            available_units: 40,
            booking_percentage: booking_percentage(100, 40),
            project_area: 12000.0,
            total_buildings: 4,
            provenance: Provenance::LiveExtraction,
            low_confidence: false,
            fetched_at: Utc::now(),
        }
    }

    async fn test_state() -> (AppState, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::new());
        let config = IngestionConfig {
            retry_cooldown: Duration::ZERO,
            ..Default::default()
        };
        let orchestrator = Arc::new(
            Orchestrator::with_strategies(config, repository.clone(), Vec::new()).unwrap(),
        );
        (AppState::new(orchestrator), repository)
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, value: JsonValue) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn city_query_is_paginated_and_case_insensitive() {
        let (state, repository) = test_state().await;
        let mut batch = Vec::new();
        for i in 0..40 {
            batch.push(record(
                &format!("PR/GJ/AHMEDABAD/A/AUDA/MAA{i:05}/010120"),
                "Ahmedabad",
            ));
        }
        for i in 0..10 {
            batch.push(record(&format!("PR/GJ/SURAT/S/SUDA/RAA{i:05}/010120"), "Surat"));
        }
        repository.upsert_batch(&batch).await.unwrap();

        let app = app(state);
        let response = app
            .oneshot(get("/api/projects?city=ahmedabad&page=1&limit=20"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["pagination"]["total"], 40);
        assert_eq!(body["data"]["pagination"]["totalPages"], 2);
        assert_eq!(body["data"]["projects"].as_array().unwrap().len(), 20);
        assert_eq!(body["data"]["projects"][0]["district"], "Ahmedabad");
        // legacy read-layer field aliases
        assert!(body["data"]["projects"][0].get("project_name").is_some());
        assert!(body["data"]["projects"][0].get("booking_percentage").is_some());
    }

    #[tokio::test]
    async fn invalid_status_filter_is_a_bad_request() {
        let (state, _repository) = test_state().await;
        let response = app(state)
            .oneshot(get("/api/projects?status=bogus"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "invalid_filter");
    }

    #[tokio::test]
    async fn single_add_rejects_duplicate_registration_ids() {
        let (state, _repository) = test_state().await;
        let app = app(state);
        let payload = json!({
            "registration_no": "PR/GJ/RAJKOT/R/RUDA/RAA00001/010120",
            "project_name": "Sterling Residency",
            "district": "Rajkot",
            "total_units": 120,
            "available_units": 30
        });

        let created = app
            .clone()
            .oneshot(post_json("/api/admin/projects", payload.clone()))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = body_json(created).await;
        assert_eq!(body["data"]["project"]["provenance"], "manual_upload");
        assert_eq!(body["data"]["project"]["booking_percentage"], 75);

        let duplicate = app
            .oneshot(post_json("/api/admin/projects", payload))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        let body = body_json(duplicate).await;
        assert_eq!(body["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn trigger_returns_accepted_and_status_becomes_terminal() {
        let (state, _repository) = test_state().await;
        let tracker = state.tracker.clone();
        let app = app(state);

        let response = app
            .clone()
            .oneshot(post_json("/ingestion/trigger", json!({ "scope": "Surat" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let run_id: Uuid = serde_json::from_value(body["data"]["run_id"].clone()).unwrap();

        // no strategies are configured, so the run falls back to synthetic
        // data and lands on `partial` almost immediately
        let mut state_seen = None;
        for _ in 0..200 {
            if let Some(summary) = tracker.get(run_id).await {
                if summary.state != RunState::Running {
                    state_seen = Some(summary);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let summary = state_seen.expect("run reached a terminal state");
        assert_eq!(summary.state, RunState::Partial);
        assert!(summary.record_count > 0);

        let status = app
            .oneshot(get(&format!("/ingestion/status/{run_id}")))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let body = body_json(status).await;
        assert_eq!(body["data"]["state"], "partial");
    }

    #[tokio::test]
    async fn unknown_run_id_is_not_found() {
        let (state, _repository) = test_state().await;
        let response = app(state)
            .oneshot(get(&format!("/ingestion/status/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn csv_upload_flows_through_the_normalizer() {
        let (state, repository) = test_state().await;
        let csv_body = "registration_no,project_name,district,total_units,available_units\n\
            PR/GJ/SURAT/VESU/SUDA/RAA00900/010120,River View,Surat,200,50\n\
            ,,,,\n";
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/admin/upload")
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from(csv_body))
            .unwrap();

        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["accepted"], 1);
        assert_eq!(body["data"]["inserted"], 1);

        let stored = repository
            .find_by_registration_id("PR/GJ/SURAT/VESU/SUDA/RAA00900/010120")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.provenance, Provenance::ManualUpload);
        assert_eq!(stored.booking_percentage, 75);
    }

    #[tokio::test]
    async fn json_upload_accepts_an_array_envelope() {
        let (state, _repository) = test_state().await;
        let payload = json!([{
            "rera_no": "PR/GJ/VADODARA/GOTRI/VUDA/VAA00100/010120",
            "projectName": "Darshanam Greens",
            "district": "Vadodara"
        }]);
        let response = app(state)
            .oneshot(post_json("/api/admin/upload", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["accepted"], 1);
    }

    #[tokio::test]
    async fn clear_all_empties_the_repository() {
        let (state, repository) = test_state().await;
        repository
            .upsert_batch(&[record("PR/GJ/SURAT/S/SUDA/RAA00001/010120", "Surat")])
            .await
            .unwrap();

        let app = app(state);
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/api/admin/projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["removed"], 1);

        let stats = app.oneshot(get("/api/projects/stats")).await.unwrap();
        let body = body_json(stats).await;
        assert_eq!(body["data"]["total"], 0);
    }

    #[tokio::test]
    async fn health_reports_up() {
        let (state, _repository) = test_state().await;
        let response = app(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["status"], "up");
    }
}
