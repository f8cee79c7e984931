//! HTTP surface: jobs, exports, downloads, health, metrics

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use sabt_allocation::{RawMentor, RawStudent};
use sabt_export::{ExportFilters, ExportManifest, ExportOptions, Newline, OutputFormat};
use sabt_jobs::ExportJob;
use sabt_signing::SignError;

use crate::errors;
use crate::middleware;
use crate::probes::run_probes;
use crate::state::{AppState, CorrelationId, MiddlewareChain};

/// Reference handler proving the middleware chain end to end
async fn create_reference_job(
    Extension(correlation_id): Extension<CorrelationId>,
    Extension(chain): Extension<MiddlewareChain>,
) -> Json<serde_json::Value> {
    Json(json!({
        "processed": true,
        "correlation_id": correlation_id.0,
        "middleware_chain": chain.0,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateExportRequest {
    year: i32,
    #[serde(default)]
    center: Option<u8>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    include_bom: Option<bool>,
    #[serde(default)]
    newline: Option<String>,
}

fn manifest_json(state: &AppState, manifest: &ExportManifest) -> serde_json::Value {
    let mut payload = manifest.to_json();
    if let Some(files) = payload["files"].as_array_mut() {
        for file in files {
            let name = file["name"].as_str().unwrap_or_default().to_string();
            if let Ok(url) = state
                .signer
                .sign(&name, Some(state.config.auth.download_url_ttl_seconds))
            {
                file["download_url"] = json!(url);
            }
        }
    }
    payload
}

fn job_json(state: &AppState, job: &ExportJob) -> serde_json::Value {
    json!({
        "id": job.id,
        "status": job.status.as_str(),
        "namespace": job.namespace,
        "filters": {
            "year": job.filters.year,
            "center": job.filters.center,
        },
        "snapshot": {
            "marker": job.snapshot.marker,
            "created_at": job.snapshot.created_at.to_rfc3339(),
        },
        "started_at": job.started_at.map(|ts| ts.to_rfc3339()),
        "finished_at": job.finished_at.map(|ts| ts.to_rfc3339()),
        "error": job.error,
        "manifest": job.manifest.as_ref().map(|manifest| manifest_json(state, manifest)),
    })
}

async fn create_export(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(request): Json<CreateExportRequest>,
) -> Response {
    let idempotency_key = sabt_text::normalize_token(
        headers
            .get("idempotency-key")
            .and_then(|value| value.to_str().ok()),
    );
    if idempotency_key.is_empty() {
        return errors::idempotency_key_required();
    }

    let mut filters = ExportFilters::new(request.year);
    filters.center = request.center;

    let mut options = ExportOptions {
        excel_mode: state.config.excel_mode,
        ..ExportOptions::default()
    };
    if let Some(format) = &request.format {
        options.output_format = match format.to_lowercase().as_str() {
            "csv" => OutputFormat::Csv,
            "xlsx" => OutputFormat::Xlsx,
            _ => {
                return errors::export_error_response(&sabt_export::ExportError::ProfileUnknown)
            }
        };
    }
    if let Some(chunk_size) = request.chunk_size {
        options.chunk_size = chunk_size;
    }
    if let Some(include_bom) = request.include_bom {
        options.include_bom = include_bom;
    }
    if let Some(newline) = &request.newline {
        options.newline = match newline.to_lowercase().as_str() {
            "crlf" => Newline::Crlf,
            "lf" => Newline::Lf,
            _ => {
                return errors::export_error_response(&sabt_export::ExportError::validation(
                    "newline",
                ))
            }
        };
    }
    if options.chunk_size == 0 {
        return errors::export_error_response(&sabt_export::ExportError::validation("chunk_size"));
    }

    let namespace = state.store.namespace().to_string();
    match state
        .runner
        .submit(filters, options, &idempotency_key, &namespace)
        .await
    {
        Ok(job) => (StatusCode::OK, Json(job_json(&state, &job))).into_response(),
        Err(error) => errors::job_error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
struct AllocationRequest {
    /// Single-student evaluation
    #[serde(default)]
    student: Option<serde_json::Value>,
    /// Batch mode: allocate in order, bumping winner loads along the way
    #[serde(default)]
    students: Vec<serde_json::Value>,
    #[serde(default)]
    mentors: Vec<serde_json::Value>,
}

fn loose_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn loose_field(value: &serde_json::Value, name: &str) -> Option<String> {
    value.get(name).and_then(loose_string)
}

fn loose_list(value: &serde_json::Value, name: &str) -> Vec<String> {
    value
        .get(name)
        .and_then(serde_json::Value::as_array)
        .map(|items| items.iter().filter_map(loose_string).collect())
        .unwrap_or_default()
}

fn raw_student(value: &serde_json::Value) -> RawStudent {
    RawStudent {
        gender: loose_field(value, "gender"),
        group_code: loose_field(value, "group_code"),
        reg_center: loose_field(value, "reg_center"),
        reg_status: loose_field(value, "reg_status"),
        edu_status: loose_field(value, "edu_status"),
        school_code: loose_field(value, "school_code"),
        student_type: loose_field(value, "student_type"),
        roster_year: loose_field(value, "roster_year"),
    }
}

fn raw_mentor(value: &serde_json::Value) -> RawMentor {
    RawMentor {
        mentor_id: loose_field(value, "mentor_id"),
        gender: loose_field(value, "gender"),
        allowed_groups: loose_list(value, "allowed_groups"),
        allowed_centers: loose_list(value, "allowed_centers"),
        capacity: loose_field(value, "capacity"),
        current_load: loose_field(value, "current_load"),
        is_active: loose_field(value, "is_active"),
        mentor_type: loose_field(value, "mentor_type"),
        special_schools: loose_list(value, "special_schools"),
        manager_id: loose_field(value, "manager_id"),
    }
}

fn allocation_result_json(result: &sabt_allocation::AllocationResult) -> serde_json::Value {
    json!({
        "winner": result.winner.as_ref().map(|mentor| json!({
            "mentor_id": mentor.mentor_id,
            "current_load": mentor.current_load,
            "capacity": mentor.capacity,
            "occupancy_ratio": mentor.occupancy_ratio(),
        })),
        "evaluations": result
            .evaluations
            .iter()
            .map(|evaluation| json!({
                "mentor_index": evaluation.index,
                "mentor_id": evaluation.normalized.as_ref().map(|mentor| mentor.mentor_id),
                "passed": evaluation.passed,
                "ranking_key": evaluation.ranking_key,
                "trace": evaluation.trace,
            }))
            .collect::<Vec<_>>(),
    })
}

/// Evaluate one student (or a whole batch) against a mentor pool,
/// returning winners and full evaluation traces
async fn run_allocation(
    State(state): State<AppState>,
    Json(request): Json<AllocationRequest>,
) -> Response {
    let mentors: Vec<RawMentor> = request.mentors.iter().map(raw_mentor).collect();

    if !request.students.is_empty() {
        let students: Vec<RawStudent> = request.students.iter().map(raw_student).collect();
        let results = state.engine.evaluate_batch(&students, &mentors);
        return Json(json!({
            "results": results.iter().map(allocation_result_json).collect::<Vec<_>>(),
        }))
        .into_response();
    }

    let Some(student) = &request.student else {
        return errors::envelope(
            StatusCode::BAD_REQUEST,
            "ALLOCATION_STUDENT_REQUIRED",
            "دانش‌آموزی برای تخصیص ارسال نشده است.",
        );
    };
    let result = state.engine.evaluate(&raw_student(student), &mentors);
    Json(allocation_result_json(&result)).into_response()
}

async fn list_exports(State(state): State<AppState>) -> Response {
    let jobs: Vec<serde_json::Value> = state
        .runner
        .list_jobs()
        .iter()
        .map(|job| job_json(&state, job))
        .collect();
    Json(json!({ "jobs": jobs })).into_response()
}

async fn get_export(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.runner.get_job(&job_id) {
        Some(job) => (StatusCode::OK, Json(job_json(&state, &job))).into_response(),
        None => errors::job_error_response(&sabt_jobs::JobError::NotFound(job_id)),
    }
}

fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".xlsx") {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    } else if path.ends_with(".csv") {
        "text/csv; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    let path = match state.signer.verify_query(&query) {
        Ok(path) => path,
        Err(error) => {
            let status = match error {
                SignError::Malformed => StatusCode::BAD_REQUEST,
                _ => StatusCode::FORBIDDEN,
            };
            return errors::envelope(status, "UNAUTHORIZED", &error.to_string());
        }
    };

    let file_path = state.output_dir.join(path.trim_start_matches('/'));
    match tokio::fs::read(&file_path).await {
        Ok(bytes) => {
            let filename = file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type_for(&filename).to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => errors::envelope(
            StatusCode::NOT_FOUND,
            "DOWNLOAD_NOT_FOUND",
            "پروندهٔ درخواستی یافت نشد.",
        ),
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    let timeout = Duration::from_millis(state.config.health_timeout_ms);
    let results = run_probes(
        &state.probes,
        timeout,
        &state.metrics,
        ("healthy", "degraded"),
    )
    .await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "checked_at": state.clock.now().to_rfc3339(),
            "components": results,
        })),
    )
        .into_response()
}

async fn readyz(State(state): State<AppState>) -> Response {
    let timeout = Duration::from_millis(state.config.readiness_timeout_ms);
    let results = run_probes(&state.probes, timeout, &state.metrics, ("ready", "error")).await;
    let ready = results.iter().all(|result| result.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checked_at": state.clock.now().to_rfc3339(),
            "components": results,
        })),
    )
        .into_response()
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn diagnostics_endpoint(State(state): State<AppState>) -> Response {
    if !state.diagnostics.enabled() {
        return errors::envelope(
            StatusCode::NOT_FOUND,
            "DIAGNOSTICS_DISABLED",
            "عیب‌یابی فعال نیست.",
        );
    }
    Json(state.diagnostics.snapshot()).into_response()
}

/// Assemble the full router with the middleware chain attached.
///
/// Layer order matters: the last layer added runs first, so correlation is
/// outermost, then rate limit, idempotency, auth, and the request metrics
/// wrapper just inside the trio.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(create_reference_job))
        .route("/allocations", post(run_allocation))
        .route("/exports", post(create_export).get(list_exports))
        .route("/exports/:id", get(get_export))
        .route("/download", get(download))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_endpoint))
        .route("/__diag", get(diagnostics_endpoint))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::metrics_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::idempotency_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::correlation_middleware,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
