//! HTTP error envelope
//!
//! Every client-visible failure is a `fa_error_envelope` with a stable
//! machine code and a Persian message. Nothing internal (paths, stack
//! traces) ever crosses this boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Build the envelope body
pub fn fa_error_body(code: &str, message_fa: &str) -> serde_json::Value {
    json!({
        "fa_error_envelope": {
            "code": code,
            "message": message_fa,
        }
    })
}

/// Envelope response with an arbitrary status
pub fn envelope(status: StatusCode, code: &str, message_fa: &str) -> Response {
    (status, Json(fa_error_body(code, message_fa))).into_response()
}

pub fn rate_limited() -> (String, String) {
    (
        "RATE_LIMIT_EXCEEDED".to_string(),
        "درخواست‌های شما بیش از حد مجاز است. لطفاً بعداً تلاش کنید.".to_string(),
    )
}

pub fn idempotency_key_required() -> Response {
    envelope(
        StatusCode::BAD_REQUEST,
        "IDEMPOTENCY_KEY_REQUIRED",
        "کلید ایدمپوتنسی الزامی است.",
    )
}

pub fn unauthorized(message_fa: &str) -> Response {
    envelope(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message_fa)
}

pub fn scope_denied(message_fa: &str) -> Response {
    envelope(StatusCode::FORBIDDEN, "UNAUTHORIZED", message_fa)
}

pub fn metrics_token_invalid() -> Response {
    envelope(
        StatusCode::UNAUTHORIZED,
        "METRICS_TOKEN_INVALID",
        "توکن دسترسی به متریک معتبر نیست.",
    )
}

pub fn internal_server_error() -> Response {
    envelope(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_SERVER_ERROR",
        "مشکل داخلی سیستم رخ داده است.",
    )
}

/// Translate an export pipeline error into the envelope
pub fn export_error_response(error: &sabt_export::ExportError) -> Response {
    use sabt_export::ExportError;
    let code = error.code();
    match error {
        ExportError::Validation { .. } => envelope(
            StatusCode::BAD_REQUEST,
            &code,
            "دادهٔ ورودی خروجی نامعتبر است.",
        ),
        ExportError::Empty => envelope(
            StatusCode::UNPROCESSABLE_ENTITY,
            &code,
            "هیچ ردیفی برای خروجی یافت نشد.",
        ),
        ExportError::ProfileUnknown => envelope(
            StatusCode::BAD_REQUEST,
            &code,
            "پروفایل خروجی ناشناخته است.",
        ),
        ExportError::Io(_) => envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            &code,
            "خطای ورودی/خروجی در تولید خروجی رخ داد.",
        ),
        ExportError::RetryExhausted { .. } => envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            "RETRY_EXHAUSTED",
            "در حال حاضر امکان انجام عملیات نیست؛ لطفاً بعداً دوباره تلاش کنید.",
        ),
    }
}

/// Translate a job submission error
pub fn job_error_response(error: &sabt_jobs::JobError) -> Response {
    match error {
        sabt_jobs::JobError::Duplicate => envelope(
            StatusCode::CONFLICT,
            "EXPORT_DUPLICATE",
            "درخواست خروجی تکراری است.",
        ),
        sabt_jobs::JobError::NotFound(_) => envelope(
            StatusCode::NOT_FOUND,
            "EXPORT_JOB_NOT_FOUND",
            "کار درخواستی یافت نشد.",
        ),
        sabt_jobs::JobError::Store(_) => internal_server_error(),
    }
}
