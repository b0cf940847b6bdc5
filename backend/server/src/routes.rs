use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use codec::{Reason, Status, Verdict, validate_format};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::AppError,
    state::AppState,
    store::{CertificateRecord, YearStats},
};

#[derive(Deserialize)]
pub struct IssueRequest {
    student_id: u64,
    course_id: u64,
    issuer_id: u64,
}

#[derive(Deserialize)]
pub struct CslQuery {
    #[serde(default)]
    csl: String,
}

#[derive(Serialize)]
pub struct FormatCheck {
    valid: bool,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    status: Status,
    actor_id: u64,
    #[serde(default)]
    reason: Option<String>,
}

fn payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload.map(|Json(inner)| inner).map_err(|rejection| {
        warn!("Rejected payload: {rejection}");
        AppError::MalformedPayload
    })
}

pub async fn issue_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload(body)?;
    let issued = state
        .service
        .issue(request.student_id, request.course_id, request.issuer_id)
        .await?;

    Ok((StatusCode::CREATED, Json(issued)))
}

// An unreadable query string is just another malformed CSL on the public endpoints.
fn presented_csl(query: Result<Query<CslQuery>, QueryRejection>) -> Option<String> {
    match query {
        Ok(Query(query)) => Some(query.csl),
        Err(rejection) => {
            warn!("Rejected query: {rejection}");
            None
        }
    }
}

pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CslQuery>, QueryRejection>,
) -> Result<Json<Verdict>, AppError> {
    let Some(csl) = presented_csl(query) else {
        return Ok(Json(Verdict::reject(Reason::Malformed)));
    };

    Ok(Json(state.service.verify(&csl).await?))
}

pub async fn validate_handler(
    query: Result<Query<CslQuery>, QueryRejection>,
) -> Json<FormatCheck> {
    Json(FormatCheck {
        valid: presented_csl(query).is_some_and(|csl| validate_format(&csl)),
    })
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(csl): Path<String>,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<CertificateRecord>, AppError> {
    let request = payload(body)?;
    let record = state
        .service
        .set_status(&csl, request.status, request.actor_id, request.reason)
        .await?;

    Ok(Json(record))
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Path(year): Path<u32>,
) -> Result<Json<YearStats>, AppError> {
    Ok(Json(state.service.stats(year).await?))
}
