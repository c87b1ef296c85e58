//! Read-only JSON API over stored job offers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobsync_core::{JobOffer, JobOfferQuery};
use jobsync_storage::JobStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-web";

const LIST_PATH: &str = "/job-offers";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

/// Query string of the listing endpoint. `skills` is comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page: Option<u32>,
    #[serde(alias = "limit")]
    pub page_size: Option<u32>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    pub min_salary: Option<f64>,
    pub max_salary: Option<f64>,
    pub skills: Option<String>,
}

impl ListParams {
    pub fn to_query(&self) -> JobOfferQuery {
        JobOfferQuery {
            page: self.page,
            page_size: self.page_size,
            title: self.title.clone(),
            location: self.location.clone(),
            company: self.company.clone(),
            min_salary: self.min_salary,
            max_salary: self.max_salary,
            skills: self
                .skills
                .as_deref()
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResponse {
    pub status_code: &'static str,
    pub data: Vec<JobOffer>,
    pub count: u64,
    pub current_page: String,
    pub next_page: Option<String>,
    pub prev_page: Option<String>,
    pub last_page: String,
}

/// Page links repeat the active filters so clients can follow them as-is.
pub fn paginate(
    data: Vec<JobOffer>,
    total: u64,
    query: &JobOfferQuery,
    current: &str,
) -> PaginatedResponse {
    let page = query.page();
    let page_size = query.page_size();
    let last = total.div_ceil(u64::from(page_size)).max(1) as u32;
    let next = (page < last).then(|| page_link(query, page + 1));
    let prev = (page > 1).then(|| page_link(query, page - 1));
    PaginatedResponse {
        status_code: "success",
        data,
        count: total,
        current_page: current.to_string(),
        next_page: next,
        prev_page: prev,
        last_page: page_link(query, last),
    }
}

fn page_link(query: &JobOfferQuery, page: u32) -> String {
    let mut params = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in [
        ("title", &query.title),
        ("location", &query.location),
        ("company", &query.company),
    ] {
        if let Some(value) = value {
            params.append_pair(key, value);
        }
    }
    if let Some(min) = query.min_salary {
        params.append_pair("minSalary", &min.to_string());
    }
    if let Some(max) = query.max_salary {
        params.append_pair("maxSalary", &max.to_string());
    }
    if !query.skills.is_empty() {
        params.append_pair("skills", &query.skills.join(","));
    }
    params.append_pair("page", &page.to_string());
    params.append_pair("pageSize", &query.page_size().to_string());
    format!("{LIST_PATH}?{}", params.finish())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(LIST_PATH, get(list_job_offers_handler))
        .route("/job-offers/sync/status", get(sync_status_handler))
        .route("/job-offers/{id}", get(job_offer_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving job offer api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_job_offers_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(params): Query<ListParams>,
) -> Response {
    let query = params.to_query();
    match state.store.find_with_filters(&query).await {
        Ok((offers, total)) => Json(paginate(offers, total, &query, &uri.to_string())).into_response(),
        Err(err) => server_error(err),
    }
}

async fn job_offer_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return not_found(&id);
    };
    match state.store.find_by_id(uuid).await {
        Ok(Some(offer)) => Json(offer).into_response(),
        Ok(None) => not_found(&id),
        Err(err) => server_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.sync_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "statusCode": 404,
            "message": format!("Job offer with ID {id} not found"),
        })),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "job offer query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "statusCode": 500,
            "message": "Internal server error",
        })),
    )
        .into_response()
}
