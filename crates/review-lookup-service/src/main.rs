use std::net::SocketAddr;
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use review_lookup_api::{
    load_catalog, MigrateResult, ReviewLookupApi, SubmitReviewRequest, SubmitReviewResult,
    API_CONTRACT_VERSION,
};
use review_lookup_core::{
    CatalogPaper, EngineError, IdentityObscurer, Question, SearchParams, SearchResults,
};
use review_lookup_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_LOG_FILTER: &str = "review_lookup=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ReviewLookupApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct TutorsResponse {
    tutors: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "review-lookup-service")]
#[command(about = "HTTP search service for anonymised tutor reviews")]
struct Args {
    #[arg(long, env = "REVIEW_LOOKUP_DB", default_value = "./review_lookup.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "REVIEW_LOOKUP_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Secret mixed into obscured review ids. Changing it changes every public id.
    #[arg(long, env = "REVIEW_LOOKUP_ID_SALT", hide_env_values = true)]
    id_salt: Option<String>,
    /// Catalog JSON to validate submissions against. Defaults to the bundled catalog.
    #[arg(long, env = "REVIEW_LOOKUP_CATALOG")]
    catalog: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> ServiceError {
        Self::error(StatusCode::BAD_REQUEST, message)
    }

    /// Engine rejections are reported to the caller; anything else is logged and hidden.
    fn from_api(err: &anyhow::Error) -> ServiceError {
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::ProfileIncomplete) => {
                Self::error(StatusCode::FORBIDDEN, EngineError::ProfileIncomplete.to_string())
            }
            Some(engine_err) => Self::bad_request(engine_err.to_string()),
            None => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                Self::error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/search", get(search))
        .route("/v1/tutors", get(tutors))
        .route("/v1/reviews", post(submit_review))
        .route("/v1/catalog/subjects", get(catalog_subjects))
        .route("/v1/catalog/questions", get(catalog_questions))
        .route("/v1/catalog/colleges", get(catalog_colleges))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let obscurer = match args.id_salt {
        Some(salt) => IdentityObscurer::new(salt),
        None => {
            tracing::warn!("REVIEW_LOOKUP_ID_SALT is not set; obscured ids use an empty salt");
            IdentityObscurer::default()
        }
    };
    let catalog = load_catalog(args.catalog.as_deref())?;
    let state = ServiceState { api: ReviewLookupApi::new(args.db, obscurer, catalog) };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "review lookup service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| {
        url::form_urlencoded::parse(raw.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    })
    .unwrap_or_default()
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::from_api(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn search(
    State(state): State<ServiceState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<ServiceEnvelope<SearchResults>>, ServiceError> {
    let params = SearchParams::from_pairs(query_pairs(raw.as_deref()))
        .map_err(|err| ServiceState::bad_request(err.to_string()))?;
    let results = state.api.search(params, None).map_err(|err| ServiceState::from_api(&err))?;
    Ok(Json(envelope(results)))
}

async fn tutors(
    State(state): State<ServiceState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<ServiceEnvelope<TutorsResponse>>, ServiceError> {
    let mut search = String::new();
    let mut seen = false;
    for (key, value) in query_pairs(raw.as_deref()) {
        if key != "search" {
            return Err(ServiceState::bad_request(format!(
                "unsupported tutors parameter `{key}`"
            )));
        }
        if seen {
            return Err(ServiceState::bad_request("search MUST be a single string"));
        }
        seen = true;
        search = value;
    }

    let tutors = state.api.tutors(&search).map_err(|err| ServiceState::from_api(&err))?;
    Ok(Json(envelope(TutorsResponse { tutors })))
}

async fn submit_review(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitReviewRequest>,
) -> Result<Json<ServiceEnvelope<SubmitReviewResult>>, ServiceError> {
    let result = state.api.submit_review(request).map_err(|err| ServiceState::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn catalog_subjects(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<BTreeMap<String, Vec<CatalogPaper>>>> {
    Json(envelope(state.api.catalog().subjects.clone()))
}

async fn catalog_questions(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<Vec<Question>>> {
    Json(envelope(state.api.catalog().questions.clone()))
}

async fn catalog_colleges(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<Vec<String>>> {
    Json(envelope(state.api.catalog().colleges.clone()))
}
