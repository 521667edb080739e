use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use stat7_api::{
    load_config, AddressRequest, AddressResult, AdjacencyReport, DeriveRequest, IngestRequest,
    IngestResult, MigrateResult, ScoreRequest, ScoreResult, Stat7Api, SweepRequest, SweepResult,
    API_CONTRACT_VERSION,
};
use stat7_core::{
    Address, AuditEvent, CancellationToken, DenialKind, EntanglementEdge, Record, StoreError,
};
use stat7_gate::{GateError, RecoveryOutcome, RecoveryRequest};
use stat7_store_sqlite::{SchemaStatus, StoredRepair};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const LOG_ENV: &str = "S7_LOG";

#[derive(Clone)]
struct ServiceState {
    api: Arc<Stat7Api>,
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

#[derive(Debug, Clone, Default, Deserialize)]
struct AddressFilter {
    address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct AuditList {
    events: Vec<AuditEvent>,
}

#[derive(Debug, Clone, Serialize)]
struct EdgeList {
    edges: Vec<EntanglementEdge>,
}

#[derive(Debug, Clone, Serialize)]
struct RepairList {
    repairs: Vec<StoredRepair>,
}

#[derive(Debug, Parser)]
#[command(name = "stat7-service")]
#[command(about = "Local HTTP service for STAT7")]
struct Args {
    #[arg(long, default_value = "./stat7.sqlite3")]
    db: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn from_api(err: &anyhow::Error) -> Self {
        let status = if err.downcast_ref::<GateError>().is_some() {
            StatusCode::SERVICE_UNAVAILABLE
        } else if matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DuplicateAddressConflict { .. })
        ) {
            StatusCode::CONFLICT
        } else {
            StatusCode::BAD_REQUEST
        };
        Self::new(status, format!("{err:#}"))
    }
}

/// Cancels the token when the request future is dropped, e.g. on client disconnect.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
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

fn denial_status(kind: DenialKind) -> StatusCode {
    match kind {
        DenialKind::NotFound => StatusCode::NOT_FOUND,
        DenialKind::IntegrityFailure => StatusCode::CONFLICT,
        DenialKind::ProvenanceFailure => StatusCode::UNPROCESSABLE_ENTITY,
        DenialKind::AuthenticationFailure | DenialKind::SecondFactorRequired => {
            StatusCode::UNAUTHORIZED
        }
        DenialKind::IntentRequired => StatusCode::BAD_REQUEST,
        DenialKind::PolicyDenied => StatusCode::FORBIDDEN,
        DenialKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
    }
}

fn parse_address(raw: &str) -> Result<Address, ServiceError> {
    Address::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

/// The API blocks on `SQLite` and on the identity provider, so calls run on the
/// blocking pool.
async fn run_blocking<T, F>(state: &ServiceState, job: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&Stat7Api) -> Result<T> + Send + 'static,
{
    let api = Arc::clone(&state.api);
    match tokio::task::spawn_blocking(move || job(&api)).await {
        Ok(result) => result.map_err(|err| ServiceError::from_api(&err)),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker task failed: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/address", post(address))
        .route("/v1/records", post(records_add))
        .route("/v1/records/derive", post(records_derive))
        .route("/v1/records/:address", get(records_show))
        .route("/v1/records/:address/adjacency", get(records_adjacency))
        .route("/v1/entangle/score", post(entangle_score))
        .route("/v1/entangle/sweep", post(entangle_sweep))
        .route("/v1/entangle/edges", get(entangle_edges))
        .route("/v1/recover", post(recover))
        .route("/v1/audit", get(audit_list))
        .route("/v1/repairs", get(repairs_list))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let state = ServiceState {
        api: Arc::new(Stat7Api::open(&args.db, config)?),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "stat7 service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/yaml; charset=utf-8")],
        OPENAPI_YAML,
    )
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = run_blocking(&state, Stat7Api::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = run_blocking(&state, move |api| api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn address(
    State(state): State<ServiceState>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<ServiceEnvelope<AddressResult>>, ServiceError> {
    let result = run_blocking(&state, move |api| api.address(&request)).await?;
    Ok(Json(envelope(result)))
}

async fn records_add(
    State(state): State<ServiceState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<ServiceEnvelope<IngestResult>>, ServiceError> {
    let result = run_blocking(&state, move |api| api.ingest(request)).await?;
    Ok(Json(envelope(result)))
}

async fn records_derive(
    State(state): State<ServiceState>,
    Json(request): Json<DeriveRequest>,
) -> Result<Json<ServiceEnvelope<IngestResult>>, ServiceError> {
    let result = run_blocking(&state, move |api| api.derive(request)).await?;
    Ok(Json(envelope(result)))
}

async fn records_show(
    State(state): State<ServiceState>,
    Path(raw): Path<String>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let address = parse_address(&raw)?;
    let lookup = address.clone();
    match run_blocking(&state, move |api| api.get_record(&lookup)).await? {
        Some(record) => Ok(Json(envelope(record))),
        None => Err(ServiceError::new(
            StatusCode::NOT_FOUND,
            format!("record {address} not found"),
        )),
    }
}

async fn records_adjacency(
    State(state): State<ServiceState>,
    Path(raw): Path<String>,
) -> Result<Json<ServiceEnvelope<AdjacencyReport>>, ServiceError> {
    let address = parse_address(&raw)?;
    let report = run_blocking(&state, move |api| api.adjacency(&address)).await?;
    Ok(Json(envelope(report)))
}

async fn entangle_score(
    State(state): State<ServiceState>,
    Json(request): Json<ScoreRequest>,
) -> Result<Json<ServiceEnvelope<ScoreResult>>, ServiceError> {
    let result = run_blocking(&state, move |api| api.score(&request)).await?;
    Ok(Json(envelope(result)))
}

async fn entangle_sweep(
    State(state): State<ServiceState>,
    Json(request): Json<SweepRequest>,
) -> Result<Json<ServiceEnvelope<SweepResult>>, ServiceError> {
    let cancel = CancellationToken::new();
    let _guard = CancelOnDrop(cancel.clone());
    let result = run_blocking(&state, move |api| api.sweep(&request, &cancel)).await?;
    Ok(Json(envelope(result)))
}

async fn entangle_edges(
    State(state): State<ServiceState>,
    Query(filter): Query<AddressFilter>,
) -> Result<Json<ServiceEnvelope<EdgeList>>, ServiceError> {
    let address = filter.address.as_deref().map(parse_address).transpose()?;
    let edges = run_blocking(&state, move |api| api.edges(address.as_ref())).await?;
    Ok(Json(envelope(EdgeList { edges })))
}

async fn recover(
    State(state): State<ServiceState>,
    Json(request): Json<RecoveryRequest>,
) -> Result<Response, ServiceError> {
    let outcome = run_blocking(&state, move |api| api.recover(&request)).await?;
    let status = match &outcome {
        RecoveryOutcome::Released(_) => StatusCode::OK,
        RecoveryOutcome::Denied(denial) => denial_status(denial.kind),
    };
    Ok((status, Json(envelope(outcome))).into_response())
}

async fn audit_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<AuditList>>, ServiceError> {
    let events = run_blocking(&state, Stat7Api::audit_events).await?;
    Ok(Json(envelope(AuditList { events })))
}

async fn repairs_list(
    State(state): State<ServiceState>,
    Query(filter): Query<AddressFilter>,
) -> Result<Json<ServiceEnvelope<RepairList>>, ServiceError> {
    let address = filter.address.as_deref().map(parse_address).transpose()?;
    let repairs = run_blocking(&state, move |api| api.repairs(address.as_ref())).await?;
    Ok(Json(envelope(RepairList { repairs })))
}
