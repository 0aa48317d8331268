use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::relation::{Bag, DataBag};
use shared::types::{FrontendResponse, LoadbalancerRequests, PublishOutcome};
use shared::EndpointError;
use crate::provider::ADVERTISED_PROTOCOL;
use crate::provider_manager::{ProviderError, ProviderHandle, Readiness};

#[derive(Clone)]
pub struct AppState {
    pub provider: ProviderHandle,
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Deserialize)]
pub struct ReadyRequest {
    pub partition: String,
    #[serde(rename = "ip")]
    pub addresses: Vec<String>,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    ADVERTISED_PROTOCOL.to_string()
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvertiseResponse {
    Published { peers: usize },
    NotWriter,
}

impl From<PublishOutcome> for AdvertiseResponse {
    fn from(outcome: PublishOutcome) -> Self {
        match outcome {
            PublishOutcome::Published { peers } => Self::Published { peers },
            PublishOutcome::NotWriter => Self::NotWriter,
        }
    }
}

#[derive(Deserialize)]
pub struct NewRelation {
    pub endpoint: String,
    pub remote_app: String,
}

#[derive(Serialize)]
pub struct RelationCreated {
    pub relation_id: u64,
}

#[derive(Serialize)]
pub struct Changed {
    pub changed: bool,
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/loadbalancers", get(get_loadbalancers))
        .route("/loadbalancers/hash", get(get_hash))
        .route("/loadbalancers/ready", get(get_ready))
        .route("/loadbalancers/:service/ready", post(mark_ready))
        .route("/advertise", post(advertise))
        .route("/relations", post(create_relation))
        .route("/relations/:id", delete(remove_relation))
        .route("/relations/:id/units/:unit", put(join_unit).delete(depart_unit))
        .route("/relations/:id/data/:owner", get(read_bag).put(put_bag));

    Router::new().nest(API_PREFIX, routes).with_state(state)
}

/// Unit names carry a '/', application names never do.
fn bag_for(owner: String) -> Bag {
    if owner.contains('/') {
        Bag::Unit(owner)
    } else {
        Bag::App(owner)
    }
}

fn error_status(context: &str, e: ProviderError) -> StatusCode {
    tracing::error!("{}: {}", context, e);
    match e {
        ProviderError::Endpoint(EndpointError::UnknownRelation(_)) => StatusCode::NOT_FOUND,
        ProviderError::Endpoint(
            EndpointError::MalformedRecord(_)
            | EndpointError::MissingField(_)
            | EndpointError::InvalidField { .. }
            | EndpointError::ForeignBag(_),
        ) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_loadbalancers(
    State(state): State<AppState>,
) -> Result<Json<LoadbalancerRequests>, StatusCode> {
    state
        .provider
        .requests()
        .await
        .map(Json)
        .map_err(|e| error_status("Failed to aggregate requests", e))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_ready(State(state): State<AppState>) -> Result<Json<FrontendResponse>, StatusCode> {
    state
        .provider
        .ready_services()
        .await
        .map(Json)
        .map_err(|e| error_status("Failed to read readiness", e))
}

async fn mark_ready(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(req): Json<ReadyRequest>,
) -> Result<StatusCode, StatusCode> {
    state
        .provider
        .ready(Readiness {
            service_name: service,
            partition: req.partition,
            addresses: req.addresses,
            port: req.port,
            protocol: req.protocol,
        })
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| error_status("Failed to record readiness", e))
}

async fn advertise(State(state): State<AppState>) -> Result<Json<AdvertiseResponse>, StatusCode> {
    state
        .provider
        .advertise()
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|e| error_status("Failed to advertise", e))
}

async fn create_relation(
    State(state): State<AppState>,
    Json(req): Json<NewRelation>,
) -> Result<(StatusCode, Json<RelationCreated>), StatusCode> {
    let relation_id = state
        .provider
        .create_relation(req.endpoint, req.remote_app)
        .await
        .map_err(|e| error_status("Failed to create relation", e))?;
    Ok((StatusCode::CREATED, Json(RelationCreated { relation_id })))
}

async fn remove_relation(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, StatusCode> {
    state
        .provider
        .remove_relation(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| error_status("Failed to remove relation", e))
}

async fn join_unit(
    State(state): State<AppState>,
    Path((id, unit)): Path<(u64, String)>,
) -> Result<Json<Changed>, StatusCode> {
    state
        .provider
        .join_unit(id, unit)
        .await
        .map(|changed| Json(Changed { changed }))
        .map_err(|e| error_status("Failed to join unit", e))
}

async fn depart_unit(
    State(state): State<AppState>,
    Path((id, unit)): Path<(u64, String)>,
) -> Result<Json<Changed>, StatusCode> {
    state
        .provider
        .depart_unit(id, unit)
        .await
        .map(|changed| Json(Changed { changed }))
        .map_err(|e| error_status("Failed to depart unit", e))
}

async fn read_bag(
    State(state): State<AppState>,
    Path((id, owner)): Path<(u64, String)>,
) -> Result<Json<DataBag>, StatusCode> {
    state
        .provider
        .read_bag(id, bag_for(owner))
        .await
        .map(Json)
        .map_err(|e| error_status("Failed to read relation data", e))
}

async fn put_bag(
    State(state): State<AppState>,
    Path((id, owner)): Path<(u64, String)>,
    Json(data): Json<DataBag>,
) -> Result<Json<Changed>, StatusCode> {
    state
        .provider
        .peer_data(id, bag_for(owner), data)
        .await
        .map(|changed| Json(Changed { changed }))
        .map_err(|e| error_status("Failed to store relation data", e))
}
