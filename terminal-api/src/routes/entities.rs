//! Normalized store endpoints

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use terminal_core::{
    fields_from_json, DealTicket, EntityKey, EntityKind, EntityRecord, Position,
};
use terminal_sync::{
    CellKey, Clock, FlashState, Mutation, MutationOutcome, Query, Selection, SyncError,
};
use tracing::{error, info, warn};

use crate::AppState;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(code: StatusCode, error: impl Into<String>) -> axum::response::Response {
    (code, Json(ErrorResponse { error: error.into() })).into_response()
}

/// Response for listing entities
#[derive(Debug, Serialize)]
pub struct EntitiesResponse {
    pub entities: Vec<EntityRecord>,
    pub count: usize,
}

/// Position with derived profit figures
#[derive(Debug, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub current_value: Decimal,
    pub pnl: Decimal,
    pub pnl_percentage: Decimal,
}

/// Deal ticket with its open remainder
#[derive(Debug, Serialize)]
pub struct DealView {
    #[serde(flatten)]
    pub deal: DealTicket,
    pub remaining_quantity: Decimal,
    pub done: bool,
}

/// Result of an optimistic write
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub correlation_id: String,
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Create entity routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entities/{kind}", get(list_entities))
        .route("/entities/{kind}/{id}", get(get_entity).post(submit_mutation))
        .route("/entities/{kind}/{id}/flash", get(get_flash))
        .route("/positions", get(list_positions))
        .route("/deals", get(list_deals))
}

fn parse_kind(kind: &str) -> Result<EntityKind, axum::response::Response> {
    kind.parse()
        .map_err(|e: terminal_core::TerminalError| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Read a query once and drop the selector
async fn select_once(state: &AppState, query: Query) -> Result<Selection, axum::response::Response> {
    match state.sync.select(query).await {
        Ok(selector) => {
            let selection = selector.current();
            selector.dispose();
            Ok(selection)
        }
        Err(e) => {
            error!("Select failed: {}", e);
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

async fn records_of_kind(state: &AppState, kind: EntityKind) -> Result<Vec<EntityRecord>, axum::response::Response> {
    match select_once(state, Query::Kind(kind)).await? {
        Selection::Kind(records) => Ok(records),
        _ => Ok(Vec::new()),
    }
}

/// List every entity of a kind
async fn list_entities(State(state): State<AppState>, Path(kind): Path<String>) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    match records_of_kind(&state, kind).await {
        Ok(entities) => {
            let count = entities.len();
            Json(EntitiesResponse { entities, count }).into_response()
        }
        Err(response) => response,
    }
}

/// Get one entity with pending optimistic writes applied
async fn get_entity(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let key = EntityKey::new(kind, id);
    match select_once(&state, Query::Entity(key.clone())).await {
        Ok(Selection::Entity(Some(record))) => Json(record).into_response(),
        Ok(_) => error_response(StatusCode::NOT_FOUND, format!("Entity not found: {}", key)),
        Err(response) => response,
    }
}

/// Apply a field update optimistically and wait for the server verdict
async fn submit_mutation(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let Some(fields) = fields_from_json(&body).filter(|f| !f.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Body must be a non-empty JSON object");
    };

    let key = EntityKey::new(kind, id);
    info!("Submitting {} field(s) for {}", fields.len(), key);

    let pending = match state.sync.submit(Mutation::new(key, fields)).await {
        Ok(pending) => pending,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    let correlation_id = pending.correlation_id.clone();

    match pending.wait().await {
        MutationOutcome::Confirmed => Json(MutationResponse {
            correlation_id,
            confirmed: true,
            reason: None,
        })
        .into_response(),
        MutationOutcome::RolledBack { reason } => {
            warn!("Mutation {} rolled back: {}", correlation_id, reason);
            let code = match reason {
                SyncError::NotConnected | SyncError::EngineClosed => StatusCode::SERVICE_UNAVAILABLE,
                SyncError::MutationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::CONFLICT,
            };
            (
                code,
                Json(MutationResponse {
                    correlation_id,
                    confirmed: false,
                    reason: Some(reason.to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// Live highlights for each field of an entity
async fn get_flash(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let key = EntityKey::new(kind, id);
    let record = match select_once(&state, Query::Entity(key.clone())).await {
        Ok(Selection::Entity(Some(record))) => record,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, format!("Entity not found: {}", key)),
        Err(response) => return response,
    };

    let now = state.clock.now_ms();
    let flash = state.flash.read().await;
    let cells: BTreeMap<String, FlashState> = record
        .fields
        .keys()
        .map(|field| {
            let cell = CellKey::new(key.clone(), field.clone());
            (field.clone(), flash.state(&cell, now))
        })
        .collect();

    Json(cells).into_response()
}

/// Positions with profit and loss
async fn list_positions(State(state): State<AppState>) -> impl IntoResponse {
    let records = match records_of_kind(&state, EntityKind::Position).await {
        Ok(records) => records,
        Err(response) => return response,
    };

    let positions: Vec<PositionView> = records
        .iter()
        .filter_map(|record| match Position::from_record(record) {
            Ok(position) => Some(PositionView {
                current_value: position.current_value(),
                pnl: position.calculate_pnl(),
                pnl_percentage: position.pnl_percentage(),
                position,
            }),
            Err(e) => {
                warn!("Skipping position {}: {}", record.key, e);
                None
            }
        })
        .collect();

    Json(positions).into_response()
}

/// Deal tickets with their open remainder
async fn list_deals(State(state): State<AppState>) -> impl IntoResponse {
    let records = match records_of_kind(&state, EntityKind::DealTicket).await {
        Ok(records) => records,
        Err(response) => return response,
    };

    let deals: Vec<DealView> = records
        .iter()
        .filter_map(|record| match DealTicket::from_record(record) {
            Ok(deal) => Some(DealView {
                remaining_quantity: deal.remaining_quantity(),
                done: deal.status.is_terminal(),
                deal,
            }),
            Err(e) => {
                warn!("Skipping deal {}: {}", record.key, e);
                None
            }
        })
        .collect();

    Json(deals).into_response()
}
