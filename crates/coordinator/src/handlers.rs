//! HTTP surface of the settlement engine.
//!
//! Admin trigger endpoints (operator-authenticated via `x-admin-token`)
//! plus the user-facing claim discovery and confirmation endpoints.
//! Every response is `{ok, ...}` or `{ok:false, error, message?}` with
//! the wire codes from the error taxonomy.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use merx_common::{
    ChainGateway, ErrorClass, EpochVersion, ServiceConfig, SettlementError, UserKey, WeekKey,
};
use merx_store::SettlementDb;

use crate::confirm::{confirm_batch, confirm_claim_with_retry, ClaimOutcome, ClaimRequest};
use crate::control::ControlPlane;
use crate::discovery::claimable_epochs;

// ════════════════════════════════════════════════════════════════════════════
// STATE & WIRING
// ════════════════════════════════════════════════════════════════════════════

/// Shared service state.
pub struct AppState {
    pub db: Arc<SettlementDb>,
    pub gateway: Arc<dyn ChainGateway>,
    pub control: ControlPlane,
    pub config: ServiceConfig,
}

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/freeze", post(admin_freeze))
        .route("/admin/build-epoch", post(admin_build))
        .route("/admin/publish-root", post(admin_publish))
        .route("/admin/mark-onchain", post(admin_mark))
        .route("/admin/reset-week", post(admin_reset))
        .route("/admin/epochs/unpublished", get(admin_unpublished))
        .route("/claims/discover", get(claims_discover))
        .route("/claims/confirm", post(claims_confirm))
        .route("/claims/confirm-batch", post(claims_confirm_batch))
        .with_state(state)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map a settlement error onto an HTTP status + `{ok:false}` body.
fn error_response(e: &SettlementError) -> (StatusCode, Json<Value>) {
    let status = match e {
        SettlementError::EpochNotFound { .. } | SettlementError::NoClaimForUser { .. } => {
            StatusCode::NOT_FOUND
        }
        SettlementError::BatchExists { .. }
        | SettlementError::AlreadyClaimed { .. }
        | SettlementError::EpochAlreadyOnChain { .. }
        | SettlementError::RootMismatch { .. } => StatusCode::CONFLICT,
        _ => match e.class() {
            ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Infra => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        },
    };
    (
        status,
        Json(json!({ "ok": false, "error": e.code(), "message": e.to_string() })),
    )
}

/// Operator gate for `/admin/*` routes.
fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "ok": false, "error": "ADMIN_DISABLED" })),
        ));
    };
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != expected {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "UNAUTHORIZED" })),
        ));
    }
    Ok(())
}

fn parse_week(s: &str) -> Result<WeekKey, (StatusCode, Json<Value>)> {
    WeekKey::parse(s).map_err(|e| error_response(&e))
}

fn parse_user_key(s: &str) -> Result<UserKey, (StatusCode, Json<Value>)> {
    UserKey::from_hex(s).map_err(|e| error_response(&e))
}

// ════════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct FreezeReq {
    #[serde(rename = "weekKey")]
    week_key: String,
    #[serde(default)]
    force: bool,
    #[serde(rename = "sourceWeekKey")]
    source_week_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BuildReq {
    #[serde(rename = "weekKey")]
    week_key: String,
    /// Claim scheme version; defaults to the current (salted) scheme.
    #[serde(default = "default_version")]
    version: u8,
    generation: Option<u32>,
}

fn default_version() -> u8 {
    2
}

#[derive(Debug, Deserialize)]
pub struct EpochReq {
    epoch: u64,
    #[serde(rename = "txSig")]
    tx_sig: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetReq {
    #[serde(rename = "weekKey")]
    week_key: String,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    #[serde(rename = "userKey")]
    user_key: String,
    /// The wallet the site has linked for this user, if any.
    wallet: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmReq {
    signature: String,
    epoch: u64,
    #[serde(rename = "userKeyHex")]
    user_key_hex: String,
    claimer: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBatchReq {
    claims: Vec<ConfirmReq>,
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn admin_freeze(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FreezeReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let week_key = parse_week(&req.week_key)?;
    let source_week = req
        .source_week_key
        .as_deref()
        .map(parse_week)
        .transpose()?;

    let outcome = state
        .control
        .freeze(&week_key, req.force, source_week, now_unix())
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({
        "ok": true,
        "weekKey": outcome.week_key.as_str(),
        "generation": outcome.generation,
        "userCount": outcome.user_count,
        "eventCount": outcome.event_count,
        "totalAmount": outcome.total_amount.to_string(),
    })))
}

async fn admin_build(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BuildReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let week_key = parse_week(&req.week_key)?;
    let version = EpochVersion::from_u8(req.version).map_err(|e| error_response(&e))?;

    let outcome = state
        .control
        .build(&week_key, version, req.generation, now_unix())
        .await
        .map_err(|e| error_response(&e))?;
    let epoch = outcome.epoch();
    Ok(Json(json!({
        "ok": true,
        "skipped": outcome.skipped(),
        "epoch": epoch.epoch,
        "weekKey": epoch.week_key.as_str(),
        "version": epoch.version.as_u8(),
        "rootHex": epoch.root_hex(),
        "leafCount": epoch.leaf_count,
        "totalAtomic": epoch.total_atomic.to_string(),
    })))
}

async fn admin_publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EpochReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let outcome = state
        .control
        .publish_root(req.epoch)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({
        "ok": true,
        "epoch": outcome.epoch,
        "txSig": outcome.tx_sig,
        "alreadyPublished": outcome.already_published,
    })))
}

async fn admin_mark(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EpochReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let outcome = state
        .control
        .mark_on_chain(req.epoch, req.tx_sig)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({
        "ok": true,
        "epoch": outcome.epoch.epoch,
        "setOnChain": outcome.epoch.set_on_chain,
        "alreadySet": outcome.already_set,
        "txSig": outcome.epoch.on_chain_tx_sig,
    })))
}

async fn admin_reset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ResetReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let week_key = parse_week(&req.week_key)?;
    let counts = state
        .control
        .reset_week(&week_key)
        .map_err(|e| error_response(&e))?;
    info!(week = %week_key, "week reset via admin api");
    Ok(Json(json!({
        "ok": true,
        "weekKey": week_key.as_str(),
        "deletedEvents": counts.events,
        "deletedBatches": counts.batches,
        "deletedEpochs": counts.epochs,
        "deletedLeaves": counts.leaves,
        "deletedSalts": counts.salts,
    })))
}

async fn admin_unpublished(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    check_admin(&state, &headers)?;
    let epochs = state.control.unpublished().map_err(|e| error_response(&e))?;
    let rows: Vec<Value> = epochs
        .iter()
        .map(|e| {
            json!({
                "epoch": e.epoch,
                "weekKey": e.week_key.as_str(),
                "version": e.version.as_u8(),
                "rootHex": e.root_hex(),
                "leafCount": e.leaf_count,
                "totalAtomic": e.total_atomic.to_string(),
            })
        })
        .collect();
    Ok(Json(json!({ "ok": true, "epochs": rows })))
}

async fn claims_discover(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_key = parse_user_key(&query.user_key)?;
    let wallet = query.wallet.as_deref().map(parse_user_key).transpose()?;

    let entries = claimable_epochs(
        &state.db,
        state.gateway.as_ref(),
        &user_key,
        wallet.as_ref(),
    )
    .map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "ok": true, "claims": entries })))
}

fn outcome_json(epoch: u64, outcome: &ClaimOutcome) -> Value {
    match outcome {
        ClaimOutcome::Confirmed { receipt, attempts } => json!({
            "ok": true,
            "epoch": epoch,
            "status": outcome.status(),
            "txSig": receipt.tx_sig,
            "amountAtomic": receipt.amount_atomic.to_string(),
            "attempts": attempts,
        }),
        ClaimOutcome::AlreadyClaimed { receipt } => json!({
            "ok": true,
            "epoch": epoch,
            "status": outcome.status(),
            "txSig": receipt.as_ref().map(|r| r.tx_sig.clone()),
        }),
        ClaimOutcome::Pending {
            attempts,
            last_error,
        } => json!({
            "ok": false,
            "epoch": epoch,
            "status": outcome.status(),
            "error": last_error.code(),
            "attempts": attempts,
        }),
        ClaimOutcome::Failed { error } => json!({
            "ok": false,
            "epoch": epoch,
            "status": outcome.status(),
            "error": error.code(),
            "message": error.to_string(),
        }),
    }
}

fn parse_claim(req: &ConfirmReq) -> Result<ClaimRequest, (StatusCode, Json<Value>)> {
    Ok(ClaimRequest {
        signature: req.signature.clone(),
        epoch: req.epoch,
        user_key: parse_user_key(&req.user_key_hex)?,
        claimer: parse_user_key(&req.claimer)?,
    })
}

async fn claims_confirm(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfirmReq>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let claim = parse_claim(&req)?;
    let outcome = confirm_claim_with_retry(
        &state.db,
        state.gateway.as_ref(),
        &claim,
        &state.config.claim_retry,
        now_unix(),
    )
    .await;

    let status = match &outcome {
        ClaimOutcome::Pending { .. } => StatusCode::ACCEPTED,
        ClaimOutcome::Failed { error } => error_response(error).0,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome_json(req.epoch, &outcome))))
}

async fn claims_confirm_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfirmBatchReq>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut claims = Vec::with_capacity(req.claims.len());
    for item in &req.claims {
        claims.push(parse_claim(item)?);
    }

    // Each epoch claim is independent; partial success is a valid
    // terminal outcome and is reported per epoch.
    let outcomes = confirm_batch(
        &state.db,
        state.gateway.as_ref(),
        &claims,
        &state.config.claim_retry,
        now_unix(),
    )
    .await;

    let rows: Vec<Value> = outcomes
        .iter()
        .map(|(epoch, outcome)| outcome_json(*epoch, outcome))
        .collect();
    let all_ok = outcomes
        .iter()
        .all(|(_, o)| matches!(o, ClaimOutcome::Confirmed { .. } | ClaimOutcome::AlreadyClaimed { .. }));
    Ok(Json(json!({ "ok": all_ok, "results": rows })))
}
