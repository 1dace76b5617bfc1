use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::{
    auth::{AuthError, Capability},
    config::Config,
    db::LedgerDb,
    ledger::{
        LedgerError, LedgerService,
        balance::BalanceMutation,
        types::{
            AccountView, AdjustBalanceRequest, CreateOrderRequest, DepositRecords,
            DepositRequestBody, DepositRequestRow, DepositWallet, GrabServiceRequest, LedgerStats,
            LoginRequest, LoginResponse, OrderCompletion, OrderImportRequest, OrderImportResponse,
            OrderRow, RetentionSummary, SaveWalletRequest, ServiceGrab, ServiceOrderRow,
            SetDepositWalletRequest, SignupRequest, SubmitOrderRequest, WithdrawRecords,
            WithdrawRequestBody, WithdrawRequestRow,
        },
    },
};

mod helpers;
use helpers::{authorize, parse_status_filter};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    ledger: LedgerService,
    db: Option<Arc<LedgerDb>>,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, ledger: LedgerService, db: Option<Arc<LedgerDb>>) -> Self {
        Self {
            config,
            ledger,
            db,
            started_at: Utc::now(),
        }
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store_driver: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    store_driver: &'static str,
    store_ready: bool,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountSearchQuery {
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

impl<T> ListResponse<T> {
    fn of(items: Vec<T>) -> Json<Self> {
        Json(Self { items })
    }
}

pub fn build_router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.request_timeout_seconds.max(1));
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/api/v1/auth/signup", post(signup))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/me", get(profile))
        .route("/api/v1/me/wallet", post(save_wallet))
        .route("/api/v1/deposits", post(request_deposit))
        .route("/api/v1/deposits/address", get(deposit_address))
        .route(
            "/api/v1/deposits/records/:invitation_code",
            get(deposit_records),
        )
        .route("/api/v1/withdrawals", post(request_withdraw))
        .route(
            "/api/v1/withdrawals/records/:invitation_code",
            get(withdraw_records),
        )
        .route("/api/v1/orders/platform/:platform", get(list_orders))
        .route("/api/v1/orders/submit", post(submit_order))
        .route("/api/v1/services/grab", post(grab_service))
        .route(
            "/api/v1/services/:service_order_id/submit",
            post(submit_service),
        )
        .route("/api/v1/admin/stats", get(admin_stats))
        .route("/api/v1/admin/accounts", get(admin_list_accounts))
        .route(
            "/api/v1/admin/accounts/balance",
            post(admin_adjust_balance),
        )
        .route(
            "/api/v1/admin/accounts/deposit-wallet",
            post(admin_set_deposit_wallet),
        )
        .route(
            "/api/v1/admin/accounts/:account_id/reset",
            post(admin_reset_account),
        )
        .route("/api/v1/admin/deposits", get(admin_list_deposits))
        .route("/api/v1/admin/deposits/history", get(admin_deposit_history))
        .route(
            "/api/v1/admin/deposits/:deposit_id/approve",
            post(admin_approve_deposit),
        )
        .route(
            "/api/v1/admin/deposits/:deposit_id/reject",
            post(admin_reject_deposit),
        )
        .route("/api/v1/admin/withdrawals", get(admin_list_withdrawals))
        .route(
            "/api/v1/admin/withdrawals/history",
            get(admin_withdraw_history),
        )
        .route(
            "/api/v1/admin/withdrawals/:withdraw_id/approve",
            post(admin_approve_withdraw),
        )
        .route(
            "/api/v1/admin/withdrawals/:withdraw_id/reject",
            post(admin_reject_withdraw),
        )
        .route("/api/v1/admin/orders", post(admin_create_order))
        .route("/api/v1/admin/orders/import", post(admin_import_orders))
        .route("/api/v1/admin/retention/run", post(admin_run_retention))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        build_sha: state.config.build_sha,
        uptime_seconds,
        store_driver: store_driver(state.db.as_ref()),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let store_ready = match state.db.as_ref() {
        Some(db) => match db.ping().await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(reason = %error, "ledger readiness probe failed");
                false
            }
        },
        None => true,
    };
    let status = if store_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if store_ready { "ready" } else { "not_ready" },
            store_driver: store_driver(state.db.as_ref()),
            store_ready,
        }),
    )
}

fn store_driver(db: Option<&Arc<LedgerDb>>) -> &'static str {
    if db.is_some() { "postgres" } else { "memory" }
}

// Accounts

async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> Result<(StatusCode, Json<AccountView>), ApiError> {
    let account = state
        .ledger
        .signup(body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let session = state
        .ledger
        .login(body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(session))
}

async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AccountView>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let account = state
        .ledger
        .profile(&principal)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(account))
}

async fn save_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveWalletRequest>,
) -> Result<Json<AccountView>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let account = state
        .ledger
        .save_wallet(&principal, body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(account))
}

// Deposits

async fn deposit_address(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DepositWallet>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let wallet = state
        .ledger
        .deposit_address(&principal)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(wallet))
}

async fn request_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DepositRequestBody>,
) -> Result<(StatusCode, Json<DepositRequestRow>), ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let deposit = state
        .ledger
        .request_deposit(&principal, body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok((StatusCode::CREATED, Json(deposit)))
}

async fn deposit_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invitation_code): Path<String>,
) -> Result<Json<DepositRecords>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let records = state
        .ledger
        .deposit_records(&principal, &invitation_code)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(records))
}

// Withdrawals

async fn request_withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WithdrawRequestBody>,
) -> Result<(StatusCode, Json<WithdrawRequestRow>), ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let withdraw = state
        .ledger
        .request_withdraw(&principal, body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok((StatusCode::CREATED, Json(withdraw)))
}

async fn withdraw_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invitation_code): Path<String>,
) -> Result<Json<WithdrawRecords>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let records = state
        .ledger
        .withdraw_records(&principal, &invitation_code)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(records))
}

// Orders and services

async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(platform): Path<String>,
) -> Result<Json<ListResponse<OrderRow>>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let orders = state
        .ledger
        .list_orders(&principal, &platform)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(ListResponse::of(orders))
}

async fn submit_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitOrderRequest>,
) -> Result<Json<OrderCompletion>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let completion = state
        .ledger
        .submit_order(&principal, body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(completion))
}

async fn grab_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GrabServiceRequest>,
) -> Result<(StatusCode, Json<ServiceGrab>), ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let grab = state
        .ledger
        .grab_service(&principal, body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok((StatusCode::CREATED, Json(grab)))
}

async fn submit_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(service_order_id): Path<String>,
) -> Result<Json<ServiceOrderRow>, ApiError> {
    let principal = authorize(&state, &headers, Capability::User)?;
    let service_order = state
        .ledger
        .submit_service(&principal, &service_order_id)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(service_order))
}

// Admin

async fn admin_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LedgerStats>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let stats = state.ledger.stats().await.map_err(ApiError::from_ledger)?;
    Ok(Json(stats))
}

async fn admin_list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AccountSearchQuery>,
) -> Result<Json<ListResponse<AccountView>>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let accounts = state
        .ledger
        .list_accounts(query.query.as_deref())
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(ListResponse::of(accounts))
}

async fn admin_adjust_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AdjustBalanceRequest>,
) -> Result<Json<BalanceMutation>, ApiError> {
    let principal = authorize(&state, &headers, Capability::Admin)?;
    let mutation = state
        .ledger
        .adjust_balance(body)
        .await
        .map_err(ApiError::from_ledger)?;
    tracing::info!(
        admin_id = %principal.account_id,
        account_id = %mutation.account_id,
        delta_cents = mutation.delta.total_balance_cents,
        "admin balance adjustment applied"
    );
    Ok(Json(mutation))
}

async fn admin_set_deposit_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SetDepositWalletRequest>,
) -> Result<Json<AccountView>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let account = state
        .ledger
        .set_deposit_wallet(body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(account))
}

async fn admin_reset_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<AccountView>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let account = state
        .ledger
        .reset_account(&account_id)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(account))
}

async fn admin_list_deposits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ListResponse<DepositRequestRow>>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let status = parse_status_filter(query.status.as_deref())?;
    let deposits = state
        .ledger
        .list_deposits(status)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(ListResponse::of(deposits))
}

async fn admin_deposit_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListResponse<DepositRequestRow>>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let deposits = state
        .ledger
        .deposit_history()
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(ListResponse::of(deposits))
}

async fn admin_approve_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deposit_id): Path<String>,
) -> Result<Json<DepositRequestRow>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let deposit = state
        .ledger
        .approve_deposit(&deposit_id)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(deposit))
}

async fn admin_reject_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deposit_id): Path<String>,
) -> Result<Json<DepositRequestRow>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let deposit = state
        .ledger
        .reject_deposit(&deposit_id)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(deposit))
}

async fn admin_list_withdrawals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ListResponse<WithdrawRequestRow>>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let status = parse_status_filter(query.status.as_deref())?;
    let withdrawals = state
        .ledger
        .list_withdrawals(status)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(ListResponse::of(withdrawals))
}

async fn admin_withdraw_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListResponse<WithdrawRequestRow>>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let withdrawals = state
        .ledger
        .withdraw_history()
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(ListResponse::of(withdrawals))
}

async fn admin_approve_withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(withdraw_id): Path<String>,
) -> Result<Json<WithdrawRequestRow>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let withdraw = state
        .ledger
        .approve_withdraw(&withdraw_id)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(withdraw))
}

async fn admin_reject_withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(withdraw_id): Path<String>,
) -> Result<Json<WithdrawRequestRow>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let withdraw = state
        .ledger
        .reject_withdraw(&withdraw_id)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(withdraw))
}

async fn admin_create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderRow>), ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let order = state
        .ledger
        .create_order(body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn admin_import_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OrderImportRequest>,
) -> Result<(StatusCode, Json<OrderImportResponse>), ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let imported = state
        .ledger
        .import_orders(body)
        .await
        .map_err(ApiError::from_ledger)?;
    Ok((StatusCode::CREATED, Json(imported)))
}

async fn admin_run_retention(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RetentionSummary>, ApiError> {
    authorize(&state, &headers, Capability::Admin)?;
    let summary = state
        .ledger
        .purge_resolved_requests(state.config.retention.retention_days, Utc::now())
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(summary))
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    NotFound(String),
    Unauthorized(&'static str),
    Forbidden(String),
    InvalidState(String),
    Conflict(String),
    InsufficientFunds {
        available_cents: i64,
        required_cents: i64,
    },
    Internal(String),
}

impl ApiError {
    fn from_ledger(error: LedgerError) -> Self {
        match error {
            LedgerError::InvalidRequest(message) => Self::InvalidRequest(message),
            LedgerError::NotFound(message) => Self::NotFound(message),
            LedgerError::Unauthenticated(_) => Self::Unauthorized("invalid_credentials"),
            LedgerError::Forbidden(message) => Self::Forbidden(message),
            LedgerError::InvalidState(message) => Self::InvalidState(message),
            LedgerError::Conflict(message) => Self::Conflict(message),
            LedgerError::InsufficientFunds {
                available_cents,
                required_cents,
            } => Self::InsufficientFunds {
                available_cents,
                required_cents,
            },
            LedgerError::Internal(message) => Self::Internal(message),
        }
    }

    fn from_auth(error: AuthError) -> Self {
        let code = error.code();
        if error.is_unauthorized() {
            tracing::warn!(reason_code = code, reason = %error, "ledger auth denied");
            Self::Unauthorized(code)
        } else if error == AuthError::AdminRequired {
            tracing::warn!(reason_code = code, "ledger admin capability denied");
            Self::Forbidden(error.to_string())
        } else {
            Self::Internal(error.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidRequest(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized(reason_code) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "authentication required",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": "forbidden",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InvalidState(message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "invalid_state",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "conflict",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InsufficientFunds {
                available_cents,
                required_cents,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(serde_json::json!({
                    "error": "insufficient_funds",
                    "message": "insufficient balance",
                    "available_cents": available_cents,
                    "required_cents": required_cents,
                })),
            )
                .into_response(),
            Self::Internal(message) => {
                tracing::error!(reason = %message, "ledger request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "internal_error",
                        "message": "internal server error",
                    })),
                )
                    .into_response()
            }
        }
    }
}
