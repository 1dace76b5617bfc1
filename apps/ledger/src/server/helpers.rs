use axum::http::header;

use super::*;
use crate::auth::Principal;
use crate::ledger::types::RequestStatus;

/// Resolves the bearer session and performs the request's single capability check.
pub(super) fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    capability: Capability,
) -> Result<Principal, ApiError> {
    let authorization_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    state
        .ledger
        .sessions()
        .authorize(authorization_header, capability)
        .map_err(ApiError::from_auth)
}

pub(super) fn parse_status_filter(raw: Option<&str>) -> Result<Option<RequestStatus>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if raw == "all" {
        return Ok(None);
    }
    RequestStatus::parse(raw).map(Some).ok_or_else(|| {
        ApiError::InvalidRequest(
            "status must be one of pending, approved, rejected, all".to_string(),
        )
    })
}
