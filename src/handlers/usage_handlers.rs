//! Per-user quota and service-wide statistics.

use axum::{Json, extract::State};

use crate::{
    auth::CallerIdentity,
    errors::AppError,
    services::gateway::{GatewayStats, QuotaReport, TransferGateway},
};

/// `GET /storage/quota`
pub async fn quota(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
) -> Result<Json<QuotaReport>, AppError> {
    Ok(Json(gateway.quota(&caller).await?))
}

/// `GET /storage/stats` (admin only)
pub async fn stats(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
) -> Result<Json<GatewayStats>, AppError> {
    Ok(Json(gateway.stats(&caller).await?))
}
