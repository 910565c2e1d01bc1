use actix_web::{web, HttpRequest, HttpResponse};
use log::{info, warn};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::models::AppState;
use crate::security::api_key_hashing::constant_time_equal;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Deserialize)]
pub struct InvalidateKeyQuery {
    pub hash: Option<String>,
}

/// `DELETE /admin/cache/apikey?hash=<key hash>`: forget a cached key so the
/// next request for it reads the directory again.
pub async fn invalidate_api_key(
    req: HttpRequest,
    query: web::Query<InvalidateKeyQuery>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    if let Some(expected) = state.admin_token.as_deref() {
        let presented = req
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_equal(presented, expected) {
            warn!("Rejected cache invalidation with missing or wrong admin token");
            return Err(AppError::Unauthorized("admin token required".to_string()));
        }
    }

    let hash = query
        .hash
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        // Cache keys hold lowercase hex.
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| AppError::BadRequest("missing hash".to_string()))?;

    state.resolver.invalidate(&hash).await?;
    info!("API key cache entry invalidated by admin request");

    Ok(HttpResponse::NoContent().finish())
}
