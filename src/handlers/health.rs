use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::services::ReadinessFlag;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    ok: bool,
}

/// Liveness and readiness in one: 200 once the gateway is ready to serve, 503 before.
pub async fn health_check(readiness: web::Data<ReadinessFlag>) -> impl Responder {
    if readiness.is_ready() {
        HttpResponse::Ok().json(HealthResponse { ok: true })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthResponse { ok: false })
    }
}
