use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::RequestContext;
use crate::services::proxy_director::upstream_label;
use crate::services::ProxyDirector;

/// Terminal stage of the `/proxy` pipeline: picks the upstream for the
/// authenticated key and relays the request to it.
pub async fn proxy_request(
    req: HttpRequest,
    body: web::Bytes,
    director: web::Data<ProxyDirector>,
    context: RequestContext,
) -> AppResult<HttpResponse> {
    let target = director.resolve_target(context.api_key.as_deref());
    let upstream = upstream_label(&target);
    debug!(
        request_id = %context.request_id,
        upstream = %upstream,
        "Proxying request"
    );

    let request_id = context.request_id.clone();
    let content_id = context.content_id.clone();
    context.with_upstream_host(upstream).store(&req);

    director.forward(&req, body, &target).await.map_err(|e| {
        warn!(
            request_id = %request_id,
            content_id = %content_id,
            error = %e,
            "Upstream request failed"
        );
        e
    })
}

/// Fallback for resources that only accept specific methods.
pub async fn method_not_allowed(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::MethodNotAllowed(format!("{} {}", req.method(), req.path())))
}
