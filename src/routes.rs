use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    web, App, Error, Scope,
};

use crate::handlers;
use crate::middleware::{
    AccessLog, ApiKeyAuthentication, CorrelationId, FaultRecovery, QuotaEnforcement, RateLimitMiddleware,
    ResponseBuffer, UsageRecorder,
};
use crate::models::AppState;
use crate::services::proxy_director::PROXY_PREFIX;

/// A scope guarded by the key-bound stages, outermost first: API key
/// authentication, rate limiting, quota, usage recording, response buffering.
pub fn guarded_scope(
    path: &'static str,
    state: AppState,
) -> Scope<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    // actix runs the last-registered wrap first.
    web::scope(path)
        .wrap(ResponseBuffer)
        .wrap(UsageRecorder::new(state.usage_publisher.clone()))
        .wrap(QuotaEnforcement::new(state.quota_engine.clone()))
        .wrap(RateLimitMiddleware::new(state.rate_limiter.clone()))
        .wrap(ApiKeyAuthentication::new(state.resolver.clone()))
}

/// Registers shared state and every route the gateway serves.
pub fn configure_routes(cfg: &mut web::ServiceConfig, state: &AppState) {
    cfg.app_data(web::Data::new(state.clone()))
        .app_data(web::Data::from(state.readiness.clone()))
        .app_data(web::Data::from(state.proxy_director.clone()))
        .app_data(web::PayloadConfig::new(state.max_body_bytes));

    cfg.service(
        web::resource("/healthz")
            .route(web::get().to(handlers::health::health_check))
            .default_service(web::to(handlers::proxy_handlers::method_not_allowed)),
    );

    cfg.service(
        web::resource("/admin/cache/apikey")
            .route(web::delete().to(handlers::admin_handlers::invalidate_api_key))
            .default_service(web::to(handlers::proxy_handlers::method_not_allowed)),
    );

    // Every method and sub-path under /proxy lands in the default service.
    cfg.service(guarded_scope(PROXY_PREFIX, state.clone()).default_service(web::to(handlers::proxy_handlers::proxy_request)));
}

/// The full application: correlation identifiers, fault recovery and access
/// logging around every route, plus whatever `extra` registers.
pub fn build_app_with<F>(
    state: AppState,
    extra: F,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
>
where
    F: FnOnce(&mut web::ServiceConfig),
{
    App::new()
        .wrap(AccessLog)
        .wrap(FaultRecovery)
        .wrap(CorrelationId::content_id())
        .wrap(CorrelationId::request_id())
        .configure(|cfg| configure_routes(cfg, &state))
        .configure(extra)
}

pub fn build_app(
    state: AppState,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    build_app_with(state, |_| {})
}
