use actix_web::{
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::{ok, Ready};
use log::{debug, error, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::AppError;
use crate::models::RequestContext;
use crate::services::RateLimiterRegistry;

/// Limiter identity for an authenticated key.
pub fn client_identity(api_key_id: i64) -> String {
    api_key_id.to_string()
}

/// Token-bucket rate limiting per API key. Runs after authentication.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    registry: Arc<RateLimiterRegistry>,
}

impl RateLimitMiddleware {
    pub fn new(registry: Arc<RateLimiterRegistry>) -> Self {
        Self { registry }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitService {
            service: Arc::new(service),
            registry: self.registry.clone(),
        })
    }
}

pub struct RateLimitService<S> {
    service: Arc<S>,
    registry: Arc<RateLimiterRegistry>,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let Some(api_key_id) = RequestContext::current(&req).api_key_id() else {
            error!("Rate limiter reached without an authenticated key for {}", req.path());
            let res = req.error_response(AppError::MissingApiKey).map_into_right_body();
            return Box::pin(async move { Ok(res) });
        };

        let identity = client_identity(api_key_id);
        if !self.registry.allow(&identity) {
            let retry_after_secs = self.registry.retry_after_secs();
            warn!(
                "Rate limit exceeded for key {} on {} (retry after {}s)",
                api_key_id,
                req.path(),
                retry_after_secs
            );
            let res = req
                .error_response(AppError::RateLimited { retry_after_secs })
                .map_into_right_body();
            return Box::pin(async move { Ok(res) });
        }

        debug!("Rate limit passed for key {} on {}", api_key_id, req.path());
        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}
