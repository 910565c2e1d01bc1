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
use crate::services::ApiKeyResolver;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Extract API key from the X-API-Key header
fn extract_api_key(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolves `X-API-Key` into a key record and attaches it to the request context.
///
/// Missing key: 401. Unknown or disabled key: 403. Directory failure: 500.
/// The header is removed before the request goes further.
#[derive(Clone)]
pub struct ApiKeyAuthentication {
    resolver: Arc<ApiKeyResolver>,
}

impl ApiKeyAuthentication {
    pub fn new(resolver: Arc<ApiKeyResolver>) -> Self {
        Self { resolver }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyAuthentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ApiKeyAuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ApiKeyAuthenticationMiddleware {
            service: Arc::new(service),
            resolver: self.resolver.clone(),
        })
    }
}

pub struct ApiKeyAuthenticationMiddleware<S> {
    service: Arc<S>,
    resolver: Arc<ApiKeyResolver>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyAuthenticationMiddleware<S>
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

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let resolver = self.resolver.clone();

        Box::pin(async move {
            let raw_key = match extract_api_key(&req) {
                Some(key) => key,
                None => {
                    debug!("No API key presented for {} {}", req.method(), req.path());
                    return Ok(req.error_response(AppError::MissingApiKey).map_into_right_body());
                }
            };

            let record = match resolver.resolve(&raw_key).await {
                Ok(record) => record,
                Err(AppError::InvalidApiKey) => {
                    warn!("Unknown API key presented for {}", req.path());
                    return Ok(req.error_response(AppError::InvalidApiKey).map_into_right_body());
                }
                Err(e) => {
                    error!("API key resolution failed for {}: {}", req.path(), e);
                    return Ok(req.error_response(e).map_into_right_body());
                }
            };

            if !record.active {
                warn!("Disabled API key {} presented for {}", record.id, req.path());
                return Ok(req.error_response(AppError::InactiveApiKey).map_into_right_body());
            }

            req.headers_mut().remove(API_KEY_HEADER);
            debug!("API key {} authenticated for {}", record.id, req.path());
            RequestContext::current(&req).with_api_key(Arc::new(record)).store(&req);

            service.call(req).await.map(ServiceResponse::map_into_left_body)
        })
    }
}
