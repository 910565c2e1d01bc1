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
use crate::services::QuotaEngine;

/// Monthly quota per API key. Runs after rate limiting.
#[derive(Clone)]
pub struct QuotaEnforcement {
    engine: Arc<QuotaEngine>,
}

impl QuotaEnforcement {
    pub fn new(engine: Arc<QuotaEngine>) -> Self {
        Self { engine }
    }
}

impl<S, B> Transform<S, ServiceRequest> for QuotaEnforcement
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = QuotaEnforcementMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(QuotaEnforcementMiddleware {
            service: Arc::new(service),
            engine: self.engine.clone(),
        })
    }
}

pub struct QuotaEnforcementMiddleware<S> {
    service: Arc<S>,
    engine: Arc<QuotaEngine>,
}

impl<S, B> Service<ServiceRequest> for QuotaEnforcementMiddleware<S>
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
        let service = self.service.clone();
        let engine = self.engine.clone();

        Box::pin(async move {
            let Some(api_key) = RequestContext::current(&req).api_key else {
                error!("Quota check reached without an authenticated key for {}", req.path());
                return Ok(req.error_response(AppError::MissingApiKey).map_into_right_body());
            };

            let limit = api_key.effective_quota(engine.default_quota());
            if !engine.enforce(&api_key.id.to_string(), limit).await {
                warn!("Monthly quota of {} exhausted for key {}", limit, api_key.id);
                return Ok(req.error_response(AppError::QuotaExceeded).map_into_right_body());
            }

            debug!("Quota check passed for key {}", api_key.id);
            service.call(req).await.map(ServiceResponse::map_into_left_body)
        })
    }
}
