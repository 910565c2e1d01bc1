use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::{ok, Ready};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::info;

use crate::models::RequestContext;

/// One structured log line per request, written after the response is final.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccessLog;

impl<S, B> Transform<S, ServiceRequest> for AccessLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AccessLogMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AccessLogMiddleware {
            service: Arc::new(service),
        })
    }
}

pub struct AccessLogMiddleware<S> {
    service: Arc<S>,
}

impl<S, B> Service<ServiceRequest> for AccessLogMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let request_host = req.connection_info().host().to_string();
        let context_before = RequestContext::current(&req);

        let fut = self.service.call(req);
        Box::pin(async move {
            let result = fut.await;

            let (status, context) = match &result {
                Ok(res) => (res.status(), RequestContext::current(res.request())),
                Err(err) => (err.as_response_error().status_code(), context_before),
            };
            let host = context.upstream_host.clone().unwrap_or(request_host);
            let api_key_id = context.api_key_id().map(|id| id.to_string()).unwrap_or_default();

            info!(
                method = %method,
                path = %path,
                host = %host,
                status = status.as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                request_id = %context.request_id,
                content_id = %context.content_id,
                api_key_id = %api_key_id,
                "request"
            );

            result
        })
    }
}
