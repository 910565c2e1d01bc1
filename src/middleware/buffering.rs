use actix_web::{
    body::{to_bytes, BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error, ResponseError,
};
use futures_util::future::{ok, Ready};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::error;

use crate::error::AppError;
use crate::models::RequestContext;

/// Collects the inner response body into memory before any outer stage sees it.
///
/// Outer stages can then rely on the status and headers being final. A body
/// that fails while being read becomes a 500.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseBuffer;

impl<S, B> Transform<S, ServiceRequest> for ResponseBuffer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = ResponseBufferMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ResponseBufferMiddleware {
            service: Arc::new(service),
        })
    }
}

pub struct ResponseBufferMiddleware<S> {
    service: Arc<S>,
}

impl<S, B> Service<ServiceRequest> for ResponseBufferMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let fut = self.service.call(req);

        Box::pin(async move {
            let res = fut.await?;
            let (http_req, response) = res.into_parts();
            let (head, body) = response.into_parts();

            match to_bytes(body).await {
                Ok(bytes) => Ok(ServiceResponse::new(http_req, head.set_body(bytes).map_into_boxed_body())),
                Err(e) => {
                    let e: Box<dyn std::error::Error> = e.into();
                    let context = RequestContext::current(&http_req);
                    error!(
                        request_id = %context.request_id,
                        content_id = %context.content_id,
                        error = %e,
                        "Response body failed while buffering"
                    );
                    let response = AppError::Internal(e.to_string()).error_response();
                    Ok(ServiceResponse::new(http_req, response))
                }
            }
        })
    }
}
