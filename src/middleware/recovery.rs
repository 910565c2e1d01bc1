use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    http::StatusCode,
    Error, HttpResponse, ResponseError,
};
use futures_util::future::{ok, Ready};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::error;

use crate::error::AppError;
use crate::middleware::correlation_id::{CONTENT_ID_HEADER, REQUEST_ID_HEADER};
use crate::models::RequestContext;

/// A request that failed inside the pipeline. Renders as the generic JSON 500
/// and still carries the correlation headers.
#[derive(Debug)]
pub struct PipelineFault {
    request_id: String,
    content_id: String,
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal server error (request {})", self.request_id)
    }
}

impl ResponseError for PipelineFault {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = AppError::Internal(String::new()).error_response();
        for (name, value) in [(REQUEST_ID_HEADER, &self.request_id), (CONTENT_ID_HEADER, &self.content_id)] {
            if let Ok(value) = HeaderValue::from_str(value) {
                response.headers_mut().insert(HeaderName::from_static(name), value);
            }
        }
        response
    }
}

/// Keeps a failure in one request from reaching the worker.
///
/// Panics anywhere below, and errors that would render as 5xx, are logged with
/// both identifiers and turned into a [`PipelineFault`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FaultRecovery;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<S, B> Transform<S, ServiceRequest> for FaultRecovery
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = FaultRecoveryMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(FaultRecoveryMiddleware {
            service: Arc::new(service),
        })
    }
}

pub struct FaultRecoveryMiddleware<S> {
    service: Arc<S>,
}

impl<S, B> Service<ServiceRequest> for FaultRecoveryMiddleware<S>
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
        let service = self.service.clone();
        let context = RequestContext::current(&req);
        let method = req.method().to_string();
        let path = req.path().to_string();

        Box::pin(async move {
            // The inner call runs inside the guarded future so a panic while
            // building it is caught as well.
            let outcome = AssertUnwindSafe(async move { service.call(req).await })
                .catch_unwind()
                .await;

            let fault = PipelineFault {
                request_id: context.request_id.clone(),
                content_id: context.content_id.clone(),
            };

            match outcome {
                Ok(Ok(res)) => Ok(res),
                Ok(Err(err)) => {
                    let status = err.as_response_error().status_code();
                    if !status.is_server_error() {
                        return Err(err);
                    }
                    error!(
                        request_id = %fault.request_id,
                        content_id = %fault.content_id,
                        method = %method,
                        path = %path,
                        error = %err,
                        "Unhandled error in request pipeline"
                    );
                    Err(fault.into())
                }
                Err(panic) => {
                    error!(
                        request_id = %fault.request_id,
                        content_id = %fault.content_id,
                        method = %method,
                        path = %path,
                        panic = %panic_message(panic.as_ref()),
                        "Recovered from panic in request pipeline"
                    );
                    Err(fault.into())
                }
            }
        })
    }
}
