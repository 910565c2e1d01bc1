use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error,
};
use futures_util::future::{ok, Ready};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use uuid::Uuid;

use crate::models::RequestContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CONTENT_ID_HEADER: &str = "x-content-id";

/// Caller-supplied identifiers longer than this are replaced.
const MAX_ID_LEN: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorrelationKind {
    Request,
    Content,
}

impl CorrelationKind {
    fn header(self) -> HeaderName {
        match self {
            CorrelationKind::Request => HeaderName::from_static(REQUEST_ID_HEADER),
            CorrelationKind::Content => HeaderName::from_static(CONTENT_ID_HEADER),
        }
    }
}

/// Tags each request with an identifier, keeping one the caller sent.
///
/// The value is written into the request headers (so it reaches the upstream),
/// into the [`RequestContext`], and onto the response.
#[derive(Clone, Copy, Debug)]
pub struct CorrelationId {
    kind: CorrelationKind,
}

impl CorrelationId {
    pub fn request_id() -> Self {
        Self {
            kind: CorrelationKind::Request,
        }
    }

    pub fn content_id() -> Self {
        Self {
            kind: CorrelationKind::Content,
        }
    }
}

fn presented_id(req: &ServiceRequest, header: &HeaderName) -> Option<String> {
    req.headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_ID_LEN)
        .map(str::to_string)
}

impl<S, B> Transform<S, ServiceRequest> for CorrelationId
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = CorrelationIdMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(CorrelationIdMiddleware {
            service: Arc::new(service),
            kind: self.kind,
        })
    }
}

pub struct CorrelationIdMiddleware<S> {
    service: Arc<S>,
    kind: CorrelationKind,
}

impl<S, B> Service<ServiceRequest> for CorrelationIdMiddleware<S>
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

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let header = self.kind.header();
        let id = presented_id(&req, &header).unwrap_or_else(|| Uuid::new_v4().to_string());
        let header_value = HeaderValue::from_str(&id).ok();

        if let Some(value) = header_value.clone() {
            req.headers_mut().insert(header.clone(), value);
        }

        let context = RequestContext::current(&req);
        match self.kind {
            CorrelationKind::Request => context.with_request_id(id),
            CorrelationKind::Content => context.with_content_id(id),
        }
        .store(&req);

        let fut = self.service.call(req);
        Box::pin(async move {
            let mut res = fut.await?;
            if let Some(value) = header_value {
                res.headers_mut().insert(header, value);
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    async fn echo_context(ctx: RequestContext) -> HttpResponse {
        HttpResponse::Ok().body(format!("{}|{}", ctx.request_id, ctx.content_id))
    }

    #[actix_web::test]
    async fn test_generates_and_echoes_ids() {
        let app = test::init_service(
            App::new()
                .wrap(CorrelationId::content_id())
                .wrap(CorrelationId::request_id())
                .route("/", web::get().to(echo_context)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        let request_id = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap().to_string();
        let content_id = resp.headers().get(CONTENT_ID_HEADER).unwrap().to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&request_id).is_ok());
        assert!(Uuid::parse_str(&content_id).is_ok());
        assert_ne!(request_id, content_id);

        let body = test::read_body(resp).await;
        assert_eq!(body, format!("{}|{}", request_id, content_id));
    }

    #[actix_web::test]
    async fn test_preserves_caller_ids() {
        let app = test::init_service(
            App::new()
                .wrap(CorrelationId::content_id())
                .wrap(CorrelationId::request_id())
                .route("/", web::get().to(echo_context)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Request-ID", "req-abc"))
            .insert_header(("X-Content-ID", "content-xyz"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.headers().get(REQUEST_ID_HEADER).unwrap(), "req-abc");
        assert_eq!(resp.headers().get(CONTENT_ID_HEADER).unwrap(), "content-xyz");
        assert_eq!(test::read_body(resp).await, "req-abc|content-xyz");
    }

    #[actix_web::test]
    async fn test_replaces_oversized_id() {
        let app = test::init_service(
            App::new()
                .wrap(CorrelationId::request_id())
                .route("/", web::get().to(echo_context)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Request-ID", "x".repeat(MAX_ID_LEN + 1)))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let echoed = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(echoed).is_ok());
    }
}
