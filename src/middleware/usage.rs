use actix_web::{
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error, ResponseError,
};
use chrono::Utc;
use futures_util::future::{ok, Ready};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::config::PublishPolicy;
use crate::models::{RequestContext, UsageEvent};
use crate::services::UsagePublisher;

/// Status recorded for requests abandoned before a response was produced.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Default)]
struct UsageDraft {
    request_id: String,
    api_key_id: String,
    upstream_host: String,
    path: String,
    method: String,
}

impl UsageDraft {
    fn into_event(self, status_code: u16, upstream_host: Option<String>, started: Instant) -> UsageEvent {
        UsageEvent::new(
            self.request_id,
            self.api_key_id,
            upstream_host.unwrap_or(self.upstream_host),
            self.path,
            self.method,
            status_code,
            started.elapsed().as_millis() as u64,
            Utc::now(),
        )
    }
}

/// Emits the usage event for a request exactly once: on completion through
/// [`PendingUsage::finish`], or from `Drop` with status 499 if the request
/// future goes away first.
struct PendingUsage {
    publisher: Arc<UsagePublisher>,
    draft: UsageDraft,
    started: Instant,
    armed: bool,
}

impl PendingUsage {
    fn finish(mut self, status_code: u16, upstream_host: Option<String>) -> UsageEvent {
        self.armed = false;
        std::mem::take(&mut self.draft).into_event(status_code, upstream_host, self.started)
    }
}

impl Drop for PendingUsage {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let event = std::mem::take(&mut self.draft).into_event(CLIENT_CLOSED_REQUEST, None, self.started);
        debug!(request_id = %event.request_id, "Request abandoned before completion, recording usage");
        self.publisher.publish_detached(event);
    }
}

/// Publishes one usage event per request after the inner response is known.
#[derive(Clone)]
pub struct UsageRecorder {
    publisher: Arc<UsagePublisher>,
}

impl UsageRecorder {
    pub fn new(publisher: Arc<UsagePublisher>) -> Self {
        Self { publisher }
    }
}

impl<S, B> Transform<S, ServiceRequest> for UsageRecorder
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = UsageRecorderMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(UsageRecorderMiddleware {
            service: Arc::new(service),
            publisher: self.publisher.clone(),
        })
    }
}

pub struct UsageRecorderMiddleware<S> {
    service: Arc<S>,
    publisher: Arc<UsagePublisher>,
}

impl<S, B> Service<ServiceRequest> for UsageRecorderMiddleware<S>
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
        let context = RequestContext::current(&req);
        let publisher = self.publisher.clone();
        let pending = PendingUsage {
            publisher: publisher.clone(),
            draft: UsageDraft {
                request_id: context.request_id.clone(),
                api_key_id: context.api_key_id().map(|id| id.to_string()).unwrap_or_default(),
                upstream_host: context.upstream_host.clone().unwrap_or_default(),
                path: req.path().to_string(),
                method: req.method().to_string(),
            },
            started: Instant::now(),
            armed: true,
        };

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(res)) => res,
                // Record the failure, then let fault recovery handle the panic.
                Err(panic) => {
                    publisher.publish_detached(pending.finish(500, None));
                    std::panic::resume_unwind(panic);
                }
                Ok(Err(err)) => {
                    let event = pending.finish(err.as_response_error().status_code().as_u16(), None);
                    match publisher.policy() {
                        PublishPolicy::FireAndForget => publisher.publish_detached(event),
                        PublishPolicy::Blocking => {
                            if let Err(e) = publisher.publish(&event).await {
                                warn!(request_id = %event.request_id, error = %e, "Failed to publish usage event");
                            }
                        }
                    }
                    return Err(err);
                }
            };

            let upstream_host = RequestContext::current(res.request()).upstream_host;
            let event = pending.finish(res.status().as_u16(), upstream_host);

            match publisher.policy() {
                PublishPolicy::FireAndForget => {
                    publisher.publish_detached(event);
                    Ok(res.map_into_left_body())
                }
                PublishPolicy::Blocking => match publisher.publish(&event).await {
                    Ok(()) => Ok(res.map_into_left_body()),
                    Err(e) => {
                        error!(
                            request_id = %event.request_id,
                            event_id = %event.event_id,
                            error = %e,
                            "Usage stream unavailable, failing request"
                        );
                        let (http_req, _) = res.into_parts();
                        Ok(ServiceResponse::new(http_req, e.error_response()).map_into_right_body())
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use actix_web::{http::StatusCode, test, web, App, HttpResponse};
    use std::time::Duration;

    fn publisher(sink: Arc<RecordingSink>, policy: PublishPolicy) -> Arc<UsagePublisher> {
        Arc::new(UsagePublisher::new(sink, "aether.usage.v1", policy))
    }

    #[actix_web::test]
    async fn test_blocking_failure_becomes_503() {
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(true);
        let app = test::init_service(
            App::new()
                .wrap(UsageRecorder::new(publisher(sink, PublishPolicy::Blocking)))
                .route("/", web::get().to(|| async { HttpResponse::Ok().body("ok") })),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_fire_and_forget_failure_keeps_response() {
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(true);
        let app = test::init_service(
            App::new()
                .wrap(UsageRecorder::new(publisher(sink.clone(), PublishPolicy::FireAndForget)))
                .route("/", web::get().to(|| async { HttpResponse::Ok().body("ok") })),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, "ok");
    }

    #[actix_web::test]
    async fn test_event_carries_final_status_and_path() {
        let sink = Arc::new(RecordingSink::default());
        let app = test::init_service(
            App::new()
                .wrap(UsageRecorder::new(publisher(sink.clone(), PublishPolicy::Blocking)))
                .route("/created", web::post().to(|| async { HttpResponse::Created().finish() })),
        )
        .await;

        let req = test::TestRequest::post().uri("/created").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let events = sink.decoded_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code, 201);
        assert_eq!(events[0].path, "/created");
        assert_eq!(events[0].method, "POST");
        assert_eq!(events[0].api_key_id, "");
    }

    #[tokio::test]
    async fn test_dropped_request_still_records_usage() {
        let sink = Arc::new(RecordingSink::default());
        let pending = PendingUsage {
            publisher: publisher(sink.clone(), PublishPolicy::FireAndForget),
            draft: UsageDraft {
                request_id: "req-gone".to_string(),
                path: "/proxy/slow".to_string(),
                method: "GET".to_string(),
                ..Default::default()
            },
            started: Instant::now(),
            armed: true,
        };
        drop(pending);

        assert!(sink.wait_for(1, Duration::from_secs(1)).await);
        let events = sink.decoded_events();
        assert_eq!(events[0].status_code, CLIENT_CLOSED_REQUEST);
        assert_eq!(events[0].request_id, "req-gone");
    }

    #[tokio::test]
    async fn test_finished_request_is_not_recorded_twice() {
        let sink = Arc::new(RecordingSink::default());
        let pending = PendingUsage {
            publisher: publisher(sink.clone(), PublishPolicy::FireAndForget),
            draft: UsageDraft::default(),
            started: Instant::now(),
            armed: true,
        };
        let event = pending.finish(200, Some("httpbin.org".to_string()));
        assert_eq!(event.upstream_host, "httpbin.org");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.events().is_empty());
    }
}
