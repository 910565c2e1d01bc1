use actix_web::{dev::Payload, Error, FromRequest, HttpMessage, HttpRequest};
use std::future::{ready, Ready};
use std::sync::Arc;

use crate::models::api_key::ApiKeyRecord;

/// Per-request state carried through the pipeline in the request extensions.
///
/// Stages never mutate a context in place; they build an augmented copy and
/// insert it in place of the previous one.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub content_id: String,
    pub api_key: Option<Arc<ApiKeyRecord>>,
    pub upstream_host: Option<String>,
}

impl RequestContext {
    pub fn with_request_id(&self, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..self.clone()
        }
    }

    pub fn with_content_id(&self, content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            ..self.clone()
        }
    }

    pub fn with_api_key(&self, api_key: Arc<ApiKeyRecord>) -> Self {
        Self {
            api_key: Some(api_key),
            ..self.clone()
        }
    }

    pub fn with_upstream_host(&self, upstream_host: impl Into<String>) -> Self {
        Self {
            upstream_host: Some(upstream_host.into()),
            ..self.clone()
        }
    }

    pub fn api_key_id(&self) -> Option<i64> {
        self.api_key.as_ref().map(|k| k.id)
    }

    /// Current context of a request, or an empty one if no stage has run yet.
    pub fn current<R: HttpMessage>(req: &R) -> Self {
        req.extensions().get::<RequestContext>().cloned().unwrap_or_default()
    }

    pub fn store<R: HttpMessage>(self, req: &R) {
        req.extensions_mut().insert(self);
    }
}

impl FromRequest for RequestContext {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(RequestContext::current(req)))
    }
}
