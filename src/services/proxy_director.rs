use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::AppError;
use crate::models::ApiKeyRecord;

pub const PROXY_PREFIX: &str = "/proxy";

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Never forwarded upstream in either direction, besides the hop-by-hop set.
const REQUEST_HEADERS_DROPPED: [&str; 4] = ["host", "content-length", "x-api-key", "proxy-connection"];

/// Picks the upstream for a request and forwards it there.
///
/// Each key may name its own upstream; everything else goes to the gateway
/// default. Bodies are buffered in both directions.
pub struct ProxyDirector {
    client: reqwest::Client,
    default_upstream: Url,
}

impl ProxyDirector {
    pub fn new(default_upstream: &str, timeout: Duration) -> Result<Self, AppError> {
        let default_upstream = normalize_target(default_upstream)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to create upstream HTTP client: {}", e)))?;

        Ok(Self {
            client,
            default_upstream,
        })
    }

    pub fn default_upstream(&self) -> &Url {
        &self.default_upstream
    }

    /// The key's own upstream when it names a usable one, the default otherwise.
    pub fn resolve_target(&self, api_key: Option<&ApiKeyRecord>) -> Url {
        match api_key.and_then(ApiKeyRecord::upstream_override) {
            Some(host) => match normalize_target(host) {
                Ok(url) => url,
                Err(e) => {
                    warn!(
                        key_id = api_key.map(|k| k.id).unwrap_or_default(),
                        error = %e,
                        "Ignoring unparseable upstream override"
                    );
                    self.default_upstream.clone()
                }
            },
            None => self.default_upstream.clone(),
        }
    }

    pub async fn forward(&self, req: &HttpRequest, body: Bytes, target: &Url) -> Result<HttpResponse, AppError> {
        let url = upstream_url(target, req.path(), req.query_string());
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|e| AppError::BadRequest(format!("unsupported method: {}", e)))?;
        let headers = forwarded_request_headers(req);

        debug!(method = %method, upstream = %url, "Forwarding request upstream");

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(map_upstream_error)?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| AppError::UpstreamUnavailable(format!("invalid upstream status: {}", e)))?;
        let dropped = connection_tokens(response.headers().get_all("connection").iter().filter_map(|v| v.to_str().ok()));

        let mut builder = HttpResponse::build(status);
        for (name, value) in response.headers() {
            let lower = name.as_str();
            if is_hop_by_hop(lower) || lower == "content-length" || dropped.contains(lower) {
                continue;
            }
            builder.append_header((name.as_str(), value.as_bytes()));
        }

        let payload = response.bytes().await.map_err(map_upstream_error)?;
        Ok(builder.body(payload))
    }
}

/// Accepts `host`, `host:port` or a full URL; a missing scheme means `http`.
pub fn normalize_target(target: &str) -> Result<Url, AppError> {
    let trimmed = target.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| AppError::Configuration(format!("invalid upstream '{}': {}", target, e)))?;
    if url.host_str().is_none() {
        return Err(AppError::Configuration(format!("upstream '{}' has no host", target)));
    }
    Ok(url)
}

/// Strips the `/proxy` mount point: `/proxy` becomes `/`, `/proxy/x` becomes `/x`.
pub fn rewrite_path(path: &str) -> String {
    match path.strip_prefix(PROXY_PREFIX) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Target URL for an incoming path and query, keeping any base path on the target.
pub fn upstream_url(target: &Url, path: &str, query: &str) -> Url {
    let mut url = target.clone();
    let rewritten = rewrite_path(path);
    let base = target.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", base, rewritten));
    url.set_query(if query.is_empty() { None } else { Some(query) });
    url
}

/// `host[:port]` of a target, as reported in logs and usage events.
pub fn upstream_label(target: &Url) -> String {
    match (target.host_str(), target.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => target.as_str().to_string(),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

fn connection_tokens<'a>(values: impl Iterator<Item = &'a str>) -> HashSet<String> {
    values
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn forwarded_request_headers(req: &HttpRequest) -> HeaderMap {
    let dropped = connection_tokens(req.headers().get_all("connection").filter_map(|v| v.to_str().ok()));
    let mut headers = HeaderMap::new();

    for (name, value) in req.headers().iter() {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || REQUEST_HEADERS_DROPPED.contains(&lower) || dropped.contains(lower) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let conn_info = req.connection_info();
    if let Some(peer) = req.peer_addr() {
        let client_ip = peer.ip().to_string();
        let forwarded_for = match req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior.trim(), client_ip),
            _ => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(conn_info.host()) {
        headers.insert("x-forwarded-host", value);
    }
    if let Ok(value) = HeaderValue::from_str(conn_info.scheme()) {
        headers.insert("x-forwarded-proto", value);
    }

    headers
}

fn map_upstream_error(error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::UpstreamTimeout(error.to_string())
    } else {
        AppError::UpstreamUnavailable(error.to_string())
    }
}
