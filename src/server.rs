//! HTTP surface
//!
//! A small hyper (HTTP/1) server in front of [`AdService`]:
//!
//! | route | purpose |
//! |---|---|
//! | `GET /health` | liveness |
//! | `GET /metrics` | Prometheus scrape |
//! | `GET /ad` | decision for a placement (JSON) |
//! | `GET /pop` | proof-of-play relay |
//! | `GET /cache/status` | decision and asset cache status |
//! | `POST /cache/invalidate` | drop one placement's decision |
//! | `POST /cache/clear` | drop every decision |
//! | `GET /cached-assets/<file>` | locally cached creative |

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::service::AdService;
use crate::upstream::DecisionRequest;

/// Longest accepted placement identifier
pub const MAX_PLACEMENT_ID_LEN: usize = 128;

/// Player models the upstream knows about
pub const PLAYER_MODELS: [&str; 5] = ["ME-DEC", "USDP-R5000", "USDP-R2200", "USDP-R1000", "USDP-R500"];

/// Prefix cached creatives are served under
pub const CACHED_ASSETS_PREFIX: &str = "/cached-assets/";

type HttpResponse = Response<Full<Bytes>>;

// =============================================================================
// Listener
// =============================================================================

/// Bind `addr` and serve until `shutdown` fires
pub async fn run(addr: SocketAddr, service: AdService, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind HTTP server on {}: {}", addr, e)))?;

    info!(%addr, "HTTP server listening");
    serve_listener(listener, service, shutdown).await
}

/// Serve connections from an already bound listener until `shutdown` fires.
///
/// Connections already accepted run to completion on their own tasks.
pub async fn serve_listener(
    listener: TcpListener,
    service: AdService,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("HTTP server stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "HTTP server accept error");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let service = service.clone();

        tokio::spawn(async move {
            let handler = service_fn(move |req| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(route(&service, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                debug!(%peer, error = %e, "HTTP connection error");
            }
        });
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Dispatch one request
pub async fn route<B>(service: &AdService, req: Request<B>) -> HttpResponse
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => health(service),
        (&Method::GET, "/metrics") => metrics_page(),
        (&Method::GET, "/ad") => ad(service, &query).await,
        (&Method::GET, "/pop") => proof_of_play(service, &query).await,
        (&Method::GET, "/cache/status") => cache_status(service),
        (&Method::POST, "/cache/invalidate") => match read_body(req).await {
            Ok(body) => invalidate(service, &body),
            Err(e) => error_response(&e),
        },
        (&Method::POST, "/cache/clear") => {
            service.clear_decisions();
            json_response(
                StatusCode::OK,
                &json!({"cleared": true, "timestamp": Utc::now().to_rfc3339()}),
            )
        }
        (&Method::GET, p) if p.starts_with(CACHED_ASSETS_PREFIX) => {
            cached_asset(service, &p[CACHED_ASSETS_PREFIX.len()..]).await
        }
        (_, "/health" | "/metrics" | "/ad" | "/pop" | "/cache/status" | "/cache/invalidate"
            | "/cache/clear") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({"error": "MethodNotAllowed", "message": format!("{} not allowed on {}", method, path)}),
        ),
        _ => json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": "NotFound", "message": format!("No route for {}", path)}),
        ),
    };

    debug!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Handled request"
    );
    response
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn param<'a>(query: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    query
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| Error::InvalidRequest(format!("Failed to read request body: {}", e)))
}

// =============================================================================
// Handlers
// =============================================================================

fn health(service: &AdService) -> HttpResponse {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "assetCacheEnabled": service.assets().is_enabled(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn metrics_page() -> HttpResponse {
    match metrics::gather() {
        Ok((content_type, body)) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => error_response(&e),
    }
}

/// Validate `/ad` query parameters into a request
pub fn decision_request(query: &HashMap<String, String>) -> Result<DecisionRequest> {
    let placement_id = param(query, "placementId")
        .ok_or_else(|| Error::InvalidRequest("placementId is required".to_string()))?;
    if placement_id.chars().count() > MAX_PLACEMENT_ID_LEN {
        return Err(Error::InvalidRequest(format!(
            "placementId must be {} characters or fewer",
            MAX_PLACEMENT_ID_LEN
        )));
    }

    let player_model = param(query, "playerModel");
    if let Some(model) = player_model {
        if !PLAYER_MODELS.contains(&model) {
            return Err(Error::InvalidRequest(format!(
                "playerModel must be one of {}",
                PLAYER_MODELS.join(", ")
            )));
        }
    }

    Ok(DecisionRequest {
        placement_id: placement_id.to_string(),
        device_id: param(query, "deviceId").map(str::to_string),
        venue_id: param(query, "venueId").map(str::to_string),
        player_model: player_model.map(str::to_string),
    })
}

async fn ad(service: &AdService, query: &HashMap<String, String>) -> HttpResponse {
    let request = match decision_request(query) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    match service.serve(&request).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => error_response(&e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Forwarded<'a> {
    status: &'static str,
    event_id: &'a str,
    target_host: Option<String>,
    response_status: u16,
    duration_ms: u64,
    attempts: u32,
    received_at: String,
}

async fn proof_of_play(service: &AdService, query: &HashMap<String, String>) -> HttpResponse {
    let event_id = param(query, "eventId").unwrap_or_default();
    let proof_url = param(query, "url");
    let target_host = proof_url
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string));

    info!(event_id, target_host = ?target_host, "Received proof-of-play callback");

    match service.forward_proof_of_play(event_id, proof_url).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            &Forwarded {
                status: "forwarded",
                event_id,
                target_host,
                response_status: outcome.http_status,
                duration_ms: outcome.elapsed_ms,
                attempts: outcome.attempt_count,
                received_at: Utc::now().to_rfc3339(),
            },
        ),
        Err(e) => {
            let mut body = error_body(&e);
            body["eventId"] = json!(event_id);
            body["targetHost"] = json!(target_host);
            body["attempts"] = json!(e.attempts().unwrap_or(0));
            json_response(status_of(&e), &body)
        }
    }
}

fn cache_status(service: &AdService) -> HttpResponse {
    let mut body = match serde_json::to_value(service.decision_status()) {
        Ok(body) => body,
        Err(e) => return error_response(&e.into()),
    };
    body["creativeCache"] = match serde_json::to_value(service.asset_status()) {
        Ok(status) => status,
        Err(e) => return error_response(&e.into()),
    };
    json_response(StatusCode::OK, &body)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvalidateBody {
    #[serde(default)]
    placement_id: Option<String>,
}

fn invalidate(service: &AdService, body: &[u8]) -> HttpResponse {
    let parsed: InvalidateBody = if body.is_empty() {
        InvalidateBody { placement_id: None }
    } else {
        match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return error_response(&Error::InvalidRequest(format!("Invalid JSON body: {}", e)))
            }
        }
    };

    let mut query = HashMap::new();
    if let Some(placement_id) = parsed.placement_id {
        query.insert("placementId".to_string(), placement_id);
    }
    let request = match decision_request(&query) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    let removed = service.invalidate(&request.placement_id);
    json_response(
        StatusCode::OK,
        &json!({"placementId": request.placement_id, "removed": removed > 0}),
    )
}

async fn cached_asset(service: &AdService, raw_name: &str) -> HttpResponse {
    if !service.assets().is_enabled() {
        return error_response(&Error::CacheDisabled);
    }

    let not_found = || {
        json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": "NotFound", "message": "No such cached asset"}),
        )
    };

    let Ok(name) = urlencoding::decode(raw_name) else {
        return not_found();
    };
    let Some(path) = service.assets().resolve_public_file(&name) else {
        return not_found();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for(&path)));
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"));
            response
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found(),
        Err(e) => error_response(&e.into()),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

// =============================================================================
// Responses
// =============================================================================

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(r#"{{"error":"JsonError","message":"{}"}}"#, e).into_bytes(),
        ),
    };

    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn status_of(error: &Error) -> StatusCode {
    StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_body(error: &Error) -> Value {
    json!({"error": error.kind(), "message": error.to_string()})
}

fn error_response(error: &Error) -> HttpResponse {
    json_response(status_of(error), &error_body(error))
}
