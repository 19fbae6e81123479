// ===============================
// src/api.rs (HTTP/JSON surface, hyper 0.14)
// ===============================
//
//   GET   /api/overview
//   POST  /api/orders            (Idempotency-Key header)
//   GET   /api/policy
//   PATCH /api/policy
//   GET   /api/quotes?symbols=A,B
//   GET   /api/context?symbol=A
//   GET   /metrics
//
// Rejected orders are 200 with status "rejected"; malformed input is 400;
// storage failures are 500 and leave the ledger untouched.
//
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use hyper::{
    body::HttpBody,
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{OrderInput, OrderSource, PlaceOptions, PolicyPatch};
use crate::error::{Error, Result};
use crate::metrics;
use crate::service::PaperTradingService;

pub const MAX_BODY_BYTES: usize = 64 * 1024;
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
struct OrderBody {
    #[serde(flatten)]
    input: OrderInput,
    #[serde(default)]
    source: OrderSource,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub async fn serve<F>(addr: SocketAddr, svc: Arc<PaperTradingService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let make = make_service_fn(move |_conn| {
        let svc = svc.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let svc = svc.clone();
                async move { Ok::<_, Infallible>(handle(svc, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| Error::Config(format!("bind {addr} failed: {e}")))?
        .serve(make);
    info!(%addr, "api: listening");

    server
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    info!("api: stopped");
    Ok(())
}

/// Route one request. Never fails; errors become JSON error responses.
pub async fn handle(svc: Arc<PaperTradingService>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let res = match (method.clone(), path.as_str()) {
        (Method::GET, "/api/overview") => Ok(json(StatusCode::OK, &svc.overview().await)),
        (Method::POST, "/api/orders") => place_order(svc.clone(), req).await,
        (Method::GET, "/api/policy") => Ok(json(StatusCode::OK, &svc.policy().await)),
        (Method::PATCH, "/api/policy") => update_policy(svc.clone(), req).await,
        (Method::GET, "/api/quotes") => {
            let symbols = query_list(req.uri().query(), "symbols");
            svc.quotes(&symbols).await.map(|q| json(StatusCode::OK, &q))
        }
        (Method::GET, "/api/context") => {
            let symbol = query_list(req.uri().query(), "symbol").into_iter().next().unwrap_or_default();
            match svc.analysis_context(&symbol).await {
                Ok(Some(ctx)) => Ok(json(StatusCode::OK, &ctx)),
                Ok(None) => Ok(error_json(StatusCode::SERVICE_UNAVAILABLE, "no market data available")),
                Err(e) => Err(e),
            }
        }
        (Method::GET, "/metrics") => Ok(metrics_response()),
        (_, "/api/overview" | "/api/orders" | "/api/policy" | "/api/quotes" | "/api/context" | "/metrics") => {
            Ok(error_json(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"))
        }
        _ => Ok(error_json(StatusCode::NOT_FOUND, "not found")),
    };

    match res {
        Ok(r) => r,
        Err(e) if e.is_client_error() => {
            warn!(%method, %path, error = %e, "api: bad request");
            error_json(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e) => {
            error!(%method, %path, error = %e, "api: request failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

// Mutations run on their own task: a client hanging up does not cancel them.
async fn place_order(svc: Arc<PaperTradingService>, req: Request<Body>) -> Result<Response<Body>> {
    let key = match req.headers().get(IDEMPOTENCY_HEADER) {
        Some(v) => Some(
            v.to_str()
                .map_err(|_| Error::InvalidInput("Idempotency-Key must be ASCII".into()))?
                .to_string(),
        ),
        None => None,
    };
    let body: OrderBody = read_json(req).await?;
    let opts = PlaceOptions { idempotency_key: key, source: body.source };
    let order = tokio::spawn(async move { svc.place_order(body.input, opts).await }).await??;
    Ok(json(StatusCode::OK, &order))
}

async fn update_policy(svc: Arc<PaperTradingService>, req: Request<Body>) -> Result<Response<Body>> {
    let patch: PolicyPatch = read_json(req).await?;
    let policy = tokio::spawn(async move { svc.update_policy(patch).await }).await??;
    Ok(json(StatusCode::OK, &policy))
}

/// Bounded read: a declared or streamed body past `MAX_BODY_BYTES` is refused before it is buffered.
async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let too_large = || Error::InvalidInput(format!("body exceeds {MAX_BODY_BYTES} bytes"));
    let mut body = req.into_body();
    if body.size_hint().upper().map_or(false, |n| n > MAX_BODY_BYTES as u64) {
        return Err(too_large());
    }
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| Error::InvalidInput(format!("unreadable body: {e}")))?;
        if buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(too_large());
        }
        buf.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&buf).map_err(|e| Error::InvalidInput(format!("malformed JSON: {e}")))
}

/// `symbols=A,B&symbols=C` -> ["A", "B", "C"]
pub fn query_list(query: Option<&str>, name: &str) -> Vec<String> {
    let Some(q) = query else { return Vec::new() };
    q.split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, _)| *k == name)
        .filter_map(|(_, v)| urlencoding::decode(&v.replace('+', " ")).ok().map(|s| s.into_owned()))
        .flat_map(|v| v.split(',').map(|s| s.trim().to_string()).collect::<Vec<_>>())
        .filter(|s| !s.is_empty())
        .collect()
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut res = Response::new(Body::from(bytes));
            *res.status_mut() = status;
            res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            res
        }
        Err(e) => {
            error!(?e, "api: serialize response failed");
            let mut res = Response::new(Body::from("{\"error\":\"serialization failed\"}"));
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            res
        }
    }
}

fn error_json(status: StatusCode, msg: &str) -> Response<Body> {
    json(status, &ErrorBody { error: msg })
}

fn metrics_response() -> Response<Body> {
    let mut res = Response::new(Body::from(metrics::encode_metrics()));
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(metrics::content_type()));
    res
}
