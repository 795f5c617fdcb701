//! HTTP plumbing around the handlers: routing, CORS, the request body cap,
//! and graceful shutdown.

use crate::handlers::{Api, Deps, JsonResponse};
use anyhow::Result;
use crucible_base::caller_fingerprint;
use hyper::{
    body::HttpBody as _,
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde_json::json;
use slog::{info, warn, Logger};
use std::{convert::Infallible, net::IpAddr, net::SocketAddr, sync::Arc};

/// Request bodies larger than this are rejected before JSON parsing. Source
/// is capped at 64 KiB, so this leaves generous room for JSON overhead.
const MAX_BODY_LEN: usize = 256 * 1024;

pub async fn serve<DepsT: Deps>(
    api: Arc<Api<DepsT>>,
    addr: SocketAddr,
    log: Logger,
) -> Result<()> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let api = api.clone();
        let remote_ip = conn.remote_addr().ip();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = api.clone();
                async move { Ok::<_, Infallible>(route(&api, remote_ip, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(log, "listening"; "addr" => addr);
    server
        .with_graceful_shutdown(shutdown_signal(log.clone()))
        .await?;
    info!(log, "shut down");
    Ok(())
}

async fn shutdown_signal(log: Logger) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(log, "cannot install SIGTERM handler"; "error" => %err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!(log, "shutdown signal received");
}

pub async fn route<DepsT: Deps>(
    api: &Api<DepsT>,
    remote_ip: IpAddr,
    req: Request<Body>,
) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return preflight();
    }

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let query = req.uri().query().map(str::to_owned);

    let response = match (method, path.as_str()) {
        (Method::POST, "/execute") => {
            let client = caller_fingerprint(&remote_ip.to_string());
            match read_body_capped(req.into_body()).await {
                Ok(body) => api.submit(&client, &body).await,
                Err(response) => response,
            }
        }
        (Method::GET, "/status") => {
            match query.as_deref().and_then(|q| query_param(q, "job_id")) {
                Some(job_id) => api.status(job_id).await,
                None => JsonResponse {
                    status: 400,
                    body: json!({ "error": "missing job_id parameter", "success": false }),
                },
            }
        }
        (Method::GET, "/languages") => api.languages(),
        (Method::GET, "/health") => JsonResponse {
            status: 200,
            body: json!({ "success": true }),
        },
        _ => JsonResponse {
            status: 404,
            body: json!({ "error": "Not found", "success": false }),
        },
    };
    to_http(response)
}

async fn read_body_capped(mut body: Body) -> Result<Vec<u8>, JsonResponse> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|_| JsonResponse {
            status: 400,
            body: json!({ "error": "error reading request body", "success": false }),
        })?;
        if buf.len() + chunk.len() > MAX_BODY_LEN {
            return Err(JsonResponse {
                status: 400,
                body: json!({ "error": "request body too large", "success": false }),
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn preflight() -> Response<Body> {
    cors(Response::builder().status(StatusCode::NO_CONTENT))
        .body(Body::empty())
        .unwrap()
}

fn to_http(response: JsonResponse) -> Response<Body> {
    cors(Response::builder().status(response.status))
        .header("Content-Type", "application/json")
        .body(Body::from(response.body.to_string()))
        .unwrap()
}
