/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! HTTP server accepting upgraded streaming connections.
//!
//! Paths have the shape `/{exec|attach|portforward}/{token}`. A valid,
//! unexpired token upgrades the connection and hands it to the matching
//! session runner; anything else is a plain HTTP error.

use super::SessionKind;
use crate::cri::CriService;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Bind the stream server and run it until shutdown. Returns the bound
/// address so the coordinator can mint URLs.
pub async fn run(
    service: Arc<CriService>,
    mut shutdown: watch::Receiver<()>,
) -> std::io::Result<SocketAddr> {
    let address: SocketAddr = format!(
        "{}:{}",
        service.config.stream_server_address, service.config.stream_server_port
    )
    .parse()
    .map_err(|e| std::io::Error::other(format!("stream address: {e}")))?;

    let make_service = make_service_fn(move |_conn| {
        let service = Arc::clone(&service);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle(Arc::clone(&service), request)
            }))
        }
    });

    let server = Server::try_bind(&address)
        .map_err(|e| std::io::Error::other(e.to_string()))?
        .serve(make_service);
    let bound = server.local_addr();
    info!("stream server listening on {bound}");

    let _ = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(e) = graceful.await {
            warn!("stream server failed: {e}");
        }
    });
    Ok(bound)
}

async fn handle(
    service: Arc<CriService>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if request.method() != Method::GET && request.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let path = request.uri().path().trim_matches('/').to_string();
    let Some((kind, token)) = path.split_once('/') else {
        return Ok(plain(StatusCode::NOT_FOUND, "not found"));
    };

    let session = match service.streaming.claim(token) {
        Ok(session) => session,
        Err(e) => return Ok(plain(StatusCode::NOT_FOUND, &e.to_string())),
    };
    let matches = matches!(
        (kind, &session),
        ("exec", SessionKind::Exec(_))
            | ("attach", SessionKind::Attach(_))
            | ("portforward", SessionKind::PortForward(_))
    );
    if !matches {
        return Ok(plain(StatusCode::BAD_REQUEST, "session kind mismatch"));
    }

    // Take over the connection; the session runs on the raw stream,
    // bounded by the configured idle timeout.
    let _ = tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                let idle_timeout = service.streaming.idle_timeout;
                let session_future = async {
                    match session {
                        SessionKind::Exec(exec) => {
                            service
                                .streaming
                                .run_exec_session(upgraded, exec)
                                .await
                        }
                        SessionKind::Attach(attach) => {
                            service
                                .streaming
                                .run_attach_session(upgraded, attach)
                                .await
                        }
                        SessionKind::PortForward(pf) => {
                            service
                                .streaming
                                .run_port_forward_session(upgraded, pf)
                                .await
                        }
                    }
                };
                match tokio::time::timeout(idle_timeout, session_future).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("streaming session failed: {e}"),
                    Err(_) => {
                        warn!("streaming session exceeded the idle timeout")
                    }
                }
            }
            Err(e) => warn!("connection upgrade failed: {e}"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    Ok(response)
}

fn plain(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
}
