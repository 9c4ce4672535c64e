//! Metrics and health server
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /healthz`: always 200 while the process runs
//! - `GET /readyz`: 200 once the informer caches have synced, 503 before

use crate::apis::metrics::gather_controller_metrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Serve on `bind_addr` until `shutdown` fires
pub async fn serve(
    bind_addr: &str,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Metrics server listening on {}", bind_addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        let ready = ready.clone();

                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service =
                                service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let ready = ready.clone();
                                    async move {
                                        Ok::<_, Infallible>(handle_request(
                                            req.method(),
                                            req.uri().path(),
                                            &ready,
                                        ))
                                    }
                                });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", bind_addr, e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Metrics server on {} received shutdown signal", bind_addr);
                break;
            }
        }
    }

    Ok(())
}

/// Route one request
pub fn handle_request(method: &Method, path: &str, ready: &AtomicBool) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    match path {
        "/metrics" => match gather_controller_metrics() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap_or_else(|_| {
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                }),
            Err(e) => {
                error!("{}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" => {
            if ready.load(Ordering::Acquire) {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_healthz_always_ok() {
        let ready = AtomicBool::new(false);
        let response = handle_request(&Method::GET, "/healthz", &ready);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_readyz_follows_cache_sync() {
        let ready = AtomicBool::new(false);
        assert_eq!(
            handle_request(&Method::GET, "/readyz", &ready).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        ready.store(true, Ordering::Release);
        assert_eq!(
            handle_request(&Method::GET, "/readyz", &ready).status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text_format() {
        let ready = AtomicBool::new(true);
        let response = handle_request(&Method::GET, "/metrics", &ready);

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("ingress_manager_workqueue_depth"));
    }

    #[test]
    fn test_unknown_path_and_method() {
        let ready = AtomicBool::new(true);
        assert_eq!(
            handle_request(&Method::GET, "/nope", &ready).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            handle_request(&Method::POST, "/metrics", &ready).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            "127.0.0.1:0",
            Arc::new(AtomicBool::new(false)),
            shutdown.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), server)
            .await
            .expect("server should stop")
            .unwrap()
            .expect("bind should succeed");
    }
}
