//! Prometheus scrape endpoint.

use crate::metrics::collect_metrics;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Serves `GET /metrics` and `GET /health`.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}/metrics", self.addr);
        serve(listener).await
    }
}

pub async fn serve(listener: TcpListener) -> Result<(), anyhow::Error> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(handle_request);
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            collect_metrics(),
        ),
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok\n".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found\n".to_string()),
    };
    Ok(response)
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
