//! Probe and diagnostics endpoints.

use std::{convert::Infallible, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug)]
pub(crate) enum Endpoint {
    /// `/healthz` and `/readyz`.
    Probes,
    /// `/metrics`.
    Metrics,
}

pub(crate) async fn serve(address: SocketAddr, endpoint: Endpoint, shutdown: CancellationToken) {
    let listener = match TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%address, %error, "failed to bind diagnostics listener");
            return;
        }
    };
    debug!(%address, ?endpoint, "serving");

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "failed to accept diagnostics connection");
                continue;
            }
        };

        tokio::spawn(async move {
            let served = http1::Builder::new()
                .serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |request| handle(request, endpoint)),
                )
                .await;
            if let Err(error) = served {
                debug!(%error, "diagnostics connection ended with an error");
            }
        });
    }
}

async fn handle(
    request: Request<Incoming>,
    endpoint: Endpoint,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (endpoint, request.uri().path()) {
        (Endpoint::Probes, "/healthz" | "/readyz") => Response::new(Full::from("ok")),
        (Endpoint::Metrics, "/metrics") => Response::new(Full::from(format!(
            "# HELP handover_build_info Build information.\n\
             # TYPE handover_build_info gauge\n\
             handover_build_info{{version=\"{}\"}} 1\n",
            env!("CARGO_PKG_VERSION"),
        ))),
        _ => {
            let mut not_found = Response::new(Full::from("not found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}
