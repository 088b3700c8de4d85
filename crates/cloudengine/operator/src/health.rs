use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use actix_web::{get, web::Data, App, HttpResponse, HttpServer, Responder};
use actix_web_opentelemetry::{RequestMetrics, RequestTracing};
use anyhow::{Context, Result};
use cloudengine_core::signal::FunctionSignal;
use tracing::{error, info, instrument, Level};

/// Flipped once the bootstrap barrier has been passed.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn mark_unready(&self) {
        self.0.store(false, Ordering::SeqCst)
    }
}

#[instrument(level = Level::INFO)]
#[get("/_health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[instrument(level = Level::INFO, skip_all)]
#[get("/readyz")]
async fn ready(readiness: Data<Readiness>) -> impl Responder {
    if readiness.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("not ready")
    }
}

pub async fn loop_forever(addr: SocketAddr, readiness: Readiness, signal: FunctionSignal) {
    if let Err(error) = try_loop_forever(addr, readiness).await {
        error!("failed to run http server: {error}");
        signal.terminate();
    }
}

async fn try_loop_forever(addr: SocketAddr, readiness: Readiness) -> Result<()> {
    let readiness = Data::new(readiness);

    info!("serving health checks on {addr}");
    let server = HttpServer::new(move || {
        let app = App::new().app_data(Data::clone(&readiness));
        let app = app.service(health).service(ready);
        app.wrap(RequestTracing::default())
            .wrap(RequestMetrics::default())
    })
    .bind(addr)
    .with_context(|| format!("failed to bind to {addr}"))?
    .run();
    server.await.map_err(Into::into)
}
