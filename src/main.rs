//! # OnAir Backend
//!
//! Live-broadcast control plane for a radio station:
//! - **session**: the single broadcast record and the presenter command FSM
//! - **fanout**: pushes every state change to connected listeners over SSE
//! - **conversion**: background transcoding of uploads browsers cannot play
//! - **websocket**: the presenter control channel
//!
//! Startup order matters: stores are opened, interrupted work is rehydrated,
//! and only then are the heartbeat and conversion worker spawned and the HTTP
//! server bound.

mod auth;
mod clock;
mod config;
mod conversion;
mod error;
mod fanout;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod storage;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::{AppState, Components};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting onair-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let components = Components::from_config(&config).await?;
    let (app_state, receiver) = AppState::new(config.clone(), components)?;

    let session = app_state.coordinator.rehydrate().await?;
    info!(status = %session.status, "broadcast session loaded");
    let resumed = app_state.conversions.rehydrate().await?;
    if resumed > 0 {
        info!(jobs = resumed, "resumed unfinished conversion jobs");
    }

    tokio::spawn(
        app_state
            .broadcaster
            .clone()
            .run_heartbeat(config.listeners.heartbeat_interval()),
    );
    tokio::spawn(app_state.conversions.clone().run(receiver));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestMetrics)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .service(
                        web::scope("/broadcast")
                            .route("/state", web::get().to(handlers::broadcast_state))
                            .route("/events", web::get().to(handlers::broadcast_events))
                            .route("/emergency-stop", web::post().to(handlers::emergency_stop)),
                    )
                    .route("/conversions", web::post().to(handlers::create_conversion))
                    .route("/conversions/{job_id}", web::get().to(handlers::get_conversion))
                    .route(
                        "/conversions/{job_id}/retry",
                        web::post().to(handlers::retry_conversion),
                    )
                    .route(
                        "/recordings/{recording_id}",
                        web::get().to(handlers::get_recording),
                    ),
            )
            .route("/ws/presenter", web::get().to(websocket::presenter_socket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onair_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
