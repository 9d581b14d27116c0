//! obsd — central control daemon of a robotic observatory federation.
//!
//! Five TCP listeners accept operator clients, mounts, cameras and the two
//! annex device classes; a UDP socket ingests environment samples; an HTTP
//! endpoint exposes health and a live status snapshot. Everything else is
//! routing, scheduling and per-unit state machines.

mod astro;
mod config;
mod db;
mod devices;
mod environment;
mod federation;
mod journal;
mod net;
mod obss;
mod plans;
mod skylight;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::json;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

use config::Config;
use federation::Federation;
use journal::JournalEvent;
use net::PeerClass;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

#[derive(Parser, Debug)]
#[command(name = "obsd", about = "Observatory federation control daemon")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "obsd.toml")]
    config: String,
    /// Write a default configuration file and exit
    #[arg(short = 'd', long)]
    default_config: bool,
}

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

async fn status(State(fed): State<Arc<Federation>>) -> axum::Json<serde_json::Value> {
    axum::Json(fed.status_json().await)
}

async fn bind_tcp(port: u16, what: &str) -> TcpListener {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {what} port {port}: {e}");
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.default_config {
        match Config::write_default(&args.config) {
            Ok(()) => {
                println!("wrote default configuration to {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obsd=info".into()),
        )
        .init();

    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };
    info!(
        "obsd v{} starting — {} observation group(s) configured",
        env!("CARGO_PKG_VERSION"),
        cfg.observation_system.len()
    );
    if cfg.ntp.enable {
        info!("clock discipline against {} delegated to the external agent", cfg.ntp.host);
    }

    let (fed, router_rx) = Federation::new(cfg.clone());
    fed.journal
        .append(
            JournalEvent::Session,
            json!({ "event": "start", "version": env!("CARGO_PKG_VERSION") }),
        )
        .await;

    // listeners come up before anything else; a busy port aborts startup
    let ports = &cfg.server;
    let client_l = bind_tcp(ports.client_port, "client").await;
    let mount_l = bind_tcp(ports.mount_port, "mount").await;
    let camera_l = bind_tcp(ports.camera_port, "camera").await;
    let mount_annex_l = bind_tcp(ports.mount_annex_port, "mount-annex").await;
    let camera_annex_l = bind_tcp(ports.camera_annex_port, "camera-annex").await;
    let env_socket = match UdpSocket::bind(("0.0.0.0", ports.environment_port)).await {
        Ok(s) => {
            info!("environment ingest on UDP {}", ports.environment_port);
            s
        }
        Err(e) => {
            error!("cannot bind environment port {}: {e}", ports.environment_port);
            std::process::exit(2);
        }
    };

    tokio::spawn(fed.clone().run_router(router_rx));
    tokio::spawn(net::run_listener(client_l, PeerClass::Client, fed.sink(), fed.registry.clone()));
    tokio::spawn(net::run_listener(mount_l, PeerClass::Mount, fed.sink(), fed.registry.clone()));
    tokio::spawn(net::run_listener(camera_l, PeerClass::Camera, fed.sink(), fed.registry.clone()));
    tokio::spawn(net::run_listener(
        mount_annex_l,
        PeerClass::MountAnnex,
        fed.sink(),
        fed.registry.clone(),
    ));
    tokio::spawn(net::run_listener(
        camera_annex_l,
        PeerClass::CameraAnnex,
        fed.sink(),
        fed.registry.clone(),
    ));
    tokio::spawn(net::run_sweeper(fed.registry.clone()));
    tokio::spawn(environment::run_udp(env_socket, fed.clone()));
    tokio::spawn(skylight::run(fed.clone()));
    tokio::spawn(fed.clone().run_plan_sweeper());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .with_state(fed.clone());
    let status_addr = format!("0.0.0.0:{}", ports.status_port);
    let listener = match TcpListener::bind(&status_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind status port {}: {e}", ports.status_port);
            std::process::exit(2);
        }
    };
    info!("status endpoint on http://{status_addr}");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    if let Err(e) = serve.await {
        error!("status server failed: {e}");
    }

    fed.shutdown().await;
    fed.journal.append(JournalEvent::Session, json!({ "event": "stop" })).await;
    info!("obsd shut down");
}
