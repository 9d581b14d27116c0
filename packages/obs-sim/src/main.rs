//! main.rs — observatory device-fleet simulator.
//!
//! Runs one observation system's hardware against a live obsd instance:
//!   1. Mount: legacy fixed-field dialect on the mount port, answers slew
//!      and park with realistic SLEWING→TRACKING transitions
//!   2. Cameras: key-value dialect on the camera port, walk the
//!      IDLE→EXPOSE→COMPLETE cycle per expose command (cid 005 is the
//!      guide camera by the multiple-of-five convention)
//!   3. Environment: UDP wind/rain/cloud datagrams with a random walk,
//!      plus an optional storm that trips the wind limit
//!
//! Useful end to end: submit a plan through the client port and watch the
//! whole acquisition → slew → expose → readout sequence play out.

mod camera;
mod environment;
mod mount;

use clap::Parser;
use serde::Deserialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "obs-sim", about = "obsd device-fleet simulator")]
struct Args {
    /// Config file path (optional)
    #[arg(short, long)]
    config: Option<String>,
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Mount port
    #[arg(long, default_value = "4011")]
    mount_port: u16,
    /// Camera port
    #[arg(long, default_value = "4012")]
    camera_port: u16,
    /// Environment UDP port
    #[arg(long, default_value = "4015")]
    env_port: u16,
    /// Group id
    #[arg(long, default_value = "001")]
    gid: String,
    /// Unit id
    #[arg(long, default_value = "001")]
    uid: String,
    /// Number of cameras (first one is the guide camera, cid 005)
    #[arg(long, default_value = "4")]
    cameras: usize,
    /// Time compression factor (2.0 = exposures run twice as fast)
    #[arg(long, default_value = "1.0")]
    speed: f64,
    /// Blow a storm after 60 s (wind beyond any sane limit)
    #[arg(long)]
    storm: bool,
    /// Skip the environment emitter
    #[arg(long)]
    no_env: bool,
}

/// Optional TOML overrides, same knobs as the CLI.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    host: Option<String>,
    gid: Option<String>,
    uid: Option<String>,
    cameras: Option<usize>,
    speed: Option<f64>,
    slew_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub host: String,
    pub mount_port: u16,
    pub camera_port: u16,
    pub env_port: u16,
    pub gid: String,
    pub uid: String,
    pub cameras: usize,
    pub speed: f64,
    pub slew_secs: f64,
    pub storm: bool,
}

fn camera_cids(n: usize) -> Vec<String> {
    // cid 005 is the guide (FFoV) camera; the joint cameras count from 011
    let mut cids = vec!["005".to_string()];
    for i in 0..n.saturating_sub(1) {
        cids.push(format!("{:03}", 11 + i));
    }
    cids
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obs_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let file: FileConfig = match &args.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => FileConfig::default(),
    };
    let cfg = SimConfig {
        host: file.host.unwrap_or(args.host),
        mount_port: args.mount_port,
        camera_port: args.camera_port,
        env_port: args.env_port,
        gid: file.gid.unwrap_or(args.gid),
        uid: file.uid.unwrap_or(args.uid),
        cameras: file.cameras.unwrap_or(args.cameras),
        speed: file.speed.unwrap_or(args.speed),
        slew_secs: file.slew_secs.unwrap_or(8.0),
        storm: args.storm,
    };

    info!(
        "obs-sim starting: unit {}:{} with {} cameras against {}",
        cfg.gid, cfg.uid, cfg.cameras, cfg.host
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(mount::run(cfg.clone())));
    for cid in camera_cids(cfg.cameras) {
        tasks.push(tokio::spawn(camera::run(cfg.clone(), cid)));
    }
    if !args.no_env {
        tasks.push(tokio::spawn(environment::run(cfg.clone())));
    }

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
