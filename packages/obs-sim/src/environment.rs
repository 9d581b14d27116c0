//! Environment emitter: wind / cloud / rainfall samples over UDP with a
//! gentle random walk. The storm flag winds the breeze up past any sane
//! observing limit after a minute, which should close the slits.

use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

use obs_wire::kv::{self, KvBody};
use obs_wire::DeviceAddr;

use crate::SimConfig;

pub async fn run(cfg: SimConfig) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("environment: cannot bind: {e}");
            return;
        }
    };
    let target = format!("{}:{}", cfg.host, cfg.env_port);
    info!("environment: emitting to {target}");

    let enc = kv::Encoder::new();
    let addr = DeviceAddr::new(cfg.gid.clone(), "", "");
    let started = Instant::now();
    let mut tick = interval(Duration::from_secs(5));
    let mut wind: f64 = 4.0;
    let mut cloud: f64 = 15.0;

    loop {
        tick.tick().await;
        {
            let mut rng = rand::thread_rng();
            wind = (wind + rng.gen_range(-1.5..1.5)).clamp(0.0, 25.0);
            cloud = (cloud + rng.gen_range(-5.0..5.0)).clamp(0.0, 100.0);
        }
        if cfg.storm && started.elapsed() > Duration::from_secs(60) {
            wind = wind.max(20.0);
        }
        let direction = rand::thread_rng().gen_range(0.0..360.0);

        let frames = [
            enc.compact(addr.clone(), KvBody::Wind { speed: round1(wind), direction: round1(direction) }),
            enc.compact(addr.clone(), KvBody::Cloud { percent: round1(cloud) }),
            enc.compact(addr.clone(), KvBody::Rainfall { rainy: false }),
        ];
        for frame in frames {
            if let Err(e) = socket.send_to(&frame, &target).await {
                warn!("environment: send failed: {e}");
            }
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
