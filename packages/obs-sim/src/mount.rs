//! Legacy-mount endpoint: speaks the fixed-field dialect, answers pointing
//! commands with a timed SLEWING→TRACKING transition and streams position
//! and clock reports the way the real firmware does.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

use obs_wire::MountState;

use crate::SimConfig;

#[derive(Debug)]
enum Command {
    Slew { ra: f64, dec: f64 },
    Park,
    AbortSlew,
    Sync { ra: f64, dec: f64 },
    Guide { d_ra: f64, d_dec: f64 },
}

/// Parse one downstream fixed-field command frame (`g#<gid><uid>…%`).
fn parse_command(line: &str, gid: &str, uid: &str) -> Option<Command> {
    let body = line.strip_prefix("g#")?.trim_end_matches('%');
    let body = body.strip_prefix(gid)?.strip_prefix(uid)?;
    if let Some(rest) = body.strip_prefix("slew") {
        let (ra, dec) = parse_scaled_pair(rest, 1e-4)?;
        Some(Command::Slew { ra, dec })
    } else if let Some(rest) = body.strip_prefix("sync") {
        let (ra, dec) = parse_scaled_pair(rest, 1e-4)?;
        Some(Command::Sync { ra, dec })
    } else if let Some(rest) = body.strip_prefix("guide") {
        let (d_ra, d_dec) = parse_scaled_pair(rest, 1.0 / 3600.0)?;
        Some(Command::Guide { d_ra, d_dec })
    } else if body.starts_with("park") {
        Some(Command::Park)
    } else if body.starts_with("abortslew") {
        Some(Command::AbortSlew)
    } else {
        None
    }
}

fn parse_scaled_pair(rest: &str, scale: f64) -> Option<(f64, f64)> {
    let (a, b) = rest.split_once('%')?;
    let a: i64 = a.parse().ok()?;
    let b: i64 = b.trim_end_matches('%').parse().ok()?;
    Some((a as f64 * scale, b as f64 * scale))
}

struct MountSim {
    state: MountState,
    ra: f64,
    dec: f64,
    target: Option<(f64, f64)>,
    slew_deadline: Option<Instant>,
}

impl MountSim {
    fn new() -> Self {
        Self {
            state: MountState::Freeze,
            ra: 0.0,
            dec: 0.0,
            target: None,
            slew_deadline: None,
        }
    }

    fn apply(&mut self, cmd: Command, slew_secs: f64) {
        match cmd {
            Command::Slew { ra, dec } => {
                info!("mount: slewing to <{ra:.4}, {dec:.4}>");
                self.target = Some((ra, dec));
                self.state = MountState::Slewing;
                self.slew_deadline = Some(Instant::now() + Duration::from_secs_f64(slew_secs));
            }
            Command::Park => {
                info!("mount: parking");
                self.target = Some((0.0, -89.0));
                self.state = MountState::Parking;
                self.slew_deadline = Some(Instant::now() + Duration::from_secs_f64(slew_secs));
            }
            Command::AbortSlew => {
                info!("mount: slew aborted");
                self.target = None;
                self.slew_deadline = None;
                self.state = MountState::Freeze;
            }
            Command::Sync { ra, dec } => {
                info!("mount: zero point synced at <{ra:.4}, {dec:.4}>");
                self.ra = ra;
                self.dec = dec;
            }
            Command::Guide { d_ra, d_dec } => {
                self.ra += d_ra;
                self.dec += d_dec;
            }
        }
    }

    /// Advance the motion model; `true` when the state flipped.
    fn tick(&mut self) -> bool {
        if let (Some(deadline), Some((ra, dec))) = (self.slew_deadline, self.target) {
            if Instant::now() >= deadline {
                self.ra = ra;
                self.dec = dec;
                self.slew_deadline = None;
                self.state = match self.state {
                    MountState::Parking => MountState::Parked,
                    _ => MountState::Tracking,
                };
                info!("mount: arrived, now {}", self.state.name());
                return true;
            }
            // crude linear approach toward the target
            self.ra += (ra - self.ra) * 0.3;
            self.dec += (dec - self.dec) * 0.3;
        }
        false
    }
}

pub async fn run(cfg: SimConfig) {
    let addr = format!("{}:{}", cfg.host, cfg.mount_port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("mount: cannot connect {addr}: {e}");
            return;
        }
    };
    info!("mount: connected to {addr}");
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd).lines();

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);
    let gid = cfg.gid.clone();
    let uid = cfg.uid.clone();
    tokio::spawn(async move {
        while let Ok(Some(line)) = reader.next_line().await {
            match parse_command(&line, &gid, &uid) {
                Some(cmd) => {
                    let _ = cmd_tx.send(cmd).await;
                }
                None => warn!("mount: unrecognized command {line:?}"),
            }
        }
    });

    let mut sim = MountSim::new();
    let mut report = interval(Duration::from_secs_f64(1.0 / cfg.speed.max(0.1)));
    let mut clock = interval(Duration::from_secs(10));

    // announce readiness and the initial state
    let hello = format!(
        "g#{}{}ready1%\ng#{}{}status{}%\n",
        cfg.gid, cfg.uid, cfg.gid, cfg.uid, sim.state as i8
    );
    if wr.write_all(hello.as_bytes()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let old = sim.state;
                sim.apply(cmd, cfg.slew_secs / cfg.speed.max(0.1));
                if sim.state != old {
                    let line = format!("g#{}{}status{}%\n", cfg.gid, cfg.uid, sim.state as i8);
                    if wr.write_all(line.as_bytes()).await.is_err() { break; }
                }
            }
            _ = report.tick() => {
                let changed = sim.tick();
                let mut out = format!(
                    "g#{}{}currentpos{:07}%{:+07}%\n",
                    cfg.gid, cfg.uid,
                    (sim.ra * 1e4).round() as i64,
                    (sim.dec * 1e4).round() as i64,
                );
                if changed {
                    out.push_str(&format!("g#{}{}status{}%\n", cfg.gid, cfg.uid, sim.state as i8));
                }
                if wr.write_all(out.as_bytes()).await.is_err() { break; }
            }
            _ = clock.tick() => {
                let utc = Utc::now().format("%Y-%m-%d%%%H:%M:%S");
                let line = format!("g#{}{}utc{utc}%\n", cfg.gid, cfg.uid);
                if wr.write_all(line.as_bytes()).await.is_err() { break; }
            }
        }
    }
    info!("mount: link closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_scaling() {
        match parse_command("g#001001slew1801234%-300500%", "001", "001") {
            Some(Command::Slew { ra, dec }) => {
                assert!((ra - 180.1234).abs() < 1e-9);
                assert!((dec + 30.05).abs() < 1e-9);
            }
            other => panic!("wrong parse: {other:?}"),
        }
        match parse_command("g#001001guide+0036%-0072%", "001", "001") {
            Some(Command::Guide { d_ra, d_dec }) => {
                assert!((d_ra - 0.01).abs() < 1e-9);
                assert!((d_dec + 0.02).abs() < 1e-9);
            }
            other => panic!("wrong parse: {other:?}"),
        }
        assert!(matches!(parse_command("g#001001park%", "001", "001"), Some(Command::Park)));
        assert!(parse_command("g#002001park%", "001", "001").is_none());
    }
}
