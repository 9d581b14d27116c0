//! Camera endpoint: key-value dialect, one connection per camera. Walks the
//! IDLE→EXPOSE→COMPLETE→IDLE cycle on expose commands; in flat runs it
//! parks in WAIT_FLAT between frames so the daemon's re-slew logic gets
//! exercised.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use obs_wire::kv::{self, CameraReport, KvBody, KvFrame};
use obs_wire::{CameraState, DeviceAddr, ExposeCommand, ImageType};

use crate::SimConfig;

struct Exposure {
    imgtype: ImageType,
    filter: String,
    expdur: f64,
    frmcnt: i32,
}

impl Default for Exposure {
    fn default() -> Self {
        Self { imgtype: ImageType::Object, filter: String::new(), expdur: 1.0, frmcnt: 1 }
    }
}

async fn report(
    wr: &mut OwnedWriteHalf,
    enc: &kv::Encoder,
    addr: &DeviceAddr,
    state: CameraState,
    program: &Exposure,
    frmnum: i32,
) -> bool {
    let body = KvBody::Camera(CameraReport {
        state,
        imgtype: Some(program.imgtype),
        frmnum,
        frmtot: program.frmcnt,
        filter: program.filter.clone(),
        coolget: Some(-60.0),
        freedisk: Some(512_000),
        filename: String::new(),
    });
    wr.write_all(&enc.compact(addr.clone(), body)).await.is_ok()
}

pub async fn run(cfg: SimConfig, cid: String) {
    let addr = format!("{}:{}", cfg.host, cfg.camera_port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%cid, "camera: cannot connect {addr}: {e}");
            return;
        }
    };
    info!(%cid, "camera: connected to {addr}");
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd).lines();
    let enc = kv::Encoder::new();
    let my_addr = DeviceAddr::new(cfg.gid.clone(), cfg.uid.clone(), cid.clone());

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<KvFrame>(16);
    tokio::spawn(async move {
        while let Ok(Some(line)) = reader.next_line().await {
            match kv::resolve(&line) {
                Ok(frame) => {
                    let _ = cmd_tx.send(frame).await;
                }
                Err(e) => warn!("camera: bad frame: {e}"),
            }
        }
    });

    let mut program = Exposure::default();
    if !report(&mut wr, &enc, &my_addr, CameraState::Idle, &program, 0).await {
        return;
    }

    'outer: loop {
        // idle: wait for a target descriptor or an expose command
        let frame = match cmd_rx.recv().await {
            Some(f) => f,
            None => break,
        };
        match frame.body {
            KvBody::Object(obj) => {
                program = Exposure {
                    imgtype: obj.imgtype,
                    filter: obj.filter,
                    expdur: obj.expdur.max(0.01),
                    frmcnt: obj.frmcnt.max(1),
                };
                info!(%cid, imgtype = program.imgtype.name(), frmcnt = program.frmcnt,
                      "camera: program loaded");
            }
            KvBody::Expose { command: ExposeCommand::Start } => {
                // run the frame loop, watching for a stop in between
                for frame_no in 1..=program.frmcnt {
                    if !report(&mut wr, &enc, &my_addr, CameraState::Exposing, &program, frame_no)
                        .await
                    {
                        break 'outer;
                    }
                    let exposure = Duration::from_secs_f64(program.expdur / cfg.speed.max(0.1));
                    tokio::select! {
                        _ = tokio::time::sleep(exposure) => {}
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(f) if matches!(f.body,
                                    KvBody::Expose { command: ExposeCommand::Stop }) => {
                                    info!(%cid, "camera: exposure aborted");
                                    report(&mut wr, &enc, &my_addr, CameraState::Aborted,
                                           &program, frame_no).await;
                                    report(&mut wr, &enc, &my_addr, CameraState::Idle,
                                           &program, frame_no).await;
                                    continue 'outer;
                                }
                                Some(_) => {}
                                None => break 'outer,
                            }
                        }
                    }
                    if !report(&mut wr, &enc, &my_addr, CameraState::Complete, &program, frame_no)
                        .await
                    {
                        break 'outer;
                    }
                    // flats pause between frames until the mount re-points
                    if program.imgtype == ImageType::Flat && frame_no < program.frmcnt {
                        if !report(&mut wr, &enc, &my_addr, CameraState::WaitFlat, &program, frame_no)
                            .await
                        {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                }
                info!(%cid, "camera: sequence complete");
                if !report(&mut wr, &enc, &my_addr, CameraState::Idle, &program, program.frmcnt)
                    .await
                {
                    break;
                }
            }
            KvBody::Expose { .. } | KvBody::AbortImage => {
                report(&mut wr, &enc, &my_addr, CameraState::Idle, &program, 0).await;
            }
            KvBody::Focus { position } => {
                info!(%cid, position, "camera: focus update noted");
            }
            _ => {}
        }
    }
    info!(%cid, "camera: link closed");
}
