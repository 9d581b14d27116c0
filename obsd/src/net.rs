//! TCP front: five peer-class listeners, framed read loops, bounded
//! outbound rings, and the periodic connection sweep.
//!
//! The read loop is the hot path and does only line extraction, buffer
//! accounting and a post into the current frame sink. Decoding and routing
//! happen behind the sink — the federation's mailbox, or an observation
//! system's own mailbox once a point-to-point coupling has transferred
//! ownership of the stream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use obs_wire::MAX_FRAME;

/// Remote peer classification, fixed by the listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerClass {
    Client,
    Mount,
    Camera,
    MountAnnex,
    CameraAnnex,
}

impl PeerClass {
    pub fn name(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Mount => "mount",
            Self::Camera => "camera",
            Self::MountAnnex => "mount-annex",
            Self::CameraAnnex => "camera-annex",
        }
    }
}

/// What a read loop posts into its sink.
#[derive(Debug)]
pub enum Inbound {
    Frame { conn: ConnHandle, line: String },
    Closed { conn: ConnHandle },
}

pub type FrameSink = mpsc::Sender<Inbound>;
pub type ConnHandle = Arc<Connection>;

/// Outbound ring: roughly ten wire frames per connection.
const OUTBOX_CAP: usize = 10;

/// One accepted socket. Writers enqueue into the bounded ring; when it is
/// full the oldest non-critical frame is dropped with a fault, while
/// critical control (abort, park, slit close) jumps the queue.
pub struct Connection {
    pub id: Uuid,
    pub peer: PeerClass,
    pub remote: SocketAddr,
    sink: RwLock<FrameSink>,
    outbox: Mutex<VecDeque<(Bytes, bool)>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Connection {
    fn new(peer: PeerClass, remote: SocketAddr, sink: FrameSink) -> ConnHandle {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            remote,
            sink: RwLock::new(sink),
            outbox: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn send(&self, frame: Bytes) {
        self.push(frame, false);
    }

    /// Critical control preempts the ring and is never the drop victim.
    pub fn send_critical(&self, frame: Bytes) {
        self.push(frame, true);
    }

    fn push(&self, frame: Bytes, critical: bool) {
        if self.is_closed() {
            return;
        }
        let mut outbox = self.outbox.lock().unwrap();
        if outbox.len() >= OUTBOX_CAP {
            if let Some(victim) = outbox.iter().position(|(_, c)| !c) {
                outbox.remove(victim);
                warn!(conn = %self.id, peer = self.peer.name(),
                      "outbound ring full, dropped oldest frame");
            } else if !critical {
                warn!(conn = %self.id, peer = self.peer.name(),
                      "outbound ring full of critical frames, dropped new frame");
                return;
            }
        }
        if critical {
            outbox.push_front((frame, true));
        } else {
            outbox.push_back((frame, false));
        }
        drop(outbox);
        self.notify.notify_one();
    }

    /// Swap the frame sink: a point-to-point coupling hands the stream to
    /// the observation system. One-way, done once at couple time.
    pub fn redirect(&self, sink: FrameSink) {
        *self.sink.write().unwrap() = sink;
    }

    fn current_sink(&self) -> FrameSink {
        self.sink.read().unwrap().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({}, {}, {})", self.peer.name(), self.id, self.remote)
    }
}

// ── Registry & sweep ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ConnRegistry {
    conns: Mutex<Vec<ConnHandle>>,
}

impl ConnRegistry {
    pub fn add(&self, conn: ConnHandle) {
        self.conns.lock().unwrap().push(conn);
    }

    /// Drop closed sockets from the buffer list.
    pub fn sweep(&self) -> usize {
        let mut conns = self.conns.lock().unwrap();
        let before = conns.len();
        conns.retain(|c| !c.is_closed());
        before - conns.len()
    }

    pub fn count(&self, peer: PeerClass) -> usize {
        self.conns.lock().unwrap().iter().filter(|c| c.peer == peer && !c.is_closed()).count()
    }
}

/// Registered operator/database clients and their id filters, for status
/// fanout. A client registers with `(gid, uid)` wildcards and afterwards
/// receives every status frame whose unit matches.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<(ConnHandle, obs_wire::DeviceAddr)>>,
}

impl ClientRegistry {
    pub fn register(&self, conn: ConnHandle, filter: obs_wire::DeviceAddr) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|(c, _)| c.id != conn.id && !c.is_closed());
        clients.push((conn, filter));
    }

    pub fn unregister(&self, conn: &ConnHandle) {
        self.clients.lock().unwrap().retain(|(c, _)| c.id != conn.id);
    }

    pub fn broadcast(&self, gid: &str, uid: &str, frame: Bytes) {
        let clients = self.clients.lock().unwrap();
        for (conn, filter) in clients.iter() {
            if filter.matches_unit(gid, uid) {
                conn.send(frame.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn run_sweeper(registry: Arc<ConnRegistry>) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tick.tick().await;
        let dropped = registry.sweep();
        if dropped > 0 {
            debug!("connection sweep removed {dropped} closed sockets");
        }
    }
}

// ── Accept & serve ───────────────────────────────────────────────────────────

pub async fn run_listener(
    listener: TcpListener,
    peer: PeerClass,
    sink: FrameSink,
    registry: Arc<ConnRegistry>,
) {
    info!(peer = peer.name(), addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
          "listening");
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(peer = peer.name(), %remote, "accepted");
                let conn = Connection::new(peer, remote, sink.clone());
                registry.add(conn.clone());
                let (rd, wr) = stream.into_split();
                tokio::spawn(run_writer(wr, conn.clone()));
                tokio::spawn(run_reader(rd, conn));
            }
            Err(e) => {
                // transient accept errors must not kill the listener
                warn!(peer = peer.name(), "accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_writer(mut wr: OwnedWriteHalf, conn: ConnHandle) {
    loop {
        let frame = {
            let mut outbox = conn.outbox.lock().unwrap();
            outbox.pop_front()
        };
        match frame {
            Some((bytes, _)) => {
                if let Err(e) = wr.write_all(&bytes).await {
                    debug!(conn = %conn.id, "write failed: {e}");
                    conn.close();
                    return;
                }
            }
            None => {
                if conn.is_closed() {
                    let _ = wr.shutdown().await;
                    return;
                }
                conn.notify.notified().await;
            }
        }
    }
}

async fn run_reader(mut rd: OwnedReadHalf, conn: ConnHandle) {
    let mut buf = BytesMut::with_capacity(2 * MAX_FRAME);
    loop {
        if conn.is_closed() {
            break;
        }
        match rd.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    if pos + 1 > MAX_FRAME {
                        warn!(conn = %conn.id, peer = conn.peer.name(),
                              "oversize frame ({} bytes), closing", pos + 1);
                        conn.close();
                        deliver_closed(&conn).await;
                        return;
                    }
                    let raw = buf.split_to(pos + 1);
                    let line = String::from_utf8_lossy(&raw[..pos]).into_owned();
                    if line.is_empty() {
                        continue;
                    }
                    let sink = conn.current_sink();
                    if sink.send(Inbound::Frame { conn: conn.clone(), line }).await.is_err() {
                        conn.close();
                        return;
                    }
                }
                if buf.len() > MAX_FRAME {
                    warn!(conn = %conn.id, peer = conn.peer.name(),
                          "{} unterminated bytes, closing", buf.len());
                    conn.close();
                    deliver_closed(&conn).await;
                    return;
                }
            }
            Err(e) => {
                debug!(conn = %conn.id, "read failed: {e}");
                break;
            }
        }
    }
    conn.close();
    deliver_closed(&conn).await;
}

async fn deliver_closed(conn: &ConnHandle) {
    let sink = conn.current_sink();
    let _ = sink.send(Inbound::Closed { conn: conn.clone() }).await;
}

/// Detached connection for unit tests: frames pile up in the outbox where
/// assertions can read them.
#[cfg(test)]
pub(crate) fn test_conn(peer: PeerClass) -> (ConnHandle, mpsc::Receiver<Inbound>) {
    let (tx, rx) = mpsc::channel(8);
    let conn = Connection::new(peer, "127.0.0.1:0".parse().unwrap(), tx);
    (conn, rx)
}

#[cfg(test)]
impl Connection {
    /// Drain queued outbound frames for assertions.
    pub(crate) fn take_outbox(&self) -> Vec<Bytes> {
        self.outbox.lock().unwrap().drain(..).map(|(b, _)| b).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn dummy_conn() -> (ConnHandle, mpsc::Receiver<Inbound>) {
        test_conn(PeerClass::Camera)
    }

    #[test]
    fn ring_drops_oldest_non_critical_when_full() {
        let (conn, _rx) = dummy_conn();
        for i in 0..OUTBOX_CAP {
            conn.send(Bytes::from(format!("frame-{i}\n")));
        }
        conn.send(Bytes::from_static(b"overflow\n"));
        let outbox = conn.outbox.lock().unwrap();
        assert_eq!(outbox.len(), OUTBOX_CAP);
        // frame-0 was the drop victim
        assert_eq!(&outbox.front().unwrap().0[..], b"frame-1\n");
        assert_eq!(&outbox.back().unwrap().0[..], b"overflow\n");
    }

    #[test]
    fn critical_preempts_the_ring() {
        let (conn, _rx) = dummy_conn();
        for i in 0..OUTBOX_CAP {
            conn.send(Bytes::from(format!("frame-{i}\n")));
        }
        conn.send_critical(Bytes::from_static(b"park\n"));
        let outbox = conn.outbox.lock().unwrap();
        assert_eq!(&outbox.front().unwrap().0[..], b"park\n");
        assert_eq!(outbox.len(), OUTBOX_CAP);
    }

    #[tokio::test]
    async fn frames_round_trip_and_oversize_closes() {
        let (tx, mut rx) = mpsc::channel(64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ConnRegistry::default());
        tokio::spawn(run_listener(listener, PeerClass::Camera, tx, registry.clone()));

        let mut peer = TcpStream::connect(addr).await.unwrap();
        // a frame of exactly MAX_FRAME bytes (terminator included) passes
        let mut big = vec![b'a'; MAX_FRAME - 1];
        big.push(b'\n');
        peer.write_all(&big).await.unwrap();
        match rx.recv().await.unwrap() {
            Inbound::Frame { line, .. } => assert_eq!(line.len(), MAX_FRAME - 1),
            other => panic!("expected frame, got {other:?}"),
        }

        // one more byte without a terminator closes the connection
        let oversize = vec![b'b'; MAX_FRAME + 1];
        peer.write_all(&oversize).await.unwrap();
        match rx.recv().await.unwrap() {
            Inbound::Closed { conn } => assert!(conn.is_closed()),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_removes_closed_connections() {
        let registry = Arc::new(ConnRegistry::default());
        let (conn, _rx) = dummy_conn();
        registry.add(conn.clone());
        assert_eq!(registry.sweep(), 0);
        conn.close();
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.count(PeerClass::Camera), 0);
    }
}
